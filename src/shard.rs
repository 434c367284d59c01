// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Single-threaded shard workers.
//!
//! Each [`ShardWorker`] owns one thread that pops [`TransferRequest`]s from an
//! unbounded FIFO queue and runs them one at a time. Two requests touching the
//! same shard therefore never overlap; parallelism only exists across shards.
//!
//! ```text
//!   Idle ──submit──► Draining ──queue empty──► Idle
//!     │                  │
//!     └──────stop────────┴──► Stopped
//! ```
//!
//! | Kind | Transport calls | On success |
//! |------|-----------------|------------|
//! | Local | transfer to source, wait for destination ack | `local_transfers += 1` |
//! | Step1 | debit to source (no wait) | router triggers Step2 |
//! | Step2 | credit to destination, wait for ack | `cross_shard_transfers += 1`, context released |
//!
//! Any error is turned into `failures += 1` and a log line; the loop keeps going.

use crate::base::{CorrelationId, LogicalTime, ShardId};
use crate::clock::LamportClock;
use crate::error::TaskError;
use crate::message::Instruction;
use crate::router::CrossShardCallback;
use crate::transfer::{TransferKind, TransferRequest};
use crate::transport::Transport;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counts tasks that were submitted but have not finished executing.
///
/// Unlike a queue-depth check, a task stays counted while it runs, so
/// reaching zero means every side effect of every task has happened.
#[derive(Debug, Default)]
pub struct TaskCounter {
    pending: Mutex<usize>,
    drained: Condvar,
}

impl TaskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        *self.pending.lock() += 1;
    }

    pub fn finish(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Blocks until the count reaches zero.
    pub fn wait_idle(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.drained.wait(&mut pending);
        }
    }

    /// Returns `false` if the count is still non-zero after `timeout`.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            if self.drained.wait_for(&mut pending, timeout).timed_out() {
                return *pending == 0;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Draining,
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

/// Per-shard counters. Only ever increase.
#[derive(Debug, Default)]
pub struct ShardStatistics {
    accepted: AtomicU64,
    local_transfers: AtomicU64,
    cross_shard_transfers: AtomicU64,
    failures: AtomicU64,
}

impl ShardStatistics {
    pub fn snapshot(&self, shard: ShardId) -> ShardSnapshot {
        ShardSnapshot {
            shard,
            accepted: self.accepted.load(Ordering::SeqCst),
            local_transfers: self.local_transfers.load(Ordering::SeqCst),
            cross_shard_transfers: self.cross_shard_transfers.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of [`ShardStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardSnapshot {
    pub shard: ShardId,
    pub accepted: u64,
    pub local_transfers: u64,
    pub cross_shard_transfers: u64,
    pub failures: u64,
}

enum ShardCommand {
    Run(TransferRequest),
    Shutdown,
}

#[derive(Debug)]
struct ShardShared {
    id: ShardId,
    stats: ShardStatistics,
    pending: TaskCounter,
    state: AtomicU8,
}

impl ShardShared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Handle to a shard's worker thread.
pub struct ShardWorker {
    shared: Arc<ShardShared>,
    /// Holds `true` once shutdown was requested. Submissions take this lock
    /// so nothing can be queued behind the shutdown marker.
    gate: Mutex<bool>,
    sender: Sender<ShardCommand>,
    global: Arc<TaskCounter>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ShardWorker {
    /// Starts a worker thread for `id`. Every task is also counted in
    /// `global`.
    ///
    /// `router` is only used by Step1 and Step2 tasks; the worker never keeps
    /// the router alive.
    pub(crate) fn spawn(
        id: ShardId,
        clock: Arc<LamportClock>,
        transport: Arc<dyn Transport>,
        router: Weak<dyn CrossShardCallback>,
        global: Arc<TaskCounter>,
    ) -> io::Result<Self> {
        let shared = Arc::new(ShardShared {
            id,
            stats: ShardStatistics::default(),
            pending: TaskCounter::new(),
            state: AtomicU8::new(WorkerState::Idle as u8),
        });
        let (sender, receiver) = channel::unbounded();

        let runtime = ShardRuntime {
            shared: Arc::clone(&shared),
            clock,
            transport,
            router,
            global: Arc::clone(&global),
        };
        let handle = thread::Builder::new()
            .name(format!("ledger-shard-{id}"))
            .spawn(move || runtime.run(receiver))?;

        debug!(shard = %id, "shard worker started");
        Ok(Self {
            shared,
            gate: Mutex::new(false),
            sender,
            global,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> ShardId {
        self.shared.id
    }

    /// Enqueues a task. Never blocks on the worker.
    ///
    /// Tasks submitted after [`stop`](Self::stop) are dropped with a warning.
    pub fn submit(&self, request: TransferRequest) {
        let stopped = self.gate.lock();
        if *stopped {
            warn!(
                shard = %self.shared.id,
                kind = ?request.kind,
                correlation = %request.correlation_id,
                "shard is stopped, dropping task"
            );
            return;
        }

        self.shared.pending.begin();
        self.global.begin();
        if self.sender.send(ShardCommand::Run(request)).is_err() {
            // Worker thread is gone.
            self.shared.pending.finish();
            self.global.finish();
            warn!(shard = %self.shared.id, "shard worker exited, dropping task");
            return;
        }
        self.shared.stats.accepted.fetch_add(1, Ordering::SeqCst);
        debug!(
            shard = %self.shared.id,
            kind = ?request.kind,
            source = %request.source(),
            destination = %request.destination(),
            "task queued"
        );
    }

    /// Blocks until every submitted task has finished executing, including
    /// the one currently running.
    pub fn await_idle(&self) {
        self.shared.pending.wait_idle();
    }

    /// Bounded [`await_idle`](Self::await_idle). Returns `true` if idle.
    pub fn await_idle_timeout(&self, timeout: Duration) -> bool {
        self.shared.pending.wait_idle_timeout(timeout)
    }

    /// Tasks waiting in the queue, not counting one being executed.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Tasks submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.pending()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn statistics(&self) -> ShardSnapshot {
        self.shared.stats.snapshot(self.shared.id)
    }

    /// Requests shutdown and waits for the thread to exit. Tasks queued
    /// before the call are drained first. Idempotent.
    pub fn stop(&self) {
        {
            let mut stopped = self.gate.lock();
            if !*stopped {
                *stopped = true;
                let _ = self.sender.send(ShardCommand::Shutdown);
            }
        }

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        // The last router handle may be dropped from a worker thread.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(shard = %self.shared.id, "shard worker panicked");
        }
    }
}

impl Drop for ShardWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Thread-side state of a worker.
struct ShardRuntime {
    shared: Arc<ShardShared>,
    clock: Arc<LamportClock>,
    transport: Arc<dyn Transport>,
    router: Weak<dyn CrossShardCallback>,
    global: Arc<TaskCounter>,
}

impl ShardRuntime {
    fn run(self, commands: Receiver<ShardCommand>) {
        while let Ok(command) = commands.recv() {
            match command {
                ShardCommand::Run(request) => {
                    self.shared.set_state(WorkerState::Draining);
                    self.process(&request);
                    if commands.is_empty() {
                        self.shared.set_state(WorkerState::Idle);
                    }
                    self.shared.pending.finish();
                    self.global.finish();
                }
                ShardCommand::Shutdown => break,
            }
        }
        self.shared.set_state(WorkerState::Stopped);
        debug!(shard = %self.shared.id, "shard worker stopped");
    }

    fn process(&self, request: &TransferRequest) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match request.kind {
            TransferKind::Local => self.run_local(request),
            TransferKind::Step1 => self.run_step1(request),
            TransferKind::Step2 => self.run_step2(request),
        }))
        .unwrap_or(Err(TaskError::Panicked));

        if let Err(error) = outcome {
            self.shared.stats.failures.fetch_add(1, Ordering::SeqCst);
            error!(
                shard = %self.shared.id,
                kind = ?request.kind,
                source = %request.source(),
                destination = %request.destination(),
                amount = %request.amount(),
                correlation = %request.correlation_id,
                %error,
                "transfer failed"
            );
        }
    }

    fn run_local(&self, request: &TransferRequest) -> Result<(), TaskError> {
        let sent_at = self.clock.tick();
        self.transport.send_transfer(request.order, sent_at)?;
        self.await_ack(request, sent_at)?;

        self.shared.stats.local_transfers.fetch_add(1, Ordering::SeqCst);
        info!(
            shard = %self.shared.id,
            source = %request.source(),
            destination = %request.destination(),
            amount = %request.amount(),
            "local transfer completed"
        );
        Ok(())
    }

    fn run_step1(&self, request: &TransferRequest) -> Result<(), TaskError> {
        let sent_at = self.clock.tick();
        self.transport.send_debit(request.order, sent_at)?;
        info!(
            shard = %self.shared.id,
            source = %request.source(),
            destination = %request.destination(),
            amount = %request.amount(),
            correlation = %request.correlation_id,
            "cross-shard debit sent"
        );

        let router = self.router.upgrade().ok_or(TaskError::RouterUnavailable)?;
        // Unknown ids are logged and counted by the router.
        let _ = router.trigger_step2(request.correlation_id);
        Ok(())
    }

    fn run_step2(&self, request: &TransferRequest) -> Result<(), TaskError> {
        let sent_at = self.clock.tick();
        self.transport.send_credit(request.order, sent_at)?;
        self.await_ack(request, sent_at)?;

        self.shared
            .stats
            .cross_shard_transfers
            .fetch_add(1, Ordering::SeqCst);
        info!(
            shard = %self.shared.id,
            source = %request.source(),
            destination = %request.destination(),
            amount = %request.amount(),
            correlation = %request.correlation_id,
            "cross-shard credit completed"
        );
        self.release(request.correlation_id);
        Ok(())
    }

    /// Waits for the ack of the instruction issued at `sent_at`. Acks left
    /// over from earlier instructions that timed out are skipped.
    fn await_ack(&self, request: &TransferRequest, sent_at: LogicalTime) -> Result<(), TaskError> {
        let expected = Instruction::new(request.order, sent_at);
        loop {
            let reply = self.transport.await_acknowledgment(request.destination())?;
            self.clock.update(reply.local_time);
            if reply.acknowledges(&expected) {
                return Ok(());
            }
            match reply.instruction() {
                Some(stale) if reply.is_ack() => {
                    warn!(
                        shard = %self.shared.id,
                        account = %request.destination(),
                        issued_at = %stale.issued_at,
                        expected = %sent_at,
                        "late acknowledgment skipped"
                    );
                }
                _ => {
                    return Err(TaskError::MalformedAck {
                        account: request.destination(),
                        kind: reply.kind,
                    });
                }
            }
        }
    }

    fn release(&self, id: CorrelationId) {
        match self.router.upgrade() {
            Some(router) => router.release_context(id),
            None => warn!(correlation = %id, "router gone, context not released"),
        }
    }
}
