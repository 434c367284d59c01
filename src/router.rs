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

//! Shard routing and cross-shard coordination.
//!
//! The [`ShardRouter`] owns one [`ShardWorker`] per shard and assigns every
//! account to `account_id mod shard_count`.
//!
//! # Cross-Shard Protocol
//!
//! 1. Allocate a fresh [`CorrelationId`].
//! 2. Store a [`CrossShardContext`] under it, before anything is queued.
//! 3. Step1 debits the source on the source shard.
//! 4. The source shard calls [`trigger_step2`](ShardRouter::trigger_step2), which
//!    queues Step2 on the destination shard.
//! 5. Step2 credits the destination; on success the context is released.
//!
//! There is no rollback. If Step2 fails after Step1 debited the source, the
//! money stays debited and the context stays in the table. Both are visible
//! through [`pending_contexts`](ShardRouter::pending_contexts) and
//! [`stale_contexts`](ShardRouter::stale_contexts).

use crate::base::{AccountId, CorrelationId, ShardId};
use crate::clock::LamportClock;
use crate::correlation::CorrelationTable;
use crate::error::RouterError;
use crate::shard::{ShardSnapshot, ShardWorker, TaskCounter};
use crate::transfer::{CrossShardContext, TransferKind, TransferOrder, TransferRequest};
use crate::transport::Transport;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

/// What a shard worker may ask of its router.
pub trait CrossShardCallback: Send + Sync {
    /// Called once Step1 of `id` has been sent.
    fn trigger_step2(&self, id: CorrelationId) -> Result<(), RouterError>;

    /// Called once Step2 of `id` has been acknowledged.
    fn release_context(&self, id: CorrelationId);
}

/// Counters of every shard, in shard order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub shards: Vec<ShardSnapshot>,
}

impl StatisticsSnapshot {
    pub fn local_transfers(&self) -> u64 {
        self.shards.iter().map(|s| s.local_transfers).sum()
    }

    pub fn cross_shard_transfers(&self) -> u64 {
        self.shards.iter().map(|s| s.cross_shard_transfers).sum()
    }

    pub fn failures(&self) -> u64 {
        self.shards.iter().map(|s| s.failures).sum()
    }

    pub fn accepted(&self) -> u64 {
        self.shards.iter().map(|s| s.accepted).sum()
    }
}

/// Routes transfers to shard workers and runs the cross-shard protocol.
///
/// # Invariants
///
/// - `shard_of` is fixed for the router's lifetime.
/// - A context exists for a correlation id from acceptance until its Step2 succeeds.
/// - Correlation ids are never reused.
pub struct ShardRouter {
    shards: Vec<ShardWorker>,
    contexts: CorrelationTable,
    /// Tasks submitted to any shard and not yet finished.
    in_flight: Arc<TaskCounter>,
    unknown_correlations: AtomicU64,
}

impl ShardRouter {
    /// Starts `shard_count` workers that share `clock` and `transport`.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoShards`] - `shard_count` is zero.
    /// - [`RouterError::Spawn`] - a worker thread could not be started.
    pub fn new(
        shard_count: usize,
        clock: Arc<LamportClock>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, RouterError> {
        if shard_count == 0 {
            return Err(RouterError::NoShards);
        }

        let in_flight = Arc::new(TaskCounter::new());
        let mut spawn_error = None;

        let router = Arc::new_cyclic(|weak: &Weak<ShardRouter>| {
            let callback: Weak<dyn CrossShardCallback> = weak.clone();
            let mut shards = Vec::with_capacity(shard_count);
            for index in 0..shard_count {
                match ShardWorker::spawn(
                    ShardId(index),
                    Arc::clone(&clock),
                    Arc::clone(&transport),
                    callback.clone(),
                    Arc::clone(&in_flight),
                ) {
                    Ok(worker) => shards.push(worker),
                    Err(e) => {
                        spawn_error = Some(e);
                        break;
                    }
                }
            }
            ShardRouter {
                shards,
                contexts: CorrelationTable::new(),
                in_flight,
                unknown_correlations: AtomicU64::new(0),
            }
        });

        if let Some(e) = spawn_error {
            router.shutdown();
            return Err(RouterError::Spawn(e.to_string()));
        }

        info!(shards = shard_count, "shard router started");
        Ok(router)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `account`.
    pub fn shard_of(&self, account: AccountId) -> ShardId {
        ShardId(account.0 as usize % self.shards.len())
    }

    /// Worker for `shard`.
    ///
    /// # Panics
    ///
    /// If `shard` is out of range. That is a routing bug, not a runtime condition.
    pub fn shard(&self, shard: ShardId) -> &ShardWorker {
        &self.shards[shard.0]
    }

    /// Queues a transfer and returns how it was routed. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidAmount`] - `amount` is zero or negative.
    /// - [`RouterError::SameAccount`] - `source` and `destination` are equal.
    pub fn submit_transfer(
        &self,
        source: AccountId,
        destination: AccountId,
        amount: Decimal,
    ) -> Result<TransferKind, RouterError> {
        if amount <= Decimal::ZERO {
            return Err(RouterError::InvalidAmount);
        }
        if source == destination {
            return Err(RouterError::SameAccount(source));
        }

        let order = TransferOrder::new(source, destination, amount);
        let source_shard = self.shard_of(source);
        let destination_shard = self.shard_of(destination);

        if source_shard == destination_shard {
            self.shard(source_shard)
                .submit(TransferRequest::local(order, source_shard));
            return Ok(TransferKind::Local);
        }

        let correlation_id = self.contexts.allocate();
        let request =
            TransferRequest::step1(order, correlation_id, source_shard, destination_shard);

        // The context must exist before Step1 can reach trigger_step2.
        let inserted = self.contexts.insert(request);
        debug_assert!(inserted, "correlation id {correlation_id} reused");

        debug!(
            correlation = %correlation_id,
            source = %source,
            destination = %destination,
            source_shard = %source_shard,
            destination_shard = %destination_shard,
            "cross-shard transfer accepted"
        );
        self.shard(source_shard).submit(request);
        Ok(TransferKind::Step1)
    }

    /// Queues Step2 for a completed Step1.
    ///
    /// # Errors
    ///
    /// - [`RouterError::UnknownCorrelation`] - no context is stored under `id`;
    ///   nothing is queued.
    pub fn trigger_step2(&self, id: CorrelationId) -> Result<(), RouterError> {
        let Some(step1) = self.contexts.mark_step1_completed(id) else {
            self.unknown_correlations.fetch_add(1, Ordering::SeqCst);
            error!(correlation = %id, "no cross-shard context, step 2 dropped");
            return Err(RouterError::UnknownCorrelation(id));
        };

        let step2 = step1.to_step2();
        self.shard(step2.destination_shard).submit(step2);
        Ok(())
    }

    /// Forgets the context for `id`. Idempotent.
    pub fn release_context(&self, id: CorrelationId) {
        if self.contexts.release(id).is_some() {
            debug!(correlation = %id, "cross-shard context released");
        }
    }

    /// Blocks until every submitted transfer, including the Step2 of every
    /// cross-shard transfer, has finished.
    pub fn await_all_complete(&self) {
        self.in_flight.wait_idle();
        for shard in &self.shards {
            shard.await_idle();
        }
    }

    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            shards: self.shards.iter().map(ShardWorker::statistics).collect(),
        }
    }

    /// Contexts still held, including orphaned ones.
    pub fn pending_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn context(&self, id: CorrelationId) -> Option<CrossShardContext> {
        self.contexts.get(id)
    }

    /// Contexts older than `max_age`. Reported only; nothing is evicted.
    pub fn stale_contexts(&self, max_age: Duration) -> Vec<CorrelationId> {
        self.contexts.older_than(max_age)
    }

    /// Step2 triggers dropped because their id was unknown.
    pub fn unknown_correlations(&self) -> u64 {
        self.unknown_correlations.load(Ordering::SeqCst)
    }

    /// Stops every worker after it drains its queue.
    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.stop();
        }
    }
}

impl CrossShardCallback for ShardRouter {
    fn trigger_step2(&self, id: CorrelationId) -> Result<(), RouterError> {
        ShardRouter::trigger_step2(self, id)
    }

    fn release_context(&self, id: CorrelationId) {
        ShardRouter::release_context(self, id)
    }
}

impl Drop for ShardRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
