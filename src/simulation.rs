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

//! End-to-end runs.
//!
//! A [`Simulation`] spawns one [`AccountNode`] per configured balance, acts as
//! the coordinator at node 0 and drives four phases:
//!
//! 1. **Start-up sync**: wait for `Started` from every account.
//! 2. **Transfers**: submit the plan to a [`ShardRouter`] and wait for it to drain.
//! 3. **Stop sync**: multicast `Stop`, wait for every account's `Done`.
//! 4. **Collection**: receive one `BalanceHistory` per account.

use crate::account::AccountNode;
use crate::base::{AccountId, NodeId};
use crate::clock::LamportClock;
use crate::config::SimulationConfig;
use crate::error::{SimulationError, TransportError};
use crate::history::{AllHistory, BalanceHistory};
use crate::message::{Message, MessageKind};
use crate::router::{ShardRouter, StatisticsSnapshot};
use crate::transfer::TransferOrder;
use crate::transport::{ChannelNetwork, Transport};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type AccountHandle = JoinHandle<Result<BalanceHistory, TransportError>>;

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub statistics: StatisticsSnapshot,
    pub histories: AllHistory,
    /// Cross-shard contexts still held when the transfer phase ended.
    pub orphaned_contexts: usize,
    pub unknown_correlations: u64,
    /// Duration of the transfer phase.
    pub elapsed: Duration,
}

/// The default plan: `i -> i+1` for amount `i`, closed by `n -> 1` for amount 1.
pub fn ring_transfers(account_count: usize) -> Vec<TransferOrder> {
    let mut plan: Vec<TransferOrder> = (1..account_count as u16)
        .map(|i| TransferOrder::new(AccountId(i), AccountId(i + 1), Decimal::from(i)))
        .collect();
    if account_count > 1 {
        plan.push(TransferOrder::new(
            AccountId(account_count as u16),
            AccountId(1),
            Decimal::ONE,
        ));
    }
    plan
}

#[derive(Debug, Clone)]
pub struct Simulation {
    config: SimulationConfig,
}

impl Simulation {
    /// # Errors
    ///
    /// Returns [`SimulationError::Config`] if `config` does not validate.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn run(&self, plan: &[TransferOrder]) -> Result<SimulationReport, SimulationError> {
        self.run_with(plan, |transport| transport)
    }

    /// Like [`run`](Self::run), with the coordinator's transport passed
    /// through `wrap` first. Accounts keep their plain endpoints.
    pub fn run_with<F>(&self, plan: &[TransferOrder], wrap: F) -> Result<SimulationReport, SimulationError>
    where
        F: FnOnce(Arc<dyn Transport>) -> Arc<dyn Transport>,
    {
        let account_count = self.config.account_count();
        let mut network = ChannelNetwork::new(account_count + 1);
        if let Some(timeout) = self.config.ack_timeout() {
            network = network.with_ack_timeout(timeout);
        }
        let mut endpoints = network.build();
        let accounts = endpoints.split_off(1);
        let parent = endpoints
            .pop()
            .ok_or(TransportError::UnknownPeer(NodeId::PARENT))?;

        let mut handles: Vec<(AccountId, AccountHandle)> = Vec::with_capacity(account_count);
        for ((index, endpoint), balance) in accounts.into_iter().enumerate().zip(&self.config.balances) {
            let id = AccountId(index as u16 + 1);
            let handle = AccountNode::new(id, account_count, *balance, endpoint)
                .spawn()
                .map_err(|_| SimulationError::Spawn(id))?;
            handles.push((id, handle));
        }

        let coordinator: Arc<dyn Transport> = Arc::new(parent);
        let transport = wrap(coordinator);
        let clock = Arc::new(LamportClock::new());
        let ids: Vec<AccountId> = handles.iter().map(|(id, _)| *id).collect();

        info!(accounts = account_count, "waiting for accounts to start");
        for id in &ids {
            let message = transport.receive((*id).into())?;
            clock.update(message.local_time);
            expect_kind(*id, &message, MessageKind::Started)?;
        }
        info!(time = %clock.now(), "all accounts started");

        let started = Instant::now();
        let (statistics, orphaned_contexts, unknown_correlations) =
            self.transfer_phase(plan, &clock, &transport)?;
        let elapsed = started.elapsed();
        info!(elapsed_ms = elapsed.as_millis() as u64, "transfer phase finished");

        let stop_time = clock.tick();
        transport.multicast(Message::signal(MessageKind::Stop, stop_time))?;
        for id in &ids {
            loop {
                let message = transport.receive((*id).into())?;
                clock.update(message.local_time);
                if message.is(MessageKind::Done) {
                    break;
                }
                debug!(account = %id, kind = ?message.kind, "stale reply skipped");
            }
        }
        info!(time = %clock.now(), "all accounts stopped");

        let mut histories = AllHistory::new();
        for id in &ids {
            let message = transport.receive((*id).into())?;
            clock.update(message.local_time);
            expect_kind(*id, &message, MessageKind::BalanceHistory)?;
            let kind = message.kind;
            let history = message
                .into_history()
                .ok_or(SimulationError::UnexpectedMessage {
                    from: (*id).into(),
                    expected: MessageKind::BalanceHistory,
                    got: kind,
                })?;
            histories.push(history);
        }
        info!(histories = histories.len(), "balance histories collected");

        for (id, handle) in handles {
            match handle.join() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(SimulationError::AccountPanicked(id)),
            }
        }

        Ok(SimulationReport {
            statistics,
            histories,
            orphaned_contexts,
            unknown_correlations,
            elapsed,
        })
    }

    fn transfer_phase(
        &self,
        plan: &[TransferOrder],
        clock: &Arc<LamportClock>,
        transport: &Arc<dyn Transport>,
    ) -> Result<(StatisticsSnapshot, usize, u64), SimulationError> {
        let router = ShardRouter::new(self.config.shard_count, Arc::clone(clock), Arc::clone(transport))?;
        let account_count = self.config.account_count();

        for order in plan {
            if !self.is_routable(order) {
                warn!(
                    source = %order.source,
                    destination = %order.destination,
                    accounts = account_count,
                    "skipping transfer involving an unknown account"
                );
                continue;
            }
            if let Err(e) = router.submit_transfer(order.source, order.destination, order.amount) {
                warn!(source = %order.source, destination = %order.destination, error = %e, "transfer rejected");
            }
        }

        router.await_all_complete();
        let statistics = router.statistics_snapshot();
        let orphaned = router.pending_contexts();
        if orphaned > 0 {
            warn!(
                orphaned,
                stale = ?router.stale_contexts(Duration::ZERO),
                "cross-shard contexts left without a completed step 2"
            );
        }
        let unknown = router.unknown_correlations();
        router.shutdown();
        Ok((statistics, orphaned, unknown))
    }

    fn is_routable(&self, order: &TransferOrder) -> bool {
        let in_range = |id: AccountId| id.0 >= 1 && (id.0 as usize) <= self.config.account_count();
        in_range(order.source) && in_range(order.destination)
    }
}

fn expect_kind(from: AccountId, message: &Message, expected: MessageKind) -> Result<(), SimulationError> {
    if message.is(expected) {
        Ok(())
    } else {
        Err(SimulationError::UnexpectedMessage {
            from: from.into(),
            expected,
            got: message.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ring_closes_back_to_first_account() {
        let plan = ring_transfers(3);
        assert_eq!(
            plan,
            vec![
                TransferOrder::new(AccountId(1), AccountId(2), dec!(1)),
                TransferOrder::new(AccountId(2), AccountId(3), dec!(2)),
                TransferOrder::new(AccountId(3), AccountId(1), dec!(1)),
            ]
        );
        assert!(ring_transfers(1).is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = Simulation::new(SimulationConfig::new(vec![], 1));
        assert!(matches!(result, Err(SimulationError::Config(_))));
    }

    #[test]
    fn single_account_run_without_transfers() {
        let simulation = Simulation::new(SimulationConfig::new(vec![dec!(7)], 2)).unwrap();
        let report = simulation.run(&[]).unwrap();
        assert_eq!(report.histories.len(), 1);
        assert_eq!(
            report.histories.get(AccountId(1)).unwrap().current_balance(),
            dec!(7)
        );
        assert_eq!(report.statistics.accepted(), 0);
    }

    #[test]
    fn unroutable_orders_are_skipped() {
        let simulation = Simulation::new(SimulationConfig::new(vec![dec!(5), dec!(5)], 2)).unwrap();
        let plan = [
            TransferOrder::new(AccountId(1), AccountId(1), dec!(1)),
            TransferOrder::new(AccountId(1), AccountId(9), dec!(1)),
            TransferOrder::new(AccountId(1), AccountId(2), dec!(-1)),
        ];
        let report = simulation.run(&plan).unwrap();
        assert_eq!(report.statistics.accepted(), 0);
        assert_eq!(report.orphaned_contexts, 0);
    }
}
