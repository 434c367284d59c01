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

//! End-to-end runs with real account threads over the channel network.

use lamport_ledger::{
    AccountId, AccountNode, BalanceHistory, ChannelEndpoint, ChannelNetwork, CorrelationId,
    LamportClock, LogicalTime, Message, MessageKind, NodeId, RouterError, ShardRouter,
    Simulation, SimulationConfig, TransferKind, TransferOrder, Transport, TransportError,
    ring_transfers,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn order(source: u16, destination: u16, amount: Decimal) -> TransferOrder {
    TransferOrder::new(AccountId(source), AccountId(destination), amount)
}

fn four_way_ring() -> Vec<TransferOrder> {
    vec![
        order(1, 2, dec!(10)),
        order(2, 3, dec!(10)),
        order(3, 4, dec!(10)),
        order(4, 1, dec!(10)),
    ]
}

/// Forwards to the coordinator's endpoint, recording instructions and
/// optionally swallowing credits to one account.
struct Interceptor {
    inner: Arc<dyn Transport>,
    drop_credits_to: Option<NodeId>,
    dropped: Arc<AtomicU64>,
    instructions: Arc<Mutex<Vec<Message>>>,
}

impl Interceptor {
    fn wrap(
        inner: Arc<dyn Transport>,
        drop_credits_to: Option<NodeId>,
        dropped: &Arc<AtomicU64>,
        instructions: &Arc<Mutex<Vec<Message>>>,
    ) -> Arc<dyn Transport> {
        Arc::new(Self {
            inner,
            drop_credits_to,
            dropped: Arc::clone(dropped),
            instructions: Arc::clone(instructions),
        })
    }
}

impl Transport for Interceptor {
    fn id(&self) -> NodeId {
        self.inner.id()
    }

    fn send(&self, to: NodeId, message: Message) -> Result<(), TransportError> {
        if message.transfer_order().is_some() {
            self.instructions.lock().push(message.clone());
        }
        if message.is(MessageKind::Credit) && Some(to) == self.drop_credits_to {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.inner.send(to, message)
    }

    fn receive(&self, from: NodeId) -> Result<Message, TransportError> {
        self.inner.receive(from)
    }

    fn receive_any(&self) -> Result<(NodeId, Message), TransportError> {
        self.inner.receive_any()
    }

    fn multicast(&self, message: Message) -> Result<(), TransportError> {
        self.inner.multicast(message)
    }

    fn await_acknowledgment(&self, account: AccountId) -> Result<Message, TransportError> {
        self.inner.await_acknowledgment(account)
    }
}

/// Holds back `Transfer` instructions to some accounts for a while.
struct SlowDelivery {
    inner: Arc<dyn Transport>,
    delays: HashMap<NodeId, Duration>,
}

impl Transport for SlowDelivery {
    fn id(&self) -> NodeId {
        self.inner.id()
    }

    fn send(&self, to: NodeId, message: Message) -> Result<(), TransportError> {
        let delay = self.delays.get(&to).copied();
        match delay {
            Some(delay) if message.is(MessageKind::Transfer) => {
                let inner = Arc::clone(&self.inner);
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = inner.send(to, message);
                });
                Ok(())
            }
            _ => self.inner.send(to, message),
        }
    }

    fn receive(&self, from: NodeId) -> Result<Message, TransportError> {
        self.inner.receive(from)
    }

    fn receive_any(&self) -> Result<(NodeId, Message), TransportError> {
        self.inner.receive_any()
    }

    fn multicast(&self, message: Message) -> Result<(), TransportError> {
        self.inner.multicast(message)
    }

    fn await_acknowledgment(&self, account: AccountId) -> Result<Message, TransportError> {
        self.inner.await_acknowledgment(account)
    }
}

type AccountHandle = JoinHandle<Result<BalanceHistory, TransportError>>;

/// Spawns one account per balance and waits until all of them started.
fn start_accounts(
    balances: &[Decimal],
    ack_timeout: Duration,
) -> (ChannelEndpoint, Vec<AccountHandle>) {
    let mut endpoints = ChannelNetwork::new(balances.len() + 1)
        .with_ack_timeout(ack_timeout)
        .build();
    let accounts = endpoints.split_off(1);
    let parent = endpoints.pop().unwrap();

    let handles: Vec<AccountHandle> = accounts
        .into_iter()
        .zip(balances)
        .enumerate()
        .map(|(index, (endpoint, balance))| {
            AccountNode::new(AccountId(index as u16 + 1), balances.len(), *balance, endpoint)
                .spawn()
                .unwrap()
        })
        .collect();
    for id in 1..=balances.len() as u16 {
        assert!(parent.receive(NodeId(id)).unwrap().is(MessageKind::Started));
    }
    (parent, handles)
}

/// Stops every account and returns their final balances.
fn stop_accounts(parent: &dyn Transport, handles: Vec<AccountHandle>) -> Vec<Decimal> {
    parent
        .multicast(Message::signal(MessageKind::Stop, LogicalTime(1_000)))
        .unwrap();
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap().current_balance())
        .collect()
}

#[test]
fn scenario_a_every_transfer_crosses_shards() {
    let config = SimulationConfig::new(vec![dec!(100); 4], 4);
    let report = Simulation::new(config).unwrap().run(&four_way_ring()).unwrap();

    assert_eq!(report.statistics.cross_shard_transfers(), 4);
    assert_eq!(report.statistics.local_transfers(), 0);
    assert_eq!(report.statistics.failures(), 0);
    assert_eq!(report.orphaned_contexts, 0);
    assert_eq!(report.unknown_correlations, 0);

    assert_eq!(report.histories.len(), 4);
    for history in report.histories.iter() {
        assert_eq!(history.current_balance(), dec!(100));
        assert!(history.is_contiguous());
    }
}

#[test]
fn scenario_b_single_shard_runs_in_submission_order() {
    let instructions = Arc::new(Mutex::new(Vec::new()));
    let dropped = Arc::new(AtomicU64::new(0));
    let config = SimulationConfig::new(vec![dec!(100); 4], 1);
    let plan = four_way_ring();

    let report = Simulation::new(config)
        .unwrap()
        .run_with(&plan, |inner| {
            Interceptor::wrap(inner, None, &dropped, &instructions)
        })
        .unwrap();

    assert_eq!(report.statistics.local_transfers(), 4);
    assert_eq!(report.statistics.cross_shard_transfers(), 0);
    assert_eq!(report.statistics.failures(), 0);

    let sent = instructions.lock().clone();
    assert!(sent.iter().all(|m| m.is(MessageKind::Transfer)));
    let orders: Vec<TransferOrder> = sent.iter().filter_map(Message::transfer_order).collect();
    assert_eq!(orders, plan);
    assert!(sent.windows(2).all(|w| w[0].local_time < w[1].local_time));

    for history in report.histories.iter() {
        assert_eq!(history.current_balance(), dec!(100));
        assert!(history.is_contiguous());
    }
}

#[test]
fn scenario_b_money_is_conserved_at_every_tick() {
    let config = SimulationConfig::new(vec![dec!(10), dec!(20), dec!(30), dec!(40)], 1);
    let report = Simulation::new(config).unwrap().run(&ring_transfers(4)).unwrap();

    let histories = &report.histories;
    for t in 0..=histories.max_time().0 {
        assert_eq!(histories.total_at(LogicalTime(t)), dec!(100), "total at tick {t}");
    }
}

#[test]
fn scenario_c_lost_credit_is_a_known_bad_state() {
    let instructions = Arc::new(Mutex::new(Vec::new()));
    let dropped = Arc::new(AtomicU64::new(0));
    let config = SimulationConfig::new(vec![dec!(10), dec!(10)], 2)
        .with_ack_timeout(Some(Duration::from_millis(200)));

    let report = Simulation::new(config)
        .unwrap()
        .run_with(&[order(1, 2, dec!(5))], |inner| {
            Interceptor::wrap(inner, Some(NodeId(2)), &dropped, &instructions)
        })
        .unwrap();

    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert_eq!(report.statistics.failures(), 1);
    assert_eq!(report.statistics.cross_shard_transfers(), 0);
    assert_eq!(report.orphaned_contexts, 1);

    // Step1 went through: the source stays debited.
    let source = report.histories.get(AccountId(1)).unwrap();
    assert_eq!(source.current_balance(), dec!(5));

    // The destination never saw the credit.
    let destination = report.histories.get(AccountId(2)).unwrap();
    assert!(destination.is_contiguous());
    assert!(
        destination
            .states()
            .iter()
            .all(|s| s.balance == dec!(10) && s.pending_in.is_zero())
    );
}

#[test]
fn scenario_d_unknown_correlation_reaches_no_account() {
    let mut endpoints = ChannelNetwork::new(3).build();
    let accounts = endpoints.split_off(1);
    let parent = endpoints.pop().unwrap();
    let router = ShardRouter::new(2, Arc::new(LamportClock::new()), Arc::new(parent)).unwrap();

    assert_eq!(
        router.trigger_step2(CorrelationId(999)),
        Err(RouterError::UnknownCorrelation(CorrelationId(999)))
    );
    router.await_all_complete();

    assert_eq!(router.unknown_correlations(), 1);
    assert_eq!(router.statistics_snapshot().accepted(), 0);
    for account in &accounts {
        assert_eq!(
            account.receive_timeout(NodeId::PARENT, Duration::from_millis(50)),
            Err(TransportError::Timeout(NodeId::PARENT))
        );
    }
}

#[test]
fn default_ring_moves_money_around() {
    let report = Simulation::new(SimulationConfig::default())
        .unwrap()
        .run(&ring_transfers(4))
        .unwrap();

    let balances: Vec<Decimal> = report
        .histories
        .iter()
        .map(|h| h.current_balance())
        .collect();
    assert_eq!(balances, vec![dec!(10), dec!(19), dec!(29), dec!(42)]);
    assert_eq!(report.statistics.failures(), 0);
}

#[test]
fn mixed_plan_keeps_final_total() {
    let config = SimulationConfig::new(vec![dec!(50); 6], 3);
    let plan: Vec<TransferOrder> = (0..60u16)
        .map(|i| order(i % 6 + 1, (i * 5 + 1) % 6 + 1, Decimal::new(i as i64 + 1, 1)))
        .filter(|o| o.source != o.destination)
        .collect();

    let report = Simulation::new(config).unwrap().run(&plan).unwrap();

    let stats = &report.statistics;
    assert_eq!(stats.failures(), 0);
    assert_eq!(
        stats.local_transfers() + stats.cross_shard_transfers(),
        plan.len() as u64
    );
    assert_eq!(report.orphaned_contexts, 0);

    let total: Decimal = report.histories.iter().map(|h| h.current_balance()).sum();
    assert_eq!(total, dec!(300));
    assert!(report.histories.iter().all(|h| h.is_contiguous()));
}

#[test]
fn histories_end_at_stop_time() {
    let config = SimulationConfig::new(vec![dec!(1); 3], 2);
    let report = Simulation::new(config).unwrap().run(&ring_transfers(3)).unwrap();

    // Every account fills its history up to the moment it saw Stop, which
    // comes after all of its transfer activity.
    for history in report.histories.iter() {
        let last = history.states().last().unwrap();
        assert_eq!(last.time, history.last_time());
        assert!(last.pending_in.is_zero());
        assert!(history.len() > 1);
    }
}

#[test]
fn unroutable_transfer_does_not_stop_the_source_account() {
    let (parent, handles) = start_accounts(&[dec!(10), dec!(10)], Duration::from_millis(200));
    let parent: Arc<dyn Transport> = Arc::new(parent);
    let router =
        ShardRouter::new(1, Arc::new(LamportClock::new()), Arc::clone(&parent)).unwrap();

    assert_eq!(
        router.submit_transfer(AccountId(1), AccountId(1), dec!(1)),
        Err(RouterError::SameAccount(AccountId(1)))
    );
    router
        .submit_transfer(AccountId(1), AccountId(7), dec!(1))
        .unwrap();
    router.await_all_complete();
    assert_eq!(
        router
            .submit_transfer(AccountId(1), AccountId(2), dec!(1))
            .unwrap(),
        TransferKind::Local
    );
    router.await_all_complete();

    let stats = router.statistics_snapshot();
    assert_eq!(stats.failures(), 1);
    assert_eq!(stats.local_transfers(), 1);
    router.shutdown();

    // Account 1 refused the unknown destination without debiting.
    assert_eq!(stop_accounts(&*parent, handles), vec![dec!(9), dec!(11)]);
}

#[test]
fn late_acknowledgment_is_not_credited_to_the_next_transfer() {
    let (parent, handles) = start_accounts(&[dec!(10); 3], Duration::from_millis(100));
    let endpoint: Arc<dyn Transport> = Arc::new(parent);
    let transport: Arc<dyn Transport> = Arc::new(SlowDelivery {
        inner: Arc::clone(&endpoint),
        delays: HashMap::from([
            (NodeId(1), Duration::from_millis(150)),
            (NodeId(3), Duration::from_millis(250)),
        ]),
    });
    let router = ShardRouter::new(1, Arc::new(LamportClock::new()), transport).unwrap();

    // The first ack arrives after its wait timed out, while the second
    // transfer is waiting on the same destination.
    router
        .submit_transfer(AccountId(1), AccountId(2), dec!(1))
        .unwrap();
    router
        .submit_transfer(AccountId(3), AccountId(2), dec!(5))
        .unwrap();
    router.await_all_complete();

    let stats = router.statistics_snapshot();
    assert_eq!(stats.local_transfers(), 0);
    assert_eq!(stats.failures(), 2);
    router.shutdown();

    let balances = stop_accounts(&*endpoint, handles);
    assert_eq!(balances[0], dec!(9));
}
