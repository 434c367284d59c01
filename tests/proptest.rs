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

//! Property-based tests for the clock, routing and balance histories.
//!
//! These tests verify invariants that should hold for any sequence of
//! timestamps or transfers.

use lamport_ledger::{
    AccountId, BalanceHistory, ChannelNetwork, CorrelationTable, LamportClock, LogicalTime,
    ShardId, ShardRouter, TransferOrder, TransferRequest,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Generate a positive amount (0.0001 to 1000 with 4 decimal places).
fn arb_amount() -> impl Strategy<Value = Decimal> {
    (1i64..=10_000_000i64).prop_map(|units| Decimal::new(units, 4))
}

/// One history operation: credit or debit, ticks since the last entry, and
/// how far before the commit a credit was sent.
fn arb_op() -> impl Strategy<Value = (bool, u64, u64, Decimal)> {
    (any::<bool>(), 1u64..6, 0u64..8, arb_amount())
}

// =============================================================================
// Logical Clock
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Every update returns more than any earlier result or input.
    #[test]
    fn update_exceeds_everything_seen(received in prop::collection::vec(0u64..1_000, 1..50)) {
        let clock = LamportClock::new();
        let mut seen = 0u64;

        for r in received {
            let result = clock.update(LogicalTime(r));
            prop_assert!(result.0 > seen);
            prop_assert!(result.0 > r);
            seen = seen.max(r).max(result.0);
        }
    }

    /// Ticks interleaved with updates never go backwards.
    #[test]
    fn tick_and_update_are_strictly_increasing(
        steps in prop::collection::vec(prop::option::of(0u64..500), 1..60),
    ) {
        let clock = LamportClock::new();
        let mut last = clock.now();

        for step in steps {
            let next = match step {
                Some(r) => clock.update(LogicalTime(r)),
                None => clock.tick(),
            };
            prop_assert!(next > last);
            prop_assert_eq!(clock.now(), next);
            last = next;
        }
    }
}

// =============================================================================
// Routing
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The same account always lands on the same shard.
    #[test]
    fn shard_of_is_pure(shards in 1usize..9, accounts in prop::collection::vec(any::<u16>(), 1..40)) {
        let endpoint = ChannelNetwork::new(1).build().remove(0);
        let router = ShardRouter::new(shards, Arc::new(LamportClock::new()), Arc::new(endpoint)).unwrap();

        for id in accounts {
            let first = router.shard_of(AccountId(id));
            prop_assert_eq!(first, router.shard_of(AccountId(id)));
            prop_assert_eq!(first, ShardId(id as usize % shards));
            prop_assert!(first.0 < router.shard_count());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Allocated correlation ids are unique and increasing.
    #[test]
    fn correlation_ids_are_never_reused(count in 1usize..200) {
        let table = CorrelationTable::new();
        let ids: Vec<u64> = (0..count).map(|_| table.allocate().0).collect();
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(ids[0] >= 1);
    }

    /// A released context can no longer complete Step1.
    #[test]
    fn released_contexts_stay_released(amount in arb_amount()) {
        let table = CorrelationTable::new();
        let id = table.allocate();
        let order = TransferOrder::new(AccountId(1), AccountId(2), amount);
        prop_assert!(table.insert(TransferRequest::step1(order, id, ShardId(1), ShardId(0))));

        prop_assert!(table.mark_step1_completed(id).is_some());
        prop_assert!(table.release(id).is_some());
        prop_assert!(table.mark_step1_completed(id).is_none());
        prop_assert!(table.is_empty());
    }
}

// =============================================================================
// Balance History
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Histories stay gap-free and end on the sum of their operations.
    #[test]
    fn history_is_gap_free(initial in arb_amount(), ops in prop::collection::vec(arb_op(), 0..30)) {
        let mut history = BalanceHistory::new(AccountId(1), initial);
        let mut expected = initial;

        for (credit, gap, lag, amount) in ops {
            let at = LogicalTime(history.last_time().0 + gap);
            if credit {
                let sent_at = LogicalTime(at.0.saturating_sub(lag));
                history.record_credit(sent_at, at, amount);
                expected += amount;
            } else {
                history.record_debit(at, amount);
                expected -= amount;
            }
            prop_assert_eq!(history.last_time(), at);
        }

        prop_assert!(history.is_contiguous());
        prop_assert_eq!(history.current_balance(), expected);
        prop_assert_eq!(history.len() as u64, history.last_time().0 + 1);
    }

    /// Ticks between the send and the commit carry the pending amount.
    #[test]
    fn credit_window_carries_pending(
        initial in arb_amount(),
        start in 1u64..20,
        window in 1u64..20,
        amount in arb_amount(),
    ) {
        let mut history = BalanceHistory::new(AccountId(1), initial);
        let at = LogicalTime(start + window);
        history.record_credit(LogicalTime(start), at, amount);

        for state in history.states() {
            if state.time.0 < start {
                prop_assert!(state.pending_in.is_zero());
                prop_assert_eq!(state.balance, initial);
            } else if state.time < at {
                prop_assert_eq!(state.pending_in, amount);
                prop_assert_eq!(state.balance, initial);
            } else {
                prop_assert!(state.pending_in.is_zero());
                prop_assert_eq!(state.balance, initial + amount);
            }
        }
    }

    /// Filling forward never changes the balance.
    #[test]
    fn extend_keeps_balance(initial in arb_amount(), to in 0u64..100) {
        let mut history = BalanceHistory::new(AccountId(1), initial);
        history.extend_to(LogicalTime(to));

        prop_assert!(history.is_contiguous());
        prop_assert_eq!(history.last_time(), LogicalTime(to));
        prop_assert!(history.states().iter().all(|s| s.balance == initial));
    }
}
