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

//! Per-account balance timelines.
//!
//! A [`BalanceHistory`] holds exactly one [`BalanceState`] per logical tick,
//! from time zero to the latest event the account observed:
//!
//! ```text
//! time        0    1    2    3    4    5
//! balance    10   10   10   10   10   15     credit of 5 sent at 2, merged at 5
//! pending_in  0    0    5    5    5    0
//! ```
//!
//! Missing ticks are filled forward with the last committed balance, so the
//! timeline is gap-free by construction.

use crate::base::{AccountId, LogicalTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance of one account at one logical tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceState {
    pub time: LogicalTime,
    pub balance: Decimal,
    /// Money sent to this account but not yet merged into `balance`.
    pub pending_in: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceHistory {
    account: AccountId,
    states: Vec<BalanceState>,
}

impl BalanceHistory {
    /// Starts a timeline at time zero with the opening balance.
    pub fn new(account: AccountId, initial_balance: Decimal) -> Self {
        Self {
            account,
            states: vec![BalanceState {
                time: LogicalTime::ZERO,
                balance: initial_balance,
                pending_in: Decimal::ZERO,
            }],
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.is_contiguous(),
            "Invariant violated: history of account {} has a gap or repeat",
            self.account
        );
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn states(&self) -> &[BalanceState] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn last(&self) -> BalanceState {
        // `new` seeds one entry and nothing removes entries.
        self.states[self.states.len() - 1]
    }

    pub fn last_time(&self) -> LogicalTime {
        self.last().time
    }

    pub fn current_balance(&self) -> Decimal {
        self.last().balance
    }

    /// Appends a commit at `at`.
    ///
    /// Ticks after the last entry and before `pending_from` repeat the last
    /// balance; ticks in `[pending_from, at)` additionally carry `pending_in`.
    /// Ticks at or before the last entry are never rewritten, so a
    /// `pending_from` in the past is clamped forward.
    ///
    /// `at` must be later than [`last_time`](Self::last_time).
    pub fn record(
        &mut self,
        pending_from: LogicalTime,
        at: LogicalTime,
        balance: Decimal,
        pending_in: Decimal,
    ) {
        debug_assert!(
            at > self.last_time(),
            "commit at {} does not follow last entry {}",
            at,
            self.last_time()
        );
        if at <= self.last_time() {
            return;
        }

        let last = self.last();
        let pending_from = pending_from.max(last.time.next()).min(at);

        for tick in last.time.0 + 1..at.0 {
            let pending = if tick >= pending_from.0 {
                pending_in
            } else {
                Decimal::ZERO
            };
            self.states.push(BalanceState {
                time: LogicalTime(tick),
                balance: last.balance,
                pending_in: pending,
            });
        }
        self.states.push(BalanceState {
            time: at,
            balance,
            pending_in: Decimal::ZERO,
        });
        self.assert_invariants();
    }

    /// Outgoing transfer committed at `at`.
    pub fn record_debit(&mut self, at: LogicalTime, amount: Decimal) {
        let balance = self.current_balance() - amount;
        self.record(at, at, balance, Decimal::ZERO);
    }

    /// Incoming transfer sent at `sent_at` and merged at `at`.
    pub fn record_credit(&mut self, sent_at: LogicalTime, at: LogicalTime, amount: Decimal) {
        let balance = self.current_balance() + amount;
        self.record(sent_at, at, balance, amount);
    }

    /// Fills the timeline forward with the current balance up to `at`.
    pub fn extend_to(&mut self, at: LogicalTime) {
        if at > self.last_time() {
            let balance = self.current_balance();
            self.record(at, at, balance, Decimal::ZERO);
        }
    }

    /// State in effect at `time`. Ticks past the end repeat the last entry.
    pub fn balance_at(&self, time: LogicalTime) -> Option<BalanceState> {
        let index = self.states.partition_point(|state| state.time <= time);
        (index > 0).then(|| self.states[index - 1])
    }

    /// True when times start at zero and increase by exactly one.
    pub fn is_contiguous(&self) -> bool {
        self.states
            .iter()
            .enumerate()
            .all(|(i, state)| state.time.0 == i as u64)
    }
}

/// Histories collected from every account at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllHistory {
    histories: Vec<BalanceHistory>,
}

impl AllHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, history: BalanceHistory) {
        self.histories.push(history);
        self.histories.sort_by_key(|h| h.account());
    }

    pub fn get(&self, account: AccountId) -> Option<&BalanceHistory> {
        self.histories.iter().find(|h| h.account() == account)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BalanceHistory> {
        self.histories.iter()
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    /// Latest tick present in any history.
    pub fn max_time(&self) -> LogicalTime {
        self.histories
            .iter()
            .map(BalanceHistory::last_time)
            .max()
            .unwrap_or_default()
    }

    /// Committed plus pending money across all accounts at `time`.
    pub fn total_at(&self, time: LogicalTime) -> Decimal {
        self.histories
            .iter()
            .filter_map(|h| h.balance_at(time))
            .map(|state| state.balance + state.pending_in)
            .sum()
    }
}
