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

//! Simulation settings.

use crate::error::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on accounts in one run.
pub const MAX_ACCOUNTS: usize = 255;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Initial balance per account. Account ids are `1..=balances.len()`.
    pub balances: Vec<Decimal>,
    pub shard_count: usize,
    /// Bound on each acknowledgment wait. `None` waits forever.
    pub ack_timeout_ms: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            balances: vec![dec!(10), dec!(20), dec!(30), dec!(40)],
            shard_count: 8,
            ack_timeout_ms: Some(5000),
        }
    }
}

impl SimulationConfig {
    pub fn new(balances: Vec<Decimal>, shard_count: usize) -> Self {
        Self {
            balances,
            shard_count,
            ..Self::default()
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn account_count(&self) -> usize {
        self.balances.len()
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    /// # Errors
    ///
    /// - [`ConfigError::NoAccounts`] - `balances` is empty.
    /// - [`ConfigError::TooManyAccounts`] - more than [`MAX_ACCOUNTS`] balances.
    /// - [`ConfigError::NoShards`] - `shard_count` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.balances.is_empty() {
            return Err(ConfigError::NoAccounts);
        }
        if self.balances.len() > MAX_ACCOUNTS {
            return Err(ConfigError::TooManyAccounts {
                count: self.balances.len(),
                max: MAX_ACCOUNTS,
            });
        }
        if self.shard_count == 0 {
            return Err(ConfigError::NoShards);
        }
        Ok(())
    }
}
