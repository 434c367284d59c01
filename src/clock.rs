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

//! Lamport logical clock.
//!
//! - A local event advances the clock by one.
//! - Receiving a message sets the clock to `max(local, received) + 1`.
//!
//! One clock is shared (behind an [`Arc`](std::sync::Arc)) by every thread of a
//! participant; the coordinator's shard workers all tick the same instance.

use crate::base::LogicalTime;
use parking_lot::Mutex;

/// Thread-safe Lamport clock.
///
/// All three operations take the same lock, so no caller can observe an
/// update out of order with respect to another.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: Mutex<LogicalTime>,
}

impl LamportClock {
    /// Creates a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local event. Equivalent to `update(LogicalTime::ZERO)`.
    pub fn tick(&self) -> LogicalTime {
        self.update(LogicalTime::ZERO)
    }

    /// Merges a received timestamp and returns the new time.
    pub fn update(&self, received: LogicalTime) -> LogicalTime {
        let mut time = self.time.lock();
        *time = (*time).max(received).next();
        *time
    }

    /// Current time, without advancing it.
    pub fn now(&self) -> LogicalTime {
        *self.time.lock()
    }
}
