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

//! Transfer requests and cross-shard bookkeeping.
//!
//! A transfer whose accounts live on the same shard runs as one
//! [`Local`](TransferKind::Local) task. Otherwise it is split:
//! - [`Step1`](TransferKind::Step1) debits the source on the source shard;
//! - [`Step2`](TransferKind::Step2) credits the destination on the destination shard.

use crate::base::{AccountId, CorrelationId, ShardId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// The instruction delivered to account entities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferOrder {
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Decimal,
}

impl TransferOrder {
    pub fn new(source: AccountId, destination: AccountId, amount: Decimal) -> Self {
        Self {
            source,
            destination,
            amount,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Local,
    Step1,
    Step2,
}

/// A unit of work queued on a shard. Immutable once built.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub order: TransferOrder,
    pub correlation_id: CorrelationId,
    pub source_shard: ShardId,
    pub destination_shard: ShardId,
}

impl TransferRequest {
    pub fn local(order: TransferOrder, shard: ShardId) -> Self {
        Self {
            kind: TransferKind::Local,
            order,
            correlation_id: CorrelationId::NONE,
            source_shard: shard,
            destination_shard: shard,
        }
    }

    pub fn step1(
        order: TransferOrder,
        correlation_id: CorrelationId,
        source_shard: ShardId,
        destination_shard: ShardId,
    ) -> Self {
        Self {
            kind: TransferKind::Step1,
            order,
            correlation_id,
            source_shard,
            destination_shard,
        }
    }

    /// Builds the credit half of a cross-shard transfer from its debit half.
    pub fn to_step2(&self) -> Self {
        Self {
            kind: TransferKind::Step2,
            ..*self
        }
    }

    pub fn source(&self) -> AccountId {
        self.order.source
    }

    pub fn destination(&self) -> AccountId {
        self.order.destination
    }

    pub fn amount(&self) -> Decimal {
        self.order.amount
    }
}

/// Tracks an accepted cross-shard transfer until its credit step finishes.
///
//  created ──step1 ok──► step1_completed ──step2 ok──► released
//     │                        │
//     └──step1 lost────────────┴──step2 failed──► orphaned (never released)
#[derive(Debug, Clone)]
pub struct CrossShardContext {
    pub request: TransferRequest,
    pub step1_completed: bool,
    pub created_at: Instant,
}

impl CrossShardContext {
    pub fn new(request: TransferRequest) -> Self {
        Self {
            request,
            step1_completed: false,
            created_at: Instant::now(),
        }
    }
}
