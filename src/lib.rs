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

//! # Lamport Ledger
//!
//! This library runs a sharded multi-account ledger. Transfers are routed to
//! single-threaded shard workers; transfers whose accounts live on different
//! shards go through a two-step debit/credit protocol tied together by a
//! correlation id. Every message carries a Lamport timestamp, and every
//! account records a gap-free balance history over logical time.
//!
//! ## Core Components
//!
//! - [`LamportClock`]: Logical clock shared by the coordinator's workers
//! - [`ShardWorker`]: FIFO task executor owning one thread
//! - [`ShardRouter`]: Routes transfers and coordinates the cross-shard protocol
//! - [`AccountNode`]: Account entity that applies transfers and records history
//! - [`Simulation`]: Bootstraps accounts, runs a transfer plan, collects histories
//!
//! ## Example
//!
//! ```
//! use lamport_ledger::{ring_transfers, Simulation, SimulationConfig};
//! use rust_decimal_macros::dec;
//!
//! let config = SimulationConfig::new(vec![dec!(10), dec!(20), dec!(30)], 2);
//! let simulation = Simulation::new(config).unwrap();
//! let report = simulation.run(&ring_transfers(3)).unwrap();
//!
//! assert_eq!(report.statistics.failures(), 0);
//! assert_eq!(report.histories.len(), 3);
//! ```
//!
//! ## Thread Safety
//!
//! Shards run in parallel with each other. Within a shard, tasks run one at a
//! time in submission order. The router's context table is a concurrent map
//! with per-entry locking.

pub mod account;
mod base;
pub mod clock;
pub mod config;
mod correlation;
pub mod error;
pub mod history;
pub mod message;
pub mod router;
pub mod shard;
pub mod simulation;
mod transfer;
pub mod transport;

pub use account::AccountNode;
pub use base::{AccountId, CorrelationId, LogicalTime, NodeId, ShardId};
pub use clock::LamportClock;
pub use config::{MAX_ACCOUNTS, SimulationConfig};
pub use correlation::CorrelationTable;
pub use error::{ConfigError, RouterError, SimulationError, TaskError, TransportError};
pub use history::{AllHistory, BalanceHistory, BalanceState};
pub use message::{Instruction, MESSAGE_MAGIC, Message, MessageKind, Payload};
pub use router::{CrossShardCallback, ShardRouter, StatisticsSnapshot};
pub use shard::{ShardSnapshot, ShardStatistics, ShardWorker, TaskCounter, WorkerState};
pub use simulation::{Simulation, SimulationReport, ring_transfers};
pub use transfer::{CrossShardContext, TransferKind, TransferOrder, TransferRequest};
pub use transport::{ChannelEndpoint, ChannelNetwork, Transport};
