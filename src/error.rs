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

//! Error types for routing, transport and simulation failures.

use crate::base::{AccountId, CorrelationId, NodeId};
use crate::message::MessageKind;
use thiserror::Error;

/// Failures of the point-to-point message transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer's end of the channel is gone
    #[error("peer {0} is disconnected")]
    Disconnected(NodeId),

    /// No reply arrived within the configured bound
    #[error("timed out waiting for peer {0}")]
    Timeout(NodeId),

    /// There is no channel to the requested peer
    #[error("no channel to peer {0}")]
    UnknownPeer(NodeId),
}

/// Why a single shard task failed. Never escapes the worker loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Reply lacked the magic marker or was not an acknowledgment
    #[error("malformed acknowledgment from account {account}: got {kind:?}")]
    MalformedAck { account: AccountId, kind: MessageKind },

    /// The router was dropped while the task was running
    #[error("router is no longer available")]
    RouterUnavailable,

    #[error("task panicked")]
    Panicked,
}

/// Errors returned by the shard router.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Source and destination are the same account
    #[error("account {0} cannot transfer to itself")]
    SameAccount(AccountId),

    #[error("router needs at least one shard")]
    NoShards,

    /// No cross-shard context is stored under this id
    #[error("unknown correlation id {0}")]
    UnknownCorrelation(CorrelationId),

    /// A shard worker thread could not be started
    #[error("failed to spawn shard worker: {0}")]
    Spawn(String),
}

/// Invalid simulation settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one account is required")]
    NoAccounts,

    #[error("too many accounts: {count} (max {max})")]
    TooManyAccounts { count: usize, max: usize },

    #[error("at least one shard is required")]
    NoShards,
}

/// Failures of the bootstrap, stop and collection phases.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected message from node {from}: expected {expected:?}, got {got:?}")]
    UnexpectedMessage {
        from: NodeId,
        expected: MessageKind,
        got: MessageKind,
    },

    #[error("failed to spawn account {0}")]
    Spawn(AccountId),

    #[error("account {0} panicked")]
    AccountPanicked(AccountId),
}
