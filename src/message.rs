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

//! Message envelope exchanged between the coordinator and account entities.
//!
//! Every message carries the sender's Lamport time; receivers must merge it
//! into their own clock before acting on the message.

use crate::base::LogicalTime;
use crate::history::BalanceHistory;
use crate::transfer::TransferOrder;
use serde::{Deserialize, Serialize};

/// Marker identifying a well-formed message.
pub const MESSAGE_MAGIC: u16 = 0xAFAF;

/// A transfer order tagged with the coordinator time it was issued at.
///
/// A forwarded credit carries the tag unchanged and the destination echoes
/// it in its `Ack`, so the coordinator can match an ack to the instruction
/// it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub order: TransferOrder,
    pub issued_at: LogicalTime,
}

impl Instruction {
    pub fn new(order: TransferOrder, issued_at: LogicalTime) -> Self {
        Self { order, issued_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Account finished start-up.
    Started,
    /// Account stopped accepting transfers.
    Done,
    /// Destination merged a credit.
    Ack,
    /// Coordinator asks accounts to wind down.
    Stop,
    /// Debit at the source, then forward a credit to the destination.
    Transfer,
    /// Debit at the source only.
    Debit,
    /// Credit at the destination, acknowledged to the coordinator.
    Credit,
    /// Final timeline of an account.
    BalanceHistory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Text(String),
    Order(Instruction),
    History(BalanceHistory),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub magic: u16,
    pub kind: MessageKind,
    pub local_time: LogicalTime,
    pub payload: Payload,
}

impl Message {
    pub fn new(kind: MessageKind, local_time: LogicalTime, payload: Payload) -> Self {
        Self {
            magic: MESSAGE_MAGIC,
            kind,
            local_time,
            payload,
        }
    }

    pub fn signal(kind: MessageKind, local_time: LogicalTime) -> Self {
        Self::new(kind, local_time, Payload::Empty)
    }

    /// A new instruction, issued at `local_time`.
    pub fn order(kind: MessageKind, local_time: LogicalTime, order: TransferOrder) -> Self {
        Self::forward(kind, local_time, Instruction::new(order, local_time))
    }

    /// Passes on an instruction issued earlier, keeping its tag.
    pub fn forward(kind: MessageKind, local_time: LogicalTime, instruction: Instruction) -> Self {
        Self::new(kind, local_time, Payload::Order(instruction))
    }

    /// Acknowledges `instruction`.
    pub fn ack(local_time: LogicalTime, instruction: Instruction) -> Self {
        Self::forward(MessageKind::Ack, local_time, instruction)
    }

    pub fn is_well_formed(&self) -> bool {
        self.magic == MESSAGE_MAGIC
    }

    /// True only for a well-formed [`MessageKind::Ack`].
    pub fn is_ack(&self) -> bool {
        self.is_well_formed() && self.kind == MessageKind::Ack
    }

    /// True when the message is well-formed and of the given kind.
    pub fn is(&self, kind: MessageKind) -> bool {
        self.is_well_formed() && self.kind == kind
    }

    /// True for a well-formed `Ack` of exactly `instruction`.
    pub fn acknowledges(&self, instruction: &Instruction) -> bool {
        self.is_ack() && self.instruction().as_ref() == Some(instruction)
    }

    pub fn instruction(&self) -> Option<Instruction> {
        match self.payload {
            Payload::Order(instruction) => Some(instruction),
            _ => None,
        }
    }

    pub fn transfer_order(&self) -> Option<TransferOrder> {
        self.instruction().map(|instruction| instruction.order)
    }

    pub fn into_history(self) -> Option<BalanceHistory> {
        match self.payload {
            Payload::History(history) => Some(history),
            _ => None,
        }
    }
}
