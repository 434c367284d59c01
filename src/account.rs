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

//! Account entities.
//!
//! An [`AccountNode`] is one participant of the simulation. It owns its
//! balance history and its own Lamport clock, and only changes state in
//! response to messages:
//!
//! | Message | Role | Effect |
//! |---------|------|--------|
//! | `Transfer` | source | debit, forward `Credit` to destination |
//! | `Debit` | source | debit |
//! | `Credit` | destination | pending window, credit, `Ack` to coordinator |
//! | `Stop` | any | close history, multicast `Done` |
//!
//! # Example
//!
//! ```
//! use lamport_ledger::{AccountId, AccountNode, ChannelNetwork};
//! use rust_decimal_macros::dec;
//!
//! let mut endpoints = ChannelNetwork::new(2).build();
//! let node = AccountNode::new(AccountId(1), 1, dec!(10), endpoints.pop().unwrap());
//! assert_eq!(node.history().current_balance(), dec!(10));
//! ```

use crate::base::{AccountId, LogicalTime, NodeId};
use crate::clock::LamportClock;
use crate::error::TransportError;
use crate::history::BalanceHistory;
use crate::message::{Message, MessageKind, Payload};
use crate::transport::Transport;
use rust_decimal::Decimal;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

pub struct AccountNode<T> {
    id: AccountId,
    account_count: usize,
    clock: LamportClock,
    history: BalanceHistory,
    transport: T,
}

impl<T: Transport + 'static> AccountNode<T> {
    /// `account_count` is the number of accounts in the run, this one included.
    pub fn new(id: AccountId, account_count: usize, initial_balance: Decimal, transport: T) -> Self {
        Self {
            id,
            account_count,
            clock: LamportClock::new(),
            history: BalanceHistory::new(id, initial_balance),
            transport,
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn history(&self) -> &BalanceHistory {
        &self.history
    }

    /// Runs the account on a named thread.
    pub fn spawn(self) -> io::Result<JoinHandle<Result<BalanceHistory, TransportError>>> {
        thread::Builder::new()
            .name(format!("ledger-account-{}", self.id))
            .spawn(move || self.run())
    }

    /// Start-up sync, message loop, stop sync, then the history goes to the
    /// coordinator. Returns the history that was sent.
    pub fn run(mut self) -> Result<BalanceHistory, TransportError> {
        self.announce_started()?;
        let done = self.serve()?;
        self.await_done(done)?;
        self.send_history()
    }

    fn peers(&self) -> impl Iterator<Item = NodeId> + use<T> {
        let id = self.id;
        (1..=self.account_count as u16)
            .map(AccountId)
            .filter(move |peer| *peer != id)
            .map(NodeId::from)
    }

    fn announce_started(&mut self) -> Result<(), TransportError> {
        let now = self.clock.tick();
        let balance = self.history.current_balance();
        self.transport.multicast(Message::new(
            MessageKind::Started,
            now,
            Payload::Text(format!("account {} started with balance {balance}", self.id)),
        ))?;
        info!(account = %self.id, time = %now, %balance, "account started");

        for peer in self.peers() {
            let message = self.transport.receive(peer)?;
            self.clock.update(message.local_time);
            if !message.is(MessageKind::Started) {
                warn!(account = %self.id, from = %peer, kind = ?message.kind, "expected started");
            }
        }
        debug!(account = %self.id, time = %self.clock.now(), "all accounts started");
        Ok(())
    }

    /// Handles transfers until `Stop`. Returns how many `Done` were seen.
    fn serve(&mut self) -> Result<usize, TransportError> {
        let mut done = 0;
        loop {
            let (from, message) = self.transport.receive_any()?;
            let now = self.clock.update(message.local_time);
            if !message.is_well_formed() {
                warn!(account = %self.id, %from, "dropping message without magic");
                continue;
            }

            match message.kind {
                MessageKind::Transfer => self.debit(&message, now, true),
                MessageKind::Debit => self.debit(&message, now, false),
                MessageKind::Credit => self.credit(&message, now)?,
                MessageKind::Done => done += 1,
                MessageKind::Stop => {
                    self.history.extend_to(now);
                    let balance = self.history.current_balance();
                    self.transport.multicast(Message::new(
                        MessageKind::Done,
                        now,
                        Payload::Text(format!("account {} done with balance {balance}", self.id)),
                    ))?;
                    info!(account = %self.id, time = %now, %balance, "account done");
                    return Ok(done);
                }
                other => {
                    warn!(account = %self.id, %from, kind = ?other, "unexpected message ignored")
                }
            }
        }
    }

    /// Debits the source. With `forward`, also passes the credit on; a
    /// destination outside the run is refused before anything is debited.
    fn debit(&mut self, message: &Message, now: LogicalTime, forward: bool) {
        let Some(instruction) = message.instruction() else {
            warn!(account = %self.id, "debit without order ignored");
            return;
        };
        let order = instruction.order;
        if order.source != self.id {
            warn!(account = %self.id, source = %order.source, "debit for another account ignored");
            return;
        }
        if forward && !self.is_peer(order.destination) {
            warn!(
                account = %self.id,
                destination = %order.destination,
                amount = %order.amount,
                "transfer to unknown account refused"
            );
            return;
        }

        self.history.record_debit(now, order.amount);
        info!(
            account = %self.id,
            time = %now,
            amount = %order.amount,
            destination = %order.destination,
            "transfer out"
        );
        if forward {
            if let Err(error) = self.transport.forward_credit(instruction, now) {
                warn!(
                    account = %self.id,
                    destination = %order.destination,
                    amount = %order.amount,
                    %error,
                    "credit not forwarded"
                );
            }
        }
    }

    fn credit(&mut self, message: &Message, now: LogicalTime) -> Result<(), TransportError> {
        let Some(instruction) = message.instruction() else {
            warn!(account = %self.id, "credit without order ignored");
            return Ok(());
        };
        let order = instruction.order;
        if order.destination != self.id {
            warn!(account = %self.id, destination = %order.destination, "credit for another account ignored");
            return Ok(());
        }

        self.history.record_credit(message.local_time, now, order.amount);
        info!(
            account = %self.id,
            time = %now,
            amount = %order.amount,
            source = %order.source,
            "transfer in"
        );
        self.transport.send(NodeId::PARENT, Message::ack(now, instruction))
    }

    fn is_peer(&self, account: AccountId) -> bool {
        self.peers().any(|peer| peer == NodeId::from(account))
    }

    fn await_done(&mut self, mut done: usize) -> Result<(), TransportError> {
        let expected = self.account_count - 1;
        while done < expected {
            let (from, message) = self.transport.receive_any()?;
            self.clock.update(message.local_time);
            if message.is(MessageKind::Done) {
                done += 1;
            } else {
                debug!(account = %self.id, %from, kind = ?message.kind, "ignored after stop");
            }
        }
        debug!(account = %self.id, time = %self.clock.now(), "all accounts done");
        Ok(())
    }

    fn send_history(self) -> Result<BalanceHistory, TransportError> {
        let now = self.clock.tick();
        self.transport.send(
            NodeId::PARENT,
            Message::new(
                MessageKind::BalanceHistory,
                now,
                Payload::History(self.history.clone()),
            ),
        )?;
        Ok(self.history)
    }
}
