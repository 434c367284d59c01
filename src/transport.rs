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

//! Point-to-point and multicast messaging between nodes.
//!
//! The shard engine only talks to accounts through [`Transport`]. The crate
//! ships one implementation, [`ChannelEndpoint`], backed by a full mesh of
//! unbounded channels built by [`ChannelNetwork`]. Delivery between any two
//! nodes is FIFO.

use crate::base::{AccountId, LogicalTime, NodeId};
use crate::error::TransportError;
use crate::message::{Instruction, Message, MessageKind};
use crate::transfer::TransferOrder;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Select, Sender};
use std::time::Duration;

/// One node's view of the network.
pub trait Transport: Send + Sync {
    /// Address of this endpoint.
    fn id(&self) -> NodeId;

    fn send(&self, to: NodeId, message: Message) -> Result<(), TransportError>;

    /// Blocks until a message from `from` arrives.
    fn receive(&self, from: NodeId) -> Result<Message, TransportError>;

    /// Blocks until a message from any peer arrives.
    fn receive_any(&self) -> Result<(NodeId, Message), TransportError>;

    /// Sends a copy to every other node, including the coordinator.
    fn multicast(&self, message: Message) -> Result<(), TransportError>;

    /// Waits for the next reply from `account`. The caller decides whether
    /// the reply acknowledges what it is waiting for.
    fn await_acknowledgment(&self, account: AccountId) -> Result<Message, TransportError>;

    /// Asks the source to debit and forward a credit to the destination.
    fn send_transfer(&self, order: TransferOrder, time: LogicalTime) -> Result<(), TransportError> {
        self.send(
            order.source.into(),
            Message::order(MessageKind::Transfer, time, order),
        )
    }

    /// Asks the source to debit only.
    fn send_debit(&self, order: TransferOrder, time: LogicalTime) -> Result<(), TransportError> {
        self.send(
            order.source.into(),
            Message::order(MessageKind::Debit, time, order),
        )
    }

    /// Asks the destination to credit and acknowledge.
    fn send_credit(&self, order: TransferOrder, time: LogicalTime) -> Result<(), TransportError> {
        self.send(
            order.destination.into(),
            Message::order(MessageKind::Credit, time, order),
        )
    }

    /// Passes a received instruction on to its destination as a credit.
    fn forward_credit(&self, instruction: Instruction, time: LogicalTime) -> Result<(), TransportError> {
        self.send(
            instruction.order.destination.into(),
            Message::forward(MessageKind::Credit, time, instruction),
        )
    }
}

/// Builder for an in-process mesh of `node_count` endpoints.
#[derive(Debug, Clone)]
pub struct ChannelNetwork {
    node_count: usize,
    ack_timeout: Option<Duration>,
}

impl ChannelNetwork {
    /// `node_count` includes the coordinator at node 0.
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            ack_timeout: None,
        }
    }

    /// Bounds every [`Transport::await_acknowledgment`] call.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    /// Creates the channels. Endpoint `i` has address `NodeId(i)`.
    pub fn build(self) -> Vec<ChannelEndpoint> {
        let n = self.node_count;
        let mut outbound: Vec<Vec<Option<Sender<Message>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut inbound: Vec<Vec<Option<Receiver<Message>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

        for from in 0..n {
            for to in 0..n {
                if from != to {
                    let (tx, rx) = channel::unbounded();
                    outbound[from][to] = Some(tx);
                    inbound[to][from] = Some(rx);
                }
            }
        }

        outbound
            .into_iter()
            .zip(inbound)
            .enumerate()
            .map(|(id, (outbound, inbound))| ChannelEndpoint {
                id: NodeId(id as u16),
                outbound,
                inbound,
                ack_timeout: self.ack_timeout,
            })
            .collect()
    }
}

/// A node's sending and receiving halves of the mesh.
#[derive(Debug)]
pub struct ChannelEndpoint {
    id: NodeId,
    outbound: Vec<Option<Sender<Message>>>,
    inbound: Vec<Option<Receiver<Message>>>,
    ack_timeout: Option<Duration>,
}

impl ChannelEndpoint {
    fn sender(&self, to: NodeId) -> Result<&Sender<Message>, TransportError> {
        self.outbound
            .get(to.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(TransportError::UnknownPeer(to))
    }

    fn receiver(&self, from: NodeId) -> Result<&Receiver<Message>, TransportError> {
        self.inbound
            .get(from.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(TransportError::UnknownPeer(from))
    }

    /// Like [`Transport::receive`] but gives up after `timeout`.
    pub fn receive_timeout(&self, from: NodeId, timeout: Duration) -> Result<Message, TransportError> {
        self.receiver(from)?
            .recv_timeout(timeout)
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => TransportError::Timeout(from),
                RecvTimeoutError::Disconnected => TransportError::Disconnected(from),
            })
    }
}

impl Transport for ChannelEndpoint {
    fn id(&self) -> NodeId {
        self.id
    }

    fn send(&self, to: NodeId, message: Message) -> Result<(), TransportError> {
        self.sender(to)?
            .send(message)
            .map_err(|_| TransportError::Disconnected(to))
    }

    fn receive(&self, from: NodeId) -> Result<Message, TransportError> {
        self.receiver(from)?
            .recv()
            .map_err(|_| TransportError::Disconnected(from))
    }

    fn receive_any(&self) -> Result<(NodeId, Message), TransportError> {
        let peers: Vec<(NodeId, &Receiver<Message>)> = self
            .inbound
            .iter()
            .enumerate()
            .filter_map(|(id, rx)| rx.as_ref().map(|rx| (NodeId(id as u16), rx)))
            .collect();
        if peers.is_empty() {
            return Err(TransportError::UnknownPeer(self.id));
        }

        let mut select = Select::new();
        for (_, rx) in &peers {
            select.recv(rx);
        }
        let operation = select.select();
        let (peer, rx) = peers[operation.index()];
        operation
            .recv(rx)
            .map(|message| (peer, message))
            .map_err(|_| TransportError::Disconnected(peer))
    }

    fn multicast(&self, message: Message) -> Result<(), TransportError> {
        let mut first_error = None;
        for (id, tx) in self.outbound.iter().enumerate() {
            let Some(tx) = tx else { continue };
            if tx.send(message.clone()).is_err() {
                first_error.get_or_insert(TransportError::Disconnected(NodeId(id as u16)));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn await_acknowledgment(&self, account: AccountId) -> Result<Message, TransportError> {
        match self.ack_timeout {
            Some(timeout) => self.receive_timeout(account.into(), timeout),
            None => self.receive(account.into()),
        }
    }
}
