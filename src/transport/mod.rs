// This file is part of Astarte.
//
// Copyright 2024 SECO Mind Srl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Contract with the MQTT wire collaborator.
//!
//! The session machine doesn't encode packets itself: it drives an
//! implementation of the [`Mqtt`] trait, which owns the socket and the wire
//! representation. The crate bundles [`TcpMqtt`], a plain stream
//! implementation over the `mqttbytes` 3.1.1 codec; TLS is layered by
//! providing a [`tcp::Connector`] that wraps the stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mqttbytes::QoS;

pub use self::tcp::{AsyncStream, Connector, TcpConnector, TcpMqtt, TcpMqttConfig};

pub mod tcp;

/// Errors reported by the transport.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Failure of the underlying socket.
    #[error("socket error")]
    Io(#[from] std::io::Error),
    /// The connection attempt timed out.
    #[error("connection timed out")]
    ConnectTimeout,
    /// Couldn't encode or decode an MQTT packet.
    #[error("MQTT protocol error")]
    Protocol(mqttbytes::Error),
    /// The broker refused the connection.
    #[error("connection refused by the broker, return code {0}")]
    ConnectionRefused(u8),
    /// The peer closed the connection.
    #[error("connection closed by the peer")]
    Closed,
    /// An incoming packet is larger than the receive buffer.
    #[error("incoming packet larger than the receive buffer")]
    BufferOverrun,
    /// The transport is not connected.
    #[error("transport is not connected")]
    NotConnected,
}

impl From<mqttbytes::Error> for TransportError {
    fn from(err: mqttbytes::Error) -> Self {
        TransportError::Protocol(err)
    }
}

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPublish {
    /// Full topic of the publish.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
    /// QoS the broker used for the delivery.
    pub qos: QoS,
    /// Packet id, 0 for QoS 0 publishes.
    pub pkid: u16,
}

/// A publish to send to the broker.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingPublish<'a> {
    /// Full topic of the publish.
    pub topic: &'a str,
    /// Encoded payload.
    pub payload: &'a [u8],
    /// QoS of the delivery.
    pub qos: QoS,
    /// Packet id allocated by the session, 0 for QoS 0.
    pub pkid: u16,
    /// Duplicate flag, set on retransmissions.
    pub dup: bool,
}

/// Event surfaced by polling the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// CONNACK with a success return code.
    ConnAck {
        /// Whether the broker retained the previous session.
        session_present: bool,
    },
    /// SUBACK for the subscription with the given packet id.
    SubAck {
        /// Packet id of the acknowledged subscribe.
        pkid: u16,
        /// Whether the broker rejected any of the filters.
        failure: bool,
    },
    /// An incoming publish.
    Publish(IncomingPublish),
    /// PUBACK terminating a QoS 1 publish.
    PubAck {
        /// Packet id of the acknowledged publish.
        pkid: u16,
    },
    /// PUBREC for the first half of a QoS 2 publish.
    PubRec {
        /// Packet id of the received publish.
        pkid: u16,
    },
    /// PUBREL sent by the broker for a QoS 2 reception.
    PubRel {
        /// Packet id of the released publish.
        pkid: u16,
    },
    /// PUBCOMP terminating a QoS 2 publish.
    PubComp {
        /// Packet id of the completed publish.
        pkid: u16,
    },
    /// Answer to a ping request.
    PingResp,
}

/// MQTT 3.1.1 stream provided by an external collaborator.
///
/// Implementations own the socket, the wire codec and the keepalive clock.
/// All the session logic (packet id allocation, QoS bookkeeping,
/// retransmission, reconnection) lives above this trait.
#[async_trait]
pub trait Mqtt: Send {
    /// Opens the network connection and sends the CONNECT packet.
    ///
    /// The CONNACK is delivered later by [`poll`](Self::poll).
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Sends the DISCONNECT packet and closes the connection.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Sends a SUBSCRIBE for a single topic filter.
    async fn subscribe(&mut self, pkid: u16, topic: &str, qos: QoS)
        -> Result<(), TransportError>;

    /// Sends a PUBLISH.
    async fn publish(&mut self, publish: OutgoingPublish<'_>) -> Result<(), TransportError>;

    /// Acknowledges a QoS 1 publish.
    async fn puback(&mut self, pkid: u16) -> Result<(), TransportError>;

    /// First acknowledgment of a received QoS 2 publish.
    async fn pubrec(&mut self, pkid: u16) -> Result<(), TransportError>;

    /// Release of an outgoing QoS 2 publish.
    async fn pubrel(&mut self, pkid: u16) -> Result<(), TransportError>;

    /// Completion of a received QoS 2 publish.
    async fn pubcomp(&mut self, pkid: u16) -> Result<(), TransportError>;

    /// Waits for the next event, returning [`None`] on timeout.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<TransportEvent>, TransportError>;

    /// Time left before the keepalive must be serviced.
    fn keepalive_remaining(&self) -> Duration;

    /// Sends a ping request.
    async fn ping(&mut self) -> Result<(), TransportError>;
}
