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

//! Transport implementation over a plain byte stream.
//!
//! Packets are encoded with the `mqttbytes` 3.1.1 codec and exchanged over
//! any stream produced by the configured [`Connector`]. The bundled
//! [`TcpConnector`] opens a TCP socket; mutual TLS is provided by the
//! integrator with a connector that wraps the stream with its TLS
//! implementation and the refreshed client certificate.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use mqttbytes::v4::{
    Connect, Disconnect, Packet, PingReq, PubAck, PubComp, PubRec, PubRel, Publish, Subscribe,
    SubscribeReasonCode,
};
use mqttbytes::QoS;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{IncomingPublish, Mqtt, OutgoingPublish, TransportError, TransportEvent};

/// Default bound for the receive buffer.
const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// A byte stream the transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens the byte stream the MQTT packets are exchanged on.
///
/// The connector is the seam where TLS is layered: an implementation can
/// resolve credentials, refresh the client certificate and wrap the TCP
/// socket before handing the stream back.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to the given host and port.
    async fn connect(&self, host: &str, port: u16)
        -> std::io::Result<Box<dyn AsyncStream>>;
}

/// Connector for a plain TCP stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn AsyncStream>> {
        let stream = TcpStream::connect((host, port)).await?;

        Ok(Box::new(stream))
    }
}

/// Configuration of the [`TcpMqtt`] transport.
#[derive(Debug, Clone)]
pub struct TcpMqttConfig {
    /// Hostname of the broker.
    pub host: String,
    /// Port of the broker.
    pub port: u16,
    /// MQTT client id, `<realm>/<device_id>` for Astarte.
    pub client_id: String,
    /// Keepalive interval.
    pub keepalive: Duration,
    /// Whether to ask the broker for a clean session.
    pub clean_session: bool,
    /// Timeout for the whole connection attempt.
    pub connection_timeout: Duration,
    /// Bound for the receive buffer, larger packets are rejected.
    pub max_packet_size: usize,
}

impl TcpMqttConfig {
    /// Creates a configuration with the defaults used by Astarte.
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keepalive: Duration::from_secs(60),
            clean_session: false,
            connection_timeout: Duration::from_secs(5),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// MQTT 3.1.1 transport over a connector provided stream.
pub struct TcpMqtt {
    config: TcpMqttConfig,
    connector: Box<dyn Connector>,
    stream: Option<Box<dyn AsyncStream>>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    last_outgoing: Instant,
}

impl TcpMqtt {
    /// Creates the transport over a plain TCP connector.
    pub fn new(config: TcpMqttConfig) -> Self {
        Self::with_connector(config, Box::new(TcpConnector))
    }

    /// Creates the transport over the given connector.
    pub fn with_connector(config: TcpMqttConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            stream: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            last_outgoing: Instant::now(),
        }
    }

    fn stream(&mut self) -> Result<&mut Box<dyn AsyncStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Writes the packet encoded by the closure and flushes the stream.
    async fn write_packet<F>(&mut self, encode: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    {
        self.write_buf.clear();
        encode(&mut self.write_buf)?;

        let buf = self.write_buf.split();
        let stream = self.stream()?;

        stream.write_all(&buf).await?;
        stream.flush().await?;

        self.last_outgoing = Instant::now();

        Ok(())
    }

    /// Maps a received packet to a transport event.
    ///
    /// Packets that don't concern the session return [`None`] and polling
    /// continues.
    fn event_for(&self, packet: Packet) -> Result<Option<TransportEvent>, TransportError> {
        let event = match packet {
            Packet::ConnAck(connack) => {
                let code = connack.code as u8;

                if code != 0 {
                    return Err(TransportError::ConnectionRefused(code));
                }

                TransportEvent::ConnAck {
                    session_present: connack.session_present,
                }
            }
            Packet::SubAck(suback) => {
                let failure = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));

                TransportEvent::SubAck {
                    pkid: suback.pkid,
                    failure,
                }
            }
            Packet::Publish(publish) => TransportEvent::Publish(IncomingPublish {
                topic: publish.topic,
                payload: publish.payload,
                qos: publish.qos,
                pkid: publish.pkid,
            }),
            Packet::PubAck(puback) => TransportEvent::PubAck { pkid: puback.pkid },
            Packet::PubRec(pubrec) => TransportEvent::PubRec { pkid: pubrec.pkid },
            Packet::PubRel(pubrel) => TransportEvent::PubRel { pkid: pubrel.pkid },
            Packet::PubComp(pubcomp) => TransportEvent::PubComp { pkid: pubcomp.pkid },
            Packet::PingResp => TransportEvent::PingResp,
            packet => {
                trace!(?packet, "ignoring packet");

                return Ok(None);
            }
        };

        Ok(Some(event))
    }
}

#[async_trait]
impl Mqtt for TcpMqtt {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let connection = self.connector.connect(&self.config.host, self.config.port);

        let stream = tokio::time::timeout(self.config.connection_timeout, connection)
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;

        debug!(host = %self.config.host, port = self.config.port, "stream connected");

        self.stream = Some(stream);
        self.read_buf.clear();

        let mut connect = Connect::new(self.config.client_id.clone());
        connect.keep_alive = self.config.keepalive.as_secs() as u16;
        connect.clean_session = self.config.clean_session;

        self.write_packet(move |buf| connect.write(buf)).await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Ok(());
        }

        // Send the DISCONNECT on a best effort basis, the stream is dropped
        // in any case.
        let res = self.write_packet(|buf| Disconnect.write(buf)).await;

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }

        res
    }

    async fn subscribe(
        &mut self,
        pkid: u16,
        topic: &str,
        qos: QoS,
    ) -> Result<(), TransportError> {
        let mut subscribe = Subscribe::new(topic, qos);
        subscribe.pkid = pkid;

        self.write_packet(move |buf| subscribe.write(buf)).await
    }

    async fn publish(&mut self, publish: OutgoingPublish<'_>) -> Result<(), TransportError> {
        let mut packet = Publish::new(publish.topic, publish.qos, publish.payload.to_vec());
        packet.pkid = publish.pkid;
        packet.dup = publish.dup;

        self.write_packet(move |buf| packet.write(buf)).await
    }

    async fn puback(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.write_packet(move |buf| PubAck::new(pkid).write(buf)).await
    }

    async fn pubrec(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.write_packet(move |buf| PubRec::new(pkid).write(buf)).await
    }

    async fn pubrel(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.write_packet(move |buf| PubRel::new(pkid).write(buf)).await
    }

    async fn pubcomp(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.write_packet(move |buf| PubComp::new(pkid).write(buf)).await
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<TransportEvent>, TransportError> {
        let deadline = Instant::now() + timeout;
        let max_packet_size = self.config.max_packet_size;

        loop {
            match mqttbytes::v4::read(&mut self.read_buf, max_packet_size) {
                Ok(packet) => {
                    if let Some(event) = self.event_for(packet)? {
                        return Ok(Some(event));
                    }

                    continue;
                }
                Err(mqttbytes::Error::InsufficientBytes(_)) => {
                    if self.read_buf.len() >= max_packet_size {
                        return Err(TransportError::BufferOverrun);
                    }
                }
                Err(err) => return Err(err.into()),
            }

            let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

            let read = tokio::time::timeout_at(deadline, stream.read_buf(&mut self.read_buf));

            match read.await {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    fn keepalive_remaining(&self) -> Duration {
        self.config
            .keepalive
            .saturating_sub(self.last_outgoing.elapsed())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write_packet(|buf| PingReq.write(buf)).await
    }
}

impl std::fmt::Debug for TcpMqtt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMqtt")
            .field("config", &self.config)
            .field("connected", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    /// Transport over an in memory duplex stream, with the other end
    /// returned for the test to act as the broker.
    fn duplex_transport() -> (TcpMqtt, tokio::io::DuplexStream) {
        let (device, broker) = duplex(4096);

        let config = TcpMqttConfig::new("localhost", 1883, "realm/device");
        let mut transport = TcpMqtt::new(config);
        transport.stream = Some(Box::new(device));

        (transport, broker)
    }

    #[tokio::test]
    async fn publish_and_receive_ack() {
        let (mut transport, mut broker) = duplex_transport();

        transport
            .publish(OutgoingPublish {
                topic: "realm/device/com.test/value",
                payload: b"payload",
                qos: QoS::AtLeastOnce,
                pkid: 2,
                dup: false,
            })
            .await
            .unwrap();

        // Read the publish on the broker side.
        let mut buf = BytesMut::new();
        let packet = loop {
            match mqttbytes::v4::read(&mut buf, 4096) {
                Ok(packet) => break packet,
                Err(mqttbytes::Error::InsufficientBytes(_)) => {
                    broker.read_buf(&mut buf).await.unwrap();
                }
                Err(err) => panic!("broker read failed: {err:?}"),
            }
        };

        let Packet::Publish(publish) = packet else {
            panic!("expected a publish, got {packet:?}");
        };
        assert_eq!(publish.topic, "realm/device/com.test/value");
        assert_eq!(publish.pkid, 2);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(&publish.payload[..], b"payload");

        // Answer with the puback.
        let mut out = BytesMut::new();
        PubAck::new(2).write(&mut out).unwrap();
        broker.write_all(&out).await.unwrap();

        let event = transport
            .poll(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TransportEvent::PubAck { pkid: 2 });
    }

    #[tokio::test]
    async fn poll_times_out_without_events() {
        let (mut transport, _broker) = duplex_transport();

        let event = transport.poll(Duration::from_millis(10)).await.unwrap();

        assert_eq!(event, None);
    }

    #[tokio::test]
    async fn poll_reports_closed_stream() {
        let (mut transport, broker) = duplex_transport();

        drop(broker);

        let err = transport.poll(Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn connack_failure_is_an_error() {
        let (mut transport, mut broker) = duplex_transport();

        let connack = mqttbytes::v4::ConnAck {
            session_present: false,
            code: mqttbytes::v4::ConnectReturnCode::NotAuthorized,
        };

        let mut out = BytesMut::new();
        connack.write(&mut out).unwrap();
        broker.write_all(&out).await.unwrap();

        let err = transport.poll(Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }
}
