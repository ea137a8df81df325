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

//! MQTT session machine.
//!
//! Drives the connection lifecycle over the wire collaborator: CONNECT and
//! CONNACK handling, the introspection handshake, per message QoS bookkeeping
//! with timeout driven retransmission, keepalive and reconnection with
//! exponential backoff.
//!
//! The session is advanced cooperatively by [`MqttConnection::poll`], which
//! also delivers the received publishes.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use mqttbytes::QoS;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::retry::ExponentialBackoff;
use crate::topic::ClientId;
use crate::transport::{Mqtt, OutgoingPublish, TransportError, TransportEvent};

/// Errors of the MQTT session.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    /// The wire collaborator failed.
    #[error("transport error")]
    Transport(#[from] TransportError),
    /// The operation requires a connected session.
    #[error("the session is not connected")]
    NotConnected,
    /// The operation is not valid in the current state.
    #[error("invalid session state for the operation")]
    InvalidState,
}

/// State of the session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// No connection, nothing to do.
    Disconnected,
    /// CONNECT sent, waiting for the CONNACK.
    Connecting,
    /// CONNACK received without a session, the handshake must run.
    HandshakeStart,
    /// Handshake published, waiting for all the SUBACKs.
    HandshakeEnd,
    /// Connection or handshake failed, waiting out the backoff.
    HandshakeError,
    /// Session established.
    Connected,
}

/// What a cached packet id is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheKind {
    /// Waiting for the SUBACK.
    Subscribe,
    /// Waiting for the PUBACK (QoS 1) or the PUBREC (QoS 2).
    Publish,
    /// PUBREL sent, waiting for the PUBCOMP.
    PubRec,
}

/// An in flight message, kept until its terminating ack.
#[derive(Debug, Clone)]
struct CacheEntry {
    kind: CacheKind,
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    expiry: Instant,
}

/// Data the session publishes during the handshake.
///
/// Captured by the controller when the connection is opened; the
/// introspection cannot change while connected, so the data stays valid for
/// every retry of the same session.
#[derive(Debug, Clone, Default)]
pub(crate) struct HandshakeData {
    /// The introspection string, published on the base topic.
    pub(crate) introspection: String,
    /// Names of the server owned interfaces to subscribe to.
    pub(crate) server_interfaces: Vec<String>,
    /// Producer properties control payload.
    pub(crate) producer_properties: Vec<u8>,
    /// Device owned properties to re-publish, as `(topic, payload)` pairs.
    pub(crate) device_properties: Vec<(String, Vec<u8>)>,
}

/// Event delivered to the device controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    /// The session reached the connected state.
    Connected {
        /// Session present flag of the CONNACK.
        session_present: bool,
    },
    /// An incoming data publish.
    Publish {
        /// Full topic of the publish.
        topic: String,
        /// Raw payload.
        payload: Bytes,
    },
}

/// Configuration of the session machine.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    /// Window the socket is polled for on every [`MqttConnection::poll`].
    pub(crate) poll_timeout: Duration,
    /// Timeout before an unacknowledged message is retransmitted.
    pub(crate) ack_timeout: Duration,
    /// Backoff pacing the reconnections.
    pub(crate) backoff: ExponentialBackoff,
}

/// The MQTT session machine over a wire collaborator.
pub(crate) struct MqttConnection<T> {
    /// Serializes the access to the transport, so a publish from another
    /// task doesn't interleave with an in progress poll.
    transport: Mutex<T>,
    client_id: ClientId,
    config: SessionConfig,
    state: SessionState,
    message_id: u16,
    session_present: bool,
    subscription_failure: bool,
    synchronization_completed: bool,
    retry_at: Option<Instant>,
    cache: HashMap<u16, CacheEntry>,
    incoming_pubrec: HashSet<u16>,
    handshake: HandshakeData,
}

impl<T> MqttConnection<T>
where
    T: Mqtt,
{
    pub(crate) fn new(transport: T, client_id: ClientId, config: SessionConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            client_id,
            config,
            state: SessionState::Disconnected,
            message_id: 0,
            session_present: false,
            subscription_failure: false,
            synchronization_completed: false,
            retry_at: None,
            cache: HashMap::new(),
            incoming_pubrec: HashSet::new(),
            handshake: HandshakeData::default(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Whether the handshake of the current session completed.
    pub(crate) fn synchronization_completed(&self) -> bool {
        self.synchronization_completed
    }

    /// Session present flag of the last CONNACK.
    pub(crate) fn session_present(&self) -> bool {
        self.session_present
    }

    /// Opens the connection and sends the CONNECT packet.
    pub(crate) async fn connect(&mut self, handshake: HandshakeData) -> Result<(), ConnectionError> {
        if self.state != SessionState::Disconnected {
            return Err(ConnectionError::InvalidState);
        }

        self.handshake = handshake;
        self.reset_session();

        let result = self.transport.lock().await.connect().await;
        match result {
            Ok(()) => {
                debug!("connect sent, waiting for the connack");
                self.state = SessionState::Connecting;

                Ok(())
            }
            Err(err) => {
                self.schedule_retry();

                Err(err.into())
            }
        }
    }

    /// Forces the session to disconnected, dropping every in flight message.
    ///
    /// Idempotent, the disconnect packet is sent on a best effort basis.
    pub(crate) async fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }

        if let Err(err) = self.transport.lock().await.disconnect().await {
            warn!("error while disconnecting: {err}");
        }

        self.state = SessionState::Disconnected;
        self.reset_session();
    }

    fn reset_session(&mut self) {
        self.cache.clear();
        self.incoming_pubrec.clear();
        self.subscription_failure = false;
        self.synchronization_completed = false;
        self.retry_at = None;
    }

    /// Allocates the next packet id, skipping 0 and the ids of in flight
    /// messages.
    fn next_message_id(&mut self) -> u16 {
        loop {
            self.message_id = (self.message_id % u16::MAX) + 1;

            if !self.cache.contains_key(&self.message_id) {
                return self.message_id;
            }
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.config.backoff.next_delay();

        info!(?delay, "scheduling reconnection");

        self.state = SessionState::HandshakeError;
        self.retry_at = Some(Instant::now() + delay);
    }

    /// Marks the session as failed and schedules the reconnection.
    fn enter_handshake_error(&mut self) {
        self.cache.clear();
        self.incoming_pubrec.clear();
        self.schedule_retry();
    }

    /// Publishes a message with the QoS bookkeeping of the session.
    pub(crate) async fn publish(
        &mut self,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), ConnectionError> {
        if !matches!(
            self.state,
            SessionState::Connected | SessionState::HandshakeStart | SessionState::HandshakeEnd
        ) {
            return Err(ConnectionError::NotConnected);
        }

        let pkid = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => self.next_message_id(),
        };

        trace!(%topic, pkid, ?qos, "publishing");

        let res = self
            .transport
            .lock()
            .await
            .publish(OutgoingPublish {
                topic: &topic,
                payload: &payload,
                qos,
                pkid,
                dup: false,
            })
            .await;

        if let Err(err) = res {
            self.enter_handshake_error();

            return Err(err.into());
        }

        if qos != QoS::AtMostOnce {
            self.cache.insert(
                pkid,
                CacheEntry {
                    kind: CacheKind::Publish,
                    topic,
                    payload,
                    qos,
                    expiry: Instant::now() + self.config.ack_timeout,
                },
            );
        }

        Ok(())
    }

    /// Subscribes to a topic filter, tracking the SUBACK.
    async fn subscribe(&mut self, topic: String, qos: QoS) -> Result<(), ConnectionError> {
        let pkid = self.next_message_id();

        trace!(%topic, pkid, "subscribing");

        let res = self.transport.lock().await.subscribe(pkid, &topic, qos).await;

        if let Err(err) = res {
            self.enter_handshake_error();

            return Err(err.into());
        }

        self.cache.insert(
            pkid,
            CacheEntry {
                kind: CacheKind::Subscribe,
                topic,
                payload: Vec::new(),
                qos,
                expiry: Instant::now() + self.config.ack_timeout,
            },
        );

        Ok(())
    }

    /// Advances the session machine.
    ///
    /// Blocks the caller for at most the poll timeout. Returns the event the
    /// controller has to handle, if any.
    pub(crate) async fn poll(&mut self) -> Result<Option<SessionEvent>, ConnectionError> {
        match self.state {
            SessionState::Disconnected => Ok(None),
            SessionState::HandshakeError => self.poll_retry().await,
            SessionState::HandshakeStart => {
                self.run_handshake().await?;

                // With no server interface there is no SUBACK to wait for.
                Ok(self.try_complete_handshake())
            }
            SessionState::Connecting | SessionState::HandshakeEnd | SessionState::Connected => {
                self.poll_transport().await
            }
        }
    }

    /// Waits out the backoff, then tears the connection down and retries.
    async fn poll_retry(&mut self) -> Result<Option<SessionEvent>, ConnectionError> {
        let retry_at = self.retry_at.unwrap_or_else(Instant::now);
        let now = Instant::now();

        if now < retry_at {
            let wakeup = retry_at.min(now + self.config.poll_timeout);
            tokio::time::sleep_until(wakeup).await;

            if Instant::now() < retry_at {
                return Ok(None);
            }
        }

        debug!("backoff expired, reconnecting");

        let mut transport = self.transport.lock().await;

        if let Err(err) = transport.disconnect().await {
            trace!("disconnect before retry failed: {err}");
        }

        match transport.connect().await {
            Ok(()) => {
                drop(transport);

                self.reset_session();
                self.state = SessionState::Connecting;

                Ok(None)
            }
            Err(err) => {
                drop(transport);

                self.schedule_retry();

                Err(err.into())
            }
        }
    }

    /// Runs the handshake of a fresh session.
    ///
    /// Subscribes to the control and server interface topics, then publishes
    /// introspection, empty cache marker and the device owned properties.
    async fn run_handshake(&mut self) -> Result<(), ConnectionError> {
        debug!("starting the session handshake");

        let base = self.client_id.to_string();

        self.subscribe(format!("{base}/control/consumer/properties"), QoS::ExactlyOnce)
            .await?;

        let server_interfaces = self.handshake.server_interfaces.clone();
        for interface in server_interfaces {
            self.subscribe(format!("{base}/{interface}/#"), QoS::ExactlyOnce)
                .await?;
        }

        let introspection = self.handshake.introspection.clone();
        debug!(%introspection, "sending introspection");
        self.publish(base.clone(), introspection.into_bytes(), QoS::ExactlyOnce)
            .await?;

        self.publish(
            format!("{base}/control/emptyCache"),
            b"1".to_vec(),
            QoS::ExactlyOnce,
        )
        .await?;

        self.publish(
            format!("{base}/control/producer/properties"),
            self.handshake.producer_properties.clone(),
            QoS::ExactlyOnce,
        )
        .await?;

        let device_properties = self.handshake.device_properties.clone();
        for (topic, payload) in device_properties {
            debug!(%topic, "sending device owned property");
            self.publish(topic, payload, QoS::ExactlyOnce).await?;
        }

        self.state = SessionState::HandshakeEnd;

        Ok(())
    }

    /// Latches the synchronization once every SUBACK arrived.
    fn try_complete_handshake(&mut self) -> Option<SessionEvent> {
        if self.state != SessionState::HandshakeEnd {
            return None;
        }

        let pending_subscriptions = self
            .cache
            .values()
            .any(|entry| entry.kind == CacheKind::Subscribe);

        if pending_subscriptions {
            return None;
        }

        if self.subscription_failure {
            error!("the broker rejected a subscription");
            self.enter_handshake_error();

            return None;
        }

        info!("session handshake completed");

        self.synchronization_completed = true;
        self.state = SessionState::Connected;
        self.config.backoff.reset();

        Some(SessionEvent::Connected {
            session_present: false,
        })
    }

    /// Polls the socket and services retransmissions and keepalive.
    async fn poll_transport(&mut self) -> Result<Option<SessionEvent>, ConnectionError> {
        if let Err(err) = self.service_cache().await {
            self.enter_handshake_error();

            return Err(err);
        }

        let mut transport = self.transport.lock().await;

        let keepalive = transport.keepalive_remaining();
        if keepalive.is_zero() && self.state == SessionState::Connected {
            trace!("keepalive expired, pinging");

            if let Err(err) = transport.ping().await {
                drop(transport);
                self.enter_handshake_error();

                return Err(err.into());
            }
        }

        let window = self.config.poll_timeout.min(transport.keepalive_remaining());

        let polled = transport.poll(window).await;
        drop(transport);

        match polled {
            Ok(Some(event)) => self.handle_event(event).await,
            Ok(None) => Ok(None),
            Err(err) => {
                error!("transport error while polling: {err}");
                self.enter_handshake_error();

                Err(err.into())
            }
        }
    }

    /// Retransmits every in flight message past its ack timeout.
    async fn service_cache(&mut self) -> Result<(), ConnectionError> {
        let now = Instant::now();

        let expired: Vec<u16> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.expiry <= now)
            .map(|(&pkid, _)| pkid)
            .collect();

        for pkid in expired {
            let Some(entry) = self.cache.get(&pkid).cloned() else {
                continue;
            };

            warn!(pkid, kind = ?entry.kind, "ack timeout, retransmitting");

            let mut transport = self.transport.lock().await;

            match entry.kind {
                CacheKind::Publish => {
                    transport
                        .publish(OutgoingPublish {
                            topic: &entry.topic,
                            payload: &entry.payload,
                            qos: entry.qos,
                            pkid,
                            dup: true,
                        })
                        .await?;
                }
                CacheKind::PubRec => {
                    transport.pubrel(pkid).await?;
                }
                CacheKind::Subscribe => {
                    transport.subscribe(pkid, &entry.topic, entry.qos).await?;
                }
            }

            drop(transport);

            if let Some(entry) = self.cache.get_mut(&pkid) {
                entry.expiry = now + self.config.ack_timeout;
            }
        }

        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<Option<SessionEvent>, ConnectionError> {
        match event {
            TransportEvent::ConnAck { session_present } => {
                if self.state != SessionState::Connecting {
                    warn!("unexpected connack");

                    return Ok(None);
                }

                self.session_present = session_present;

                if session_present {
                    info!("session resumed by the broker");
                    self.state = SessionState::Connected;
                    self.config.backoff.reset();

                    return Ok(Some(SessionEvent::Connected {
                        session_present: true,
                    }));
                }

                debug!("no session on the broker, handshake armed");
                self.state = SessionState::HandshakeStart;

                Ok(None)
            }
            TransportEvent::SubAck { pkid, failure } => {
                let removed = self
                    .cache
                    .remove(&pkid)
                    .is_some_and(|entry| entry.kind == CacheKind::Subscribe);

                if !removed {
                    warn!(pkid, "unsolicited suback");
                }

                if failure {
                    error!(pkid, "subscription rejected by the broker");
                    self.subscription_failure = true;
                }

                Ok(self.try_complete_handshake())
            }
            TransportEvent::PubAck { pkid } => {
                if self.cache.remove(&pkid).is_none() {
                    warn!(pkid, "unsolicited puback");
                }

                Ok(self.try_complete_handshake())
            }
            TransportEvent::PubRec { pkid } => {
                match self.cache.get_mut(&pkid) {
                    Some(entry) if entry.kind == CacheKind::Publish => {
                        entry.kind = CacheKind::PubRec;
                        entry.payload = Vec::new();
                        entry.expiry = Instant::now() + self.config.ack_timeout;
                    }
                    _ => {
                        warn!(pkid, "unsolicited pubrec");

                        return Ok(None);
                    }
                }

                self.transport.lock().await.pubrel(pkid).await?;

                Ok(None)
            }
            TransportEvent::PubComp { pkid } => {
                if self.cache.remove(&pkid).is_none() {
                    warn!(pkid, "unsolicited pubcomp");
                }

                Ok(self.try_complete_handshake())
            }
            TransportEvent::PubRel { pkid } => {
                self.incoming_pubrec.remove(&pkid);
                self.transport.lock().await.pubcomp(pkid).await?;

                Ok(None)
            }
            TransportEvent::Publish(publish) => {
                match publish.qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => {
                        self.transport.lock().await.puback(publish.pkid).await?;
                    }
                    QoS::ExactlyOnce => {
                        self.incoming_pubrec.insert(publish.pkid);
                        self.transport.lock().await.pubrec(publish.pkid).await?;
                    }
                }

                trace!(topic = %publish.topic, "incoming publish");

                Ok(Some(SessionEvent::Publish {
                    topic: publish.topic,
                    payload: publish.payload,
                }))
            }
            TransportEvent::PingResp => {
                trace!("pong");

                Ok(None)
            }
        }
    }
}

impl<T> std::fmt::Debug for MqttConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("in_flight", &self.cache.len())
            .finish_non_exhaustive()
    }
}
