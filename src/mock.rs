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

//! Scripted transport used to drive the session machine in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mqttbytes::QoS;

use crate::transport::{Mqtt, OutgoingPublish, TransportError, TransportEvent};

/// A call recorded by the [`FakeTransport`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Connect,
    Disconnect,
    Subscribe {
        pkid: u16,
        topic: String,
    },
    Publish {
        pkid: u16,
        topic: String,
        payload: Vec<u8>,
        dup: bool,
        qos: QoS,
    },
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Ping,
}

/// Scripted wire collaborator: every poll pops the next event of the script
/// and every call is recorded for the test to inspect.
pub(crate) struct FakeTransport {
    script: Vec<Result<Option<TransportEvent>, TransportError>>,
    actions: Arc<Mutex<Vec<Action>>>,
    pub(crate) fail_connect: bool,
    pub(crate) keepalive: Duration,
}

impl FakeTransport {
    pub(crate) fn new(
        script: Vec<Result<Option<TransportEvent>, TransportError>>,
    ) -> (Self, Arc<Mutex<Vec<Action>>>) {
        let actions = Arc::new(Mutex::new(Vec::new()));

        let transport = Self {
            script,
            actions: Arc::clone(&actions),
            fail_connect: false,
            keepalive: Duration::from_secs(60),
        };

        (transport, actions)
    }

    fn record(&self, action: Action) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl Mqtt for FakeTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.record(Action::Connect);

        if self.fail_connect {
            return Err(TransportError::Closed);
        }

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(Action::Disconnect);

        Ok(())
    }

    async fn subscribe(&mut self, pkid: u16, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.record(Action::Subscribe {
            pkid,
            topic: topic.to_string(),
        });

        Ok(())
    }

    async fn publish(&mut self, publish: OutgoingPublish<'_>) -> Result<(), TransportError> {
        self.record(Action::Publish {
            pkid: publish.pkid,
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            dup: publish.dup,
            qos: publish.qos,
        });

        Ok(())
    }

    async fn puback(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.record(Action::PubAck(pkid));

        Ok(())
    }

    async fn pubrec(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.record(Action::PubRec(pkid));

        Ok(())
    }

    async fn pubrel(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.record(Action::PubRel(pkid));

        Ok(())
    }

    async fn pubcomp(&mut self, pkid: u16) -> Result<(), TransportError> {
        self.record(Action::PubComp(pkid));

        Ok(())
    }

    async fn poll(&mut self, _timeout: Duration) -> Result<Option<TransportEvent>, TransportError> {
        if self.script.is_empty() {
            return Ok(None);
        }

        self.script.remove(0)
    }

    fn keepalive_remaining(&self) -> Duration {
        self.keepalive
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.record(Action::Ping);

        Ok(())
    }
}
