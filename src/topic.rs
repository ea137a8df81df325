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

//! Topics of the MQTT connection and parsing of the incoming ones.
//!
//! Every topic is rooted at `<realm>/<device_id>`. Data topics append the
//! interface name and the path, control topics append `/control/...`.

use std::fmt::{self, Display};

/// Suffix of the topic receiving the authoritative set of properties.
pub(crate) const CONSUMER_PROPERTIES_SUFFIX: &str = "control/consumer/properties";

/// Error returned when parsing a received topic.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The topic is empty.
    #[error("topic is empty")]
    Empty,
    /// The topic is not rooted at this device's `<realm>/<device_id>`.
    #[error("topic '{topic}' is not rooted at '{client_id}'")]
    UnknownClientId {
        /// Base topic of this device.
        client_id: String,
        /// The received topic.
        topic: String,
    },
    /// The topic has no interface or path component.
    #[error("topic '{0}' should be in the form <realm>/<device_id>/<interface>/<path>")]
    Malformed(String),
}

impl TopicError {
    /// Returns the topic that failed to parse.
    pub fn topic(&self) -> &str {
        match self {
            TopicError::Empty => "",
            TopicError::UnknownClientId { topic, .. } => topic,
            TopicError::Malformed(topic) => topic,
        }
    }
}

/// The `<realm>/<device_id>` pair identifying the device on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClientId<S = String> {
    pub(crate) realm: S,
    pub(crate) device_id: S,
}

impl ClientId<String> {
    pub(crate) fn as_ref(&self) -> ClientId<&str> {
        ClientId {
            realm: &self.realm,
            device_id: &self.device_id,
        }
    }
}

impl<S> Display for ClientId<S>
where
    S: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.realm, self.device_id)
    }
}

/// A received topic, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedTopic<'a> {
    /// The consumer properties control message.
    ConsumerProperties,
    /// A data publish for an interface.
    Data {
        /// Name of the interface.
        interface: &'a str,
        /// Path of the value, with the leading slash.
        path: &'a str,
    },
}

impl<'a> ParsedTopic<'a> {
    /// Splits a received topic into its components.
    pub(crate) fn try_parse(
        client_id: ClientId<&str>,
        topic: &'a str,
    ) -> Result<Self, TopicError> {
        if topic.is_empty() {
            return Err(TopicError::Empty);
        }

        let rest = topic
            .strip_prefix(client_id.realm)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_prefix(client_id.device_id))
            .ok_or_else(|| TopicError::UnknownClientId {
                client_id: client_id.to_string(),
                topic: topic.to_string(),
            })?;

        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| TopicError::Malformed(topic.to_string()))?;

        if rest == CONSUMER_PROPERTIES_SUFFIX {
            return Ok(ParsedTopic::ConsumerProperties);
        }

        let (interface, path) = rest
            .find('/')
            .map(|idx| rest.split_at(idx))
            .ok_or_else(|| TopicError::Malformed(topic.to_string()))?;

        if interface.is_empty() || path.len() <= 1 {
            return Err(TopicError::Malformed(topic.to_string()));
        }

        Ok(ParsedTopic::Data { interface, path })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const CLIENT_ID: ClientId<&str> = ClientId {
        realm: "realm",
        device_id: "u-WraCwtK_G_fjJf63TiAw",
    };

    #[test]
    fn parse_data_topic() {
        let topic = "realm/u-WraCwtK_G_fjJf63TiAw/com.interface.Test/led/red";

        let parsed = ParsedTopic::try_parse(CLIENT_ID, topic).unwrap();

        assert_eq!(
            parsed,
            ParsedTopic::Data {
                interface: "com.interface.Test",
                path: "/led/red",
            }
        );
    }

    #[test]
    fn parse_consumer_properties_topic() {
        let topic = "realm/u-WraCwtK_G_fjJf63TiAw/control/consumer/properties";

        let parsed = ParsedTopic::try_parse(CLIENT_ID, topic).unwrap();

        assert_eq!(parsed, ParsedTopic::ConsumerProperties);
    }

    #[test]
    fn parse_empty_topic() {
        let err = ParsedTopic::try_parse(CLIENT_ID, "").unwrap_err();

        assert_eq!(err, TopicError::Empty);
    }

    #[test]
    fn parse_foreign_topic() {
        let topic = "realm/another-device/com.interface.Test/led";

        let err = ParsedTopic::try_parse(CLIENT_ID, topic).unwrap_err();

        assert!(matches!(err, TopicError::UnknownClientId { .. }));
    }

    #[test]
    fn parse_topic_without_path() {
        let topic = "realm/u-WraCwtK_G_fjJf63TiAw/com.interface.Test";

        let err = ParsedTopic::try_parse(CLIENT_ID, topic).unwrap_err();

        assert!(matches!(err, TopicError::Malformed(_)));
    }

    #[test]
    fn parse_bare_client_id() {
        let err = ParsedTopic::try_parse(CLIENT_ID, &CLIENT_ID.to_string()).unwrap_err();

        assert!(matches!(err, TopicError::Malformed(_)));
    }
}
