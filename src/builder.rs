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

//! Configuration and construction of a [`DeviceClient`].

use std::ffi::OsStr;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::{MqttConnection, SessionConfig};
use crate::interface::error::InterfaceError;
use crate::interface::Interface;
use crate::interfaces::{Interfaces, InterfacesError};
use crate::retry::{BackoffError, ExponentialBackoff};
use crate::store::{MemoryStore, NvRecords, PropertyCache};
use crate::topic::ClientId;
use crate::transport::{Connector, Mqtt, TcpMqtt, TcpMqttConfig};
use crate::DeviceClient;

/// Astarte builder error.
///
/// Possible errors raised while configuring the device.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum BuilderError {
    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Error while adding an interface.
    #[error("error creating interface")]
    Interface(#[from] InterfaceError),

    /// The interface cannot be registered.
    #[error("couldn't register the interface")]
    Interfaces(#[from] InterfacesError),

    /// The reconnection backoff is misconfigured.
    #[error("invalid reconnection backoff")]
    Backoff(#[from] BackoffError),

    /// Couldn't read the interfaces directory.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Configuration for the MQTT connection of the device.
#[derive(Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub(crate) realm: String,
    pub(crate) device_id: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) keepalive: Duration,
    pub(crate) connection_timeout: Duration,
    pub(crate) poll_timeout: Duration,
    pub(crate) ack_timeout: Duration,
    pub(crate) backoff_mul: u32,
    pub(crate) backoff_cutoff: u32,
    pub(crate) max_packet_size: usize,
}

impl Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("realm", &self.realm)
            .field("device_id", &self.device_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keepalive", &self.keepalive)
            .field("connection_timeout", &self.connection_timeout)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

impl MqttConfig {
    /// Creates a configuration with the default timeouts.
    pub fn new(
        realm: impl Into<String>,
        device_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            realm: realm.into(),
            device_id: device_id.into(),
            host: host.into(),
            port,
            keepalive: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(10),
            backoff_mul: 1_000,
            backoff_cutoff: 60_000,
            max_packet_size: 64 * 1024,
        }
    }

    /// Configure the keep alive timeout.
    ///
    /// The MQTT broker will be pinged when no data exchange happened for the
    /// duration of the keep alive timeout.
    pub fn keepalive(mut self, duration: Duration) -> Self {
        self.keepalive = duration;

        self
    }

    /// Timeout for the whole connection attempt.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.connection_timeout = duration;

        self
    }

    /// How long a single [`DeviceClient::poll`] blocks on the socket.
    pub fn poll_timeout(mut self, duration: Duration) -> Self {
        self.poll_timeout = duration;

        self
    }

    /// Timeout before an unacknowledged message is retransmitted.
    pub fn ack_timeout(mut self, duration: Duration) -> Self {
        self.ack_timeout = duration;

        self
    }

    /// Multiplier and cutoff of the reconnection backoff, in milliseconds.
    pub fn backoff(mut self, mul: u32, cutoff: u32) -> Self {
        self.backoff_mul = mul;
        self.backoff_cutoff = cutoff;

        self
    }

    /// Bound for the receive buffer of the transport.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;

        self
    }

    fn validate(&self) -> Result<(), BuilderError> {
        if self.realm.is_empty() {
            return Err(BuilderError::Config("empty realm"));
        }

        if self.device_id.is_empty() {
            return Err(BuilderError::Config("empty device id"));
        }

        if self.host.is_empty() {
            return Err(BuilderError::Config("empty host"));
        }

        Ok(())
    }

    fn client_id(&self) -> ClientId {
        ClientId {
            realm: self.realm.clone(),
            device_id: self.device_id.clone(),
        }
    }

    fn session_config(&self) -> Result<SessionConfig, BuilderError> {
        Ok(SessionConfig {
            poll_timeout: self.poll_timeout,
            ack_timeout: self.ack_timeout,
            backoff: ExponentialBackoff::new(self.backoff_mul, self.backoff_cutoff)?,
        })
    }

    fn transport_config(&self) -> TcpMqttConfig {
        let mut config = TcpMqttConfig::new(
            self.host.clone(),
            self.port,
            self.client_id().to_string(),
        );
        config.keepalive = self.keepalive;
        config.connection_timeout = self.connection_timeout;
        config.max_packet_size = self.max_packet_size;

        config
    }
}

/// Builder for a [`DeviceClient`].
///
/// Collects the interfaces the device declares, the storage backend for the
/// property cache and the connection configuration.
#[derive(Debug, Clone)]
pub struct DeviceBuilder<B> {
    pub(crate) interfaces: Interfaces,
    pub(crate) store: B,
}

impl DeviceBuilder<MemoryStore> {
    /// Creates a builder with a volatile property cache.
    pub fn new() -> Self {
        Self {
            interfaces: Interfaces::new(),
            store: MemoryStore::new(),
        }
    }
}

impl Default for DeviceBuilder<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> DeviceBuilder<B> {
    /// Sets the backing storage for the property cache.
    pub fn store<T>(self, store: T) -> DeviceBuilder<T>
    where
        T: NvRecords,
    {
        DeviceBuilder {
            interfaces: self.interfaces,
            store,
        }
    }

    /// Adds a single interface.
    pub fn interface(mut self, interface: Interface) -> Result<Self, BuilderError> {
        debug!("adding interface {}", interface.interface_name());

        self.interfaces.add(interface)?;

        Ok(self)
    }

    /// Adds a single interface from the provided JSON string.
    pub fn interface_str(self, json: &str) -> Result<Self, BuilderError> {
        let interface: Interface = json.parse()?;

        self.interface(interface)
    }

    /// Adds a single interface from the provided `.json` file.
    pub fn interface_file(self, file_path: &Path) -> Result<Self, BuilderError> {
        let interface = Interface::from_file(file_path)?;

        self.interface(interface)
    }

    /// Adds all the interfaces from the `.json` files contained in the
    /// specified folder.
    pub fn interface_directory<P>(self, interfaces_directory: P) -> Result<Self, BuilderError>
    where
        P: AsRef<Path>,
    {
        walk_dir_json(interfaces_directory)?
            .iter()
            .try_fold(self, |acc, path| acc.interface_file(path))
    }

    /// Builds the device over the bundled TCP transport.
    pub fn connect_mqtt(self, config: MqttConfig) -> Result<DeviceClient<TcpMqtt, B>, BuilderError>
    where
        B: NvRecords,
    {
        config.validate()?;

        let transport = TcpMqtt::new(config.transport_config());

        self.build(transport, config)
    }

    /// Builds the device over a TCP transport with the given stream
    /// connector, the seam used to layer TLS.
    pub fn connect_mqtt_with_connector(
        self,
        config: MqttConfig,
        connector: Box<dyn Connector>,
    ) -> Result<DeviceClient<TcpMqtt, B>, BuilderError>
    where
        B: NvRecords,
    {
        config.validate()?;

        let transport = TcpMqtt::with_connector(config.transport_config(), connector);

        self.build(transport, config)
    }

    /// Builds the device over the given transport.
    pub fn build<T>(self, transport: T, config: MqttConfig) -> Result<DeviceClient<T, B>, BuilderError>
    where
        T: Mqtt,
        B: NvRecords,
    {
        config.validate()?;

        let client_id = config.client_id();
        let connection = MqttConnection::new(transport, client_id.clone(), config.session_config()?);

        Ok(DeviceClient::new(
            client_id,
            connection,
            self.interfaces,
            PropertyCache::new(self.store),
        ))
    }
}

/// Walks a directory returning an array of json files.
fn walk_dir_json<P>(path: P) -> Result<Vec<PathBuf>, io::Error>
where
    P: AsRef<Path>,
{
    std::fs::read_dir(path)?
        .map(|res| {
            res.and_then(|entry| {
                let path = entry.path();
                let metadata = entry.metadata()?;

                Ok((path, metadata))
            })
        })
        .filter_map(|res| match res {
            Ok((path, metadata)) => {
                (metadata.is_file() && path.extension() == Some(OsStr::new("json")))
                    .then_some(Ok(path))
            }
            Err(e) => Some(Err(e)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::test::DEVICE_DATASTREAM;

    use super::*;

    #[test]
    fn interface_from_directory() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("interface.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(DEVICE_DATASTREAM.as_bytes()).unwrap();

        // A non json file is skipped.
        std::fs::File::create(dir.path().join("notes.txt")).unwrap();

        let builder = DeviceBuilder::new().interface_directory(dir.path()).unwrap();

        assert_eq!(builder.interfaces.len(), 1);
    }

    #[test]
    fn duplicated_interface_fails() {
        let res = DeviceBuilder::new()
            .interface_str(DEVICE_DATASTREAM)
            .unwrap()
            .interface_str(DEVICE_DATASTREAM);

        assert!(matches!(res, Err(BuilderError::Interfaces(_))));
    }

    #[test]
    fn config_is_validated() {
        let config = MqttConfig::new("", "device", "localhost", 1883);

        let res = DeviceBuilder::new().connect_mqtt(config);

        assert!(matches!(res, Err(BuilderError::Config("empty realm"))));
    }

    #[test]
    fn config_debug_format() {
        let config = MqttConfig::new("realm", "device", "localhost", 1883)
            .keepalive(Duration::from_secs(30))
            .backoff(100, 1_000);

        let debug = format!("{config:?}");

        assert!(debug.contains("realm"));
        assert!(debug.contains("device"));
    }
}
