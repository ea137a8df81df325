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

#![doc = include_str!("../README.md")]

pub mod builder;
pub mod connection;
pub mod device_id;
pub mod error;
pub mod interface;
pub mod interfaces;
#[cfg(test)]
pub(crate) mod mock;
pub mod payload;
pub mod properties;
pub mod retry;
pub mod store;
pub mod topic;
pub mod transport;
pub mod types;
pub mod validate;

use tracing::{debug, trace, warn};

use crate::connection::{MqttConnection, SessionEvent, SessionState};
use crate::interface::{Interface, Ownership};
use crate::interfaces::{Interfaces, InterfacesError};
use crate::store::{MemoryStore, NvRecords, PropertyCache, StoredProp};
use crate::topic::{ClientId, ParsedTopic};
use crate::transport::Mqtt;
use crate::types::AstarteType;
use crate::validate::ValidationError;

// Re-export chrono since timestamps use its types.
pub use chrono;

pub use crate::builder::{DeviceBuilder, MqttConfig};
pub use crate::error::Error;

/// Timestamp of a datastream value.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// An incoming individual datastream value, borrowed for the duration of the
/// callback.
#[derive(Debug, Clone, Copy)]
pub struct IndividualEvent<'a> {
    /// Interface of the event.
    pub interface: &'a str,
    /// Path the value was received on.
    pub path: &'a str,
    /// The received value.
    pub value: &'a AstarteType,
    /// Explicit timestamp of the value, when the mapping carries one.
    pub timestamp: Option<&'a Timestamp>,
}

/// An incoming object aggregate, borrowed for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct ObjectEvent<'a> {
    /// Interface of the event.
    pub interface: &'a str,
    /// Common parent path of the aggregate.
    pub path: &'a str,
    /// The received entries, in document order.
    pub entries: &'a [(String, AstarteType)],
    /// Explicit timestamp of the aggregate, when the mappings carry one.
    pub timestamp: Option<&'a Timestamp>,
}

/// A server owned property that was set.
#[derive(Debug, Clone, Copy)]
pub struct PropertyEvent<'a> {
    /// Interface of the property.
    pub interface: &'a str,
    /// Path of the property.
    pub path: &'a str,
    /// The new value.
    pub value: &'a AstarteType,
}

/// A server owned property that was unset.
#[derive(Debug, Clone, Copy)]
pub struct PropertyUnsetEvent<'a> {
    /// Interface of the property.
    pub interface: &'a str,
    /// Path of the property.
    pub path: &'a str,
}

/// User callbacks, invoked synchronously from [`DeviceClient::poll`].
#[derive(Default)]
struct Callbacks {
    connected: Option<Box<dyn FnMut(bool) + Send>>,
    disconnected: Option<Box<dyn FnMut() + Send>>,
    individual: Option<Box<dyn FnMut(IndividualEvent<'_>) + Send>>,
    object: Option<Box<dyn FnMut(ObjectEvent<'_>) + Send>>,
    property_set: Option<Box<dyn FnMut(PropertyEvent<'_>) + Send>>,
    property_unset: Option<Box<dyn FnMut(PropertyUnsetEvent<'_>) + Send>>,
}

/// Astarte device client.
///
/// Owns the introspection, the property cache and the MQTT session, and
/// exposes the publish operations. The client is driven cooperatively: the
/// caller is expected to invoke [`poll`](DeviceClient::poll) from its event
/// loop, and callbacks run synchronously inside it with borrowed values.
/// Callbacks must not call back into `poll`.
pub struct DeviceClient<T, B = MemoryStore> {
    client_id: ClientId,
    connection: MqttConnection<T>,
    interfaces: Interfaces,
    store: PropertyCache<B>,
    callbacks: Callbacks,
    was_connected: bool,
}

impl<T, B> DeviceClient<T, B>
where
    T: Mqtt,
    B: NvRecords,
{
    pub(crate) fn new(
        client_id: ClientId,
        connection: MqttConnection<T>,
        interfaces: Interfaces,
        store: PropertyCache<B>,
    ) -> Self {
        Self {
            client_id,
            connection,
            interfaces,
            store,
            callbacks: Callbacks::default(),
            was_connected: false,
        }
    }

    /// Returns the interfaces the device declares.
    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    /// Registers a callback for the connection being established.
    ///
    /// The argument is the session present flag of the CONNACK.
    pub fn on_connected(&mut self, callback: impl FnMut(bool) + Send + 'static) {
        self.callbacks.connected = Some(Box::new(callback));
    }

    /// Registers a callback for the connection being lost or closed.
    pub fn on_disconnected(&mut self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.disconnected = Some(Box::new(callback));
    }

    /// Registers a callback for incoming individual datastream values.
    pub fn on_individual_datastream(
        &mut self,
        callback: impl FnMut(IndividualEvent<'_>) + Send + 'static,
    ) {
        self.callbacks.individual = Some(Box::new(callback));
    }

    /// Registers a callback for incoming object aggregates.
    pub fn on_object_datastream(
        &mut self,
        callback: impl FnMut(ObjectEvent<'_>) + Send + 'static,
    ) {
        self.callbacks.object = Some(Box::new(callback));
    }

    /// Registers a callback for server owned properties being set.
    pub fn on_property_set(
        &mut self,
        callback: impl FnMut(PropertyEvent<'_>) + Send + 'static,
    ) {
        self.callbacks.property_set = Some(Box::new(callback));
    }

    /// Registers a callback for server owned properties being unset.
    pub fn on_property_unset(
        &mut self,
        callback: impl FnMut(PropertyUnsetEvent<'_>) + Send + 'static,
    ) {
        self.callbacks.property_unset = Some(Box::new(callback));
    }

    fn check_disconnected(&self) -> Result<(), Error> {
        if self.connection.state() != SessionState::Disconnected {
            return Err(Error::InterfacesLocked);
        }

        Ok(())
    }

    /// Adds an interface to the device introspection.
    ///
    /// Only allowed while disconnected, since the introspection is published
    /// during the connection handshake.
    pub fn add_interface(&mut self, interface: Interface) -> Result<(), Error> {
        self.check_disconnected()?;

        self.interfaces.add(interface).map_err(Error::from)
    }

    /// Replaces an interface with a newer version, or adds it when missing.
    pub fn update_interface(&mut self, interface: Interface) -> Result<(), Error> {
        self.check_disconnected()?;

        self.interfaces.update(interface).map_err(Error::from)
    }

    /// Removes the interface with the given name from the introspection.
    pub fn remove_interface(&mut self, interface_name: &str) -> Result<(), Error> {
        self.check_disconnected()?;

        self.interfaces
            .remove(interface_name)
            .ok_or_else(|| {
                Error::Interfaces(InterfacesError::NotFound {
                    name: interface_name.to_string(),
                })
            })
            .map(drop)
    }

    fn resolve_interface(&self, interface_name: &str) -> Result<&Interface, Error> {
        self.interfaces.get(interface_name).ok_or_else(|| {
            Error::Interfaces(InterfacesError::NotFound {
                name: interface_name.to_string(),
            })
        })
    }

    fn data_topic(&self, interface_name: &str, path: &str) -> String {
        format!("{}/{interface_name}{path}", self.client_id)
    }

    /// Builds the data the session publishes during the handshake.
    fn handshake_data(&self) -> Result<connection::HandshakeData, Error> {
        let introspection = self.interfaces.get_introspection_string();

        let server_interfaces = self
            .interfaces
            .iter()
            .filter(|interface| interface.ownership() == Ownership::Server)
            .map(|interface| interface.interface_name().to_string())
            .collect();

        // Only the cached properties that still match the introspection are
        // advertised and re-published.
        let device_props: Vec<StoredProp> = self
            .store
            .device_props()?
            .into_iter()
            .filter(|prop| {
                self.interfaces
                    .get_property(&prop.interface)
                    .is_some_and(|interface| {
                        interface.ownership() == Ownership::Device
                            && interface.version_major() == prop.interface_major
                    })
            })
            .collect();

        let paths: Vec<String> = device_props
            .iter()
            .map(|prop| format!("{}{}", prop.interface, prop.path))
            .collect();
        let producer_properties = properties::serialize_props(&paths)?;

        let device_properties = device_props
            .iter()
            .map(|prop| {
                let topic = self.data_topic(&prop.interface, &prop.path);
                let payload = payload::serialize_individual(&prop.value, None)?;

                Ok((topic, payload))
            })
            .collect::<Result<Vec<(String, Vec<u8>)>, Error>>()?;

        Ok(connection::HandshakeData {
            introspection,
            server_interfaces,
            producer_properties,
            device_properties,
        })
    }

    /// Opens the connection to the broker.
    ///
    /// The connection is established by the following
    /// [`poll`](DeviceClient::poll) calls; the registered connected callback
    /// signals when the session is up.
    pub async fn connect(&mut self) -> Result<(), Error> {
        let handshake = self.handshake_data()?;

        self.connection.connect(handshake).await.map_err(Error::from)
    }

    /// Closes the connection.
    ///
    /// Idempotent. In flight messages are dropped and are not resent on the
    /// next connection.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        let was_up = self.connection.state() != SessionState::Disconnected;

        self.connection.disconnect().await;
        self.was_connected = false;

        if was_up {
            if let Some(callback) = &mut self.callbacks.disconnected {
                callback();
            }
        }

        Ok(())
    }

    /// Advances the device, blocking for at most the configured poll timeout.
    ///
    /// Services the session machine (acks, retransmissions, keepalive,
    /// reconnection) and dispatches the registered callbacks for the received
    /// data. Returning without an event is normal: callers treat it as a
    /// wakeup and poll again.
    pub async fn poll(&mut self) -> Result<(), Error> {
        let polled = self.connection.poll().await;

        // An error or a failed handshake leaves the connected state without
        // passing through an explicit disconnect.
        if self.was_connected && !self.connection.is_connected() {
            self.was_connected = false;

            if let Some(callback) = &mut self.callbacks.disconnected {
                callback();
            }
        }

        match polled? {
            None => Ok(()),
            Some(SessionEvent::Connected { session_present }) => {
                debug!(session_present, "device connected");

                self.was_connected = true;

                if let Some(callback) = &mut self.callbacks.connected {
                    callback(session_present);
                }

                Ok(())
            }
            Some(SessionEvent::Publish { topic, payload }) => {
                self.handle_publish(&topic, &payload)
            }
        }
    }

    /// Dispatches a received publish to the user callbacks.
    fn handle_publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        trace!(%topic, len = payload.len(), "handling incoming publish");

        match ParsedTopic::try_parse(self.client_id.as_ref(), topic)? {
            ParsedTopic::ConsumerProperties => self.purge_properties(payload),
            ParsedTopic::Data { interface, path } => self.handle_data(interface, path, payload),
        }
    }

    /// Drops the cached properties the broker doesn't know about.
    fn purge_properties(&mut self, payload: &[u8]) -> Result<(), Error> {
        debug!("purging properties");

        let paths = properties::extract_set_properties(payload)?;

        for prop in self.store.load_all_props()? {
            if paths.contains(&format!("{}{}", prop.interface, prop.path)) {
                continue;
            }

            self.store.delete_prop(&prop.interface, &prop.path)?;
        }

        Ok(())
    }

    fn handle_data(
        &mut self,
        interface_name: &str,
        path: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        let Some(interface) = self.interfaces.get(interface_name) else {
            warn!(interface = interface_name, "publish on unknown interface");

            return Err(Error::Interfaces(InterfacesError::NotFound {
                name: interface_name.to_string(),
            }));
        };

        if interface.ownership() == Ownership::Device {
            warn!(
                interface = interface_name,
                "ignoring publish on a device owned interface"
            );

            return Ok(());
        }

        if interface.is_property() {
            return self.handle_property(interface_name, path, payload);
        }

        if interface.is_object() {
            let (entries, timestamp) = payload::deserialize_object(interface, path, payload)?;

            if let Some(callback) = &mut self.callbacks.object {
                callback(ObjectEvent {
                    interface: interface_name,
                    path,
                    entries: &entries,
                    timestamp: timestamp.as_ref(),
                });
            }

            return Ok(());
        }

        let mapping = interface
            .mapping(path)
            .ok_or_else(|| ValidationError::MappingNotFound {
                path: path.to_string(),
                interface: interface_name.to_string(),
            })?;

        let (value, timestamp) = payload::deserialize_individual(mapping.mapping_type(), payload)?;

        if let Some(callback) = &mut self.callbacks.individual {
            callback(IndividualEvent {
                interface: interface_name,
                path,
                value: &value,
                timestamp: timestamp.as_ref(),
            });
        }

        Ok(())
    }

    fn handle_property(
        &mut self,
        interface_name: &str,
        path: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        let interface = self.resolve_interface(interface_name)?;
        let version_major = interface.version_major();

        let mapping = interface
            .mapping(path)
            .ok_or_else(|| ValidationError::MappingNotFound {
                path: path.to_string(),
                interface: interface_name.to_string(),
            })?;

        // The zero length payload unsets the property.
        if payload.is_empty() {
            if !mapping.allow_unset() {
                warn!(
                    interface = interface_name,
                    path, "unset received on a mapping without allow_unset"
                );
            }

            self.store.delete_prop(interface_name, path)?;

            if let Some(callback) = &mut self.callbacks.property_unset {
                callback(PropertyUnsetEvent {
                    interface: interface_name,
                    path,
                });
            }

            return Ok(());
        }

        let (value, _) = payload::deserialize_individual(mapping.mapping_type(), payload)?;

        self.store
            .store_prop(interface_name, path, &value, version_major, Ownership::Server)?;

        if let Some(callback) = &mut self.callbacks.property_set {
            callback(PropertyEvent {
                interface: interface_name,
                path,
                value: &value,
            });
        }

        Ok(())
    }

    /// Sends an individual datastream value.
    ///
    /// The value is validated against the interface, encoded and published
    /// with the QoS of the mapping's reliability.
    pub async fn send_individual<D>(
        &mut self,
        interface_name: &str,
        path: &str,
        data: D,
        timestamp: Option<Timestamp>,
    ) -> Result<(), Error>
    where
        D: Into<AstarteType> + Send,
    {
        let value = data.into();

        debug!(interface = interface_name, path, "sending individual value");

        let interface = self.resolve_interface(interface_name)?;

        validate::individual_datastream(interface, path, &value, timestamp.as_ref())?;

        let mapping = interface
            .mapping(path)
            .ok_or_else(|| ValidationError::MappingNotFound {
                path: path.to_string(),
                interface: interface_name.to_string(),
            })?;
        let qos = mapping.reliability().into();

        let buf = payload::serialize_individual(&value, timestamp.as_ref())?;
        let topic = self.data_topic(interface_name, path);

        self.connection.publish(topic, buf, qos).await.map_err(Error::from)
    }

    /// Sends an object aggregate on the common parent path.
    ///
    /// Entries are `(endpoint, value)` pairs, with the endpoint relative to
    /// the parent path.
    pub async fn send_object(
        &mut self,
        interface_name: &str,
        path: &str,
        entries: &[(String, AstarteType)],
        timestamp: Option<Timestamp>,
    ) -> Result<(), Error> {
        debug!(interface = interface_name, path, "sending object aggregate");

        let interface = self.resolve_interface(interface_name)?;

        validate::aggregated_datastream(interface, path, entries, timestamp.as_ref())?;

        let qos = interface.object_reliability().into();

        let buf = payload::serialize_object(entries, timestamp.as_ref())?;
        let topic = self.data_topic(interface_name, path);

        self.connection.publish(topic, buf, qos).await.map_err(Error::from)
    }

    /// Sets a device owned property.
    ///
    /// The property is cached after a successful publish, and sending the
    /// same value again is a no-op.
    pub async fn set_property<D>(
        &mut self,
        interface_name: &str,
        path: &str,
        data: D,
    ) -> Result<(), Error>
    where
        D: Into<AstarteType> + Send,
    {
        let value = data.into();

        debug!(interface = interface_name, path, "setting property");

        let interface = self.resolve_interface(interface_name)?;

        validate::set_property(interface, path, &value)?;

        let mapping = interface
            .mapping(path)
            .ok_or_else(|| ValidationError::MappingNotFound {
                path: path.to_string(),
                interface: interface_name.to_string(),
            })?;
        let qos = mapping.reliability().into();
        let version_major = interface.version_major();

        if let Some(stored) = self.store.load_prop(interface_name, path, version_major)? {
            if stored == value {
                debug!("property already set to the same value");

                return Ok(());
            }
        }

        let buf = payload::serialize_individual(&value, None)?;
        let topic = self.data_topic(interface_name, path);

        self.connection.publish(topic, buf, qos).await?;

        // Cache only after the publish was handed to the session.
        self.store
            .store_prop(interface_name, path, &value, version_major, Ownership::Device)?;

        Ok(())
    }

    /// Unsets a device owned property.
    ///
    /// Publishes the zero length payload on the property topic and drops the
    /// cached value.
    pub async fn unset_property(
        &mut self,
        interface_name: &str,
        path: &str,
    ) -> Result<(), Error> {
        debug!(interface = interface_name, path, "unsetting property");

        let interface = self.resolve_interface(interface_name)?;

        validate::unset_property(interface, path)?;

        let mapping = interface
            .mapping(path)
            .ok_or_else(|| ValidationError::MappingNotFound {
                path: path.to_string(),
                interface: interface_name.to_string(),
            })?;
        let qos = mapping.reliability().into();

        let buf = payload::serialize_individual(&AstarteType::Unset, None)?;
        let topic = self.data_topic(interface_name, path);

        self.connection.publish(topic, buf, qos).await?;

        self.store.delete_prop(interface_name, path)?;

        Ok(())
    }

    /// Returns a property from the cache.
    pub fn get_property(
        &mut self,
        interface_name: &str,
        path: &str,
    ) -> Result<Option<AstarteType>, Error> {
        let Some(interface) = self.interfaces.get(interface_name) else {
            return Ok(None);
        };

        let version_major = interface.version_major();

        self.store
            .load_prop(interface_name, path, version_major)
            .map_err(Error::from)
    }
}

impl<T, B> std::fmt::Debug for DeviceClient<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("client_id", &self.client_id)
            .field("interfaces", &self.interfaces)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::{Arc, Mutex as StdMutex};

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use crate::interface::Reliability;
    use crate::mock::{Action, FakeTransport};
    use crate::test::*;
    use crate::transport::{IncomingPublish, TransportEvent};

    use super::*;

    fn device(
        interfaces: &[&str],
        script: Vec<Result<Option<TransportEvent>, crate::transport::TransportError>>,
    ) -> (
        DeviceClient<FakeTransport>,
        Arc<StdMutex<Vec<Action>>>,
    ) {
        let (transport, actions) = FakeTransport::new(script);

        let config = MqttConfig::new("realm", "device_id", "localhost", 1883);

        let mut builder = DeviceBuilder::new();
        for json in interfaces {
            builder = builder.interface_str(json).unwrap();
        }

        (builder.build(transport, config).unwrap(), actions)
    }

    fn connack(session_present: bool) -> Result<Option<TransportEvent>, crate::transport::TransportError> {
        Ok(Some(TransportEvent::ConnAck { session_present }))
    }

    fn incoming(
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<Option<TransportEvent>, crate::transport::TransportError> {
        Ok(Some(TransportEvent::Publish(IncomingPublish {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: mqttbytes::QoS::AtMostOnce,
            pkid: 0,
        })))
    }

    #[tokio::test]
    async fn send_individual_publishes_on_the_data_topic() {
        let (mut device, actions) = device(&[DEVICE_DATASTREAM], vec![connack(true)]);

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        let timestamp = chrono::Utc.timestamp_opt(1537449422, 0).unwrap();
        device
            .send_individual(
                "org.astarte-platform.test.DeviceDatastream",
                "/uptime",
                37_i64,
                Some(timestamp),
            )
            .await
            .unwrap();

        let actions = actions.lock().unwrap();
        let Action::Publish { topic, payload, qos, .. } = &actions[1] else {
            panic!("expected a publish, got {:?}", actions[1]);
        };

        assert_eq!(
            topic,
            "realm/device_id/org.astarte-platform.test.DeviceDatastream/uptime"
        );
        assert_eq!(*qos, mqttbytes::QoS::AtLeastOnce);

        let (value, received) =
            payload::deserialize_individual(crate::interface::MappingType::LongInteger, payload)
                .unwrap();
        assert_eq!(value, AstarteType::LongInteger(37));
        assert_eq!(received, Some(timestamp));
    }

    #[tokio::test]
    async fn send_on_unknown_interface_fails() {
        let (mut device, _actions) = device(&[], vec![connack(true)]);

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        let err = device
            .send_individual("com.missing.Interface", "/path", 1_i32, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Interfaces(InterfacesError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn send_invalid_value_doesnt_touch_the_session() {
        let (mut device, actions) = device(&[DEVICE_DATASTREAM], vec![connack(true)]);

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        let err = device
            .send_individual(
                "org.astarte-platform.test.DeviceDatastream",
                "/uptime",
                true,
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));

        // Only the connect reached the transport.
        assert_eq!(actions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_object_uses_the_shared_reliability() {
        let (mut device, actions) = device(&[OBJECT_DATASTREAM], vec![connack(true)]);

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        let entries = vec![
            ("latitude".to_string(), AstarteType::Double(45.0)),
            ("longitude".to_string(), AstarteType::Double(7.6)),
        ];

        device
            .send_object(
                "org.astarte-platform.test.ObjectDatastream",
                "/gps",
                &entries,
                None,
            )
            .await
            .unwrap();

        let actions = actions.lock().unwrap();
        let Action::Publish { topic, qos, .. } = &actions[1] else {
            panic!("expected a publish, got {:?}", actions[1]);
        };

        assert_eq!(
            topic,
            "realm/device_id/org.astarte-platform.test.ObjectDatastream/gps"
        );
        assert_eq!(
            *qos,
            mqttbytes::QoS::from(Reliability::Guaranteed)
        );
    }

    #[tokio::test]
    async fn set_property_caches_and_skips_duplicates() {
        let (mut device, actions) = device(&[DEVICE_PROPERTIES], vec![connack(true)]);

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        device
            .set_property(
                "org.astarte-platform.test.DeviceProperties",
                "/1/name",
                "some name",
            )
            .await
            .unwrap();

        let value = device
            .get_property("org.astarte-platform.test.DeviceProperties", "/1/name")
            .unwrap();
        assert_eq!(value, Some(AstarteType::String("some name".to_string())));

        // Same value again, no publish.
        device
            .set_property(
                "org.astarte-platform.test.DeviceProperties",
                "/1/name",
                "some name",
            )
            .await
            .unwrap();

        let publishes = actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| matches!(a, Action::Publish { .. }))
            .count();
        assert_eq!(publishes, 1);
    }

    #[tokio::test]
    async fn unset_property_clears_the_cache() {
        let (mut device, actions) = device(&[DEVICE_PROPERTIES], vec![connack(true)]);

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        device
            .set_property(
                "org.astarte-platform.test.DeviceProperties",
                "/1/name",
                "some name",
            )
            .await
            .unwrap();

        device
            .unset_property("org.astarte-platform.test.DeviceProperties", "/1/name")
            .await
            .unwrap();

        let value = device
            .get_property("org.astarte-platform.test.DeviceProperties", "/1/name")
            .unwrap();
        assert_eq!(value, None);

        // The unset is the zero length payload.
        let actions = actions.lock().unwrap();
        let Action::Publish { payload, .. } = actions.last().unwrap() else {
            panic!("expected a publish");
        };
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn incoming_individual_dispatches_the_callback() {
        let payload = payload::serialize_individual(&AstarteType::Boolean(true), None).unwrap();

        let (mut device, _actions) = device(
            &[SERVER_DATASTREAM],
            vec![
                connack(true),
                incoming(
                    "realm/device_id/org.astarte-platform.test.ServerDatastream/enabled",
                    payload,
                ),
            ],
        );

        let received = Arc::new(StdMutex::new(Vec::new()));
        let events = Arc::clone(&received);
        device.on_individual_datastream(move |event| {
            events.lock().unwrap().push((
                event.interface.to_string(),
                event.path.to_string(),
                event.value.clone(),
            ));
        });

        device.connect().await.unwrap();
        device.poll().await.unwrap();
        device.poll().await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(
            received.as_slice(),
            [(
                "org.astarte-platform.test.ServerDatastream".to_string(),
                "/enabled".to_string(),
                AstarteType::Boolean(true)
            )]
        );
    }

    #[tokio::test]
    async fn incoming_object_dispatches_the_callback() {
        let entries = vec![
            ("latitude".to_string(), AstarteType::Double(45.0)),
            ("longitude".to_string(), AstarteType::Double(7.6)),
        ];
        let payload = payload::serialize_object(&entries, None).unwrap();

        let (mut device, _actions) = device(
            &[SERVER_OBJECT_DATASTREAM],
            vec![
                connack(true),
                incoming(
                    "realm/device_id/org.astarte-platform.test.ServerObject/gps",
                    payload,
                ),
            ],
        );

        let received = Arc::new(StdMutex::new(Vec::new()));
        let events = Arc::clone(&received);
        device.on_object_datastream(move |event| {
            events
                .lock()
                .unwrap()
                .push((event.path.to_string(), event.entries.to_vec()));
        });

        device.connect().await.unwrap();
        device.poll().await.unwrap();
        device.poll().await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.as_slice(), [("/gps".to_string(), entries)]);
    }

    #[tokio::test]
    async fn incoming_property_set_and_unset() {
        let payload =
            payload::serialize_individual(&AstarteType::String("on".to_string()), None).unwrap();

        let (mut device, _actions) = device(
            &[SERVER_PROPERTIES],
            vec![
                connack(true),
                incoming(
                    "realm/device_id/org.astarte-platform.test.ServerProperties/1/name",
                    payload,
                ),
                incoming(
                    "realm/device_id/org.astarte-platform.test.ServerProperties/1/name",
                    Vec::new(),
                ),
            ],
        );

        let log = Arc::new(StdMutex::new(Vec::new()));

        let set_log = Arc::clone(&log);
        device.on_property_set(move |event| {
            set_log
                .lock()
                .unwrap()
                .push(format!("set {} {:?}", event.path, event.value));
        });

        let unset_log = Arc::clone(&log);
        device.on_property_unset(move |event| {
            unset_log.lock().unwrap().push(format!("unset {}", event.path));
        });

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        device.poll().await.unwrap();
        let value = device
            .get_property("org.astarte-platform.test.ServerProperties", "/1/name")
            .unwrap();
        assert_eq!(value, Some(AstarteType::String("on".to_string())));

        device.poll().await.unwrap();
        let value = device
            .get_property("org.astarte-platform.test.ServerProperties", "/1/name")
            .unwrap();
        assert_eq!(value, None);

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            [
                "set /1/name String(\"on\")".to_string(),
                "unset /1/name".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn purge_properties_prunes_the_cache() {
        let (mut device, _actions) = device(
            &[DEVICE_PROPERTIES],
            vec![connack(true)],
        );

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        device
            .set_property(
                "org.astarte-platform.test.DeviceProperties",
                "/1/name",
                "keep",
            )
            .await
            .unwrap();
        device
            .set_property(
                "org.astarte-platform.test.DeviceProperties",
                "/2/name",
                "drop",
            )
            .await
            .unwrap();

        // The broker only knows about /1/name.
        let listed =
            ["org.astarte-platform.test.DeviceProperties/1/name".to_string()];
        let payload = properties::serialize_props(&listed).unwrap();

        device
            .handle_publish("realm/device_id/control/consumer/properties", &payload)
            .unwrap();

        assert_eq!(
            device
                .get_property("org.astarte-platform.test.DeviceProperties", "/1/name")
                .unwrap(),
            Some(AstarteType::String("keep".to_string()))
        );
        assert_eq!(
            device
                .get_property("org.astarte-platform.test.DeviceProperties", "/2/name")
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn handshake_republishes_device_properties() {
        let (mut device, actions) = device(
            &[DEVICE_PROPERTIES],
            vec![
                connack(false),
                Ok(Some(TransportEvent::SubAck {
                    pkid: 1,
                    failure: false,
                })),
            ],
        );

        device
            .store
            .store_prop(
                "org.astarte-platform.test.DeviceProperties",
                "/1/name",
                &AstarteType::String("cached".to_string()),
                0,
                Ownership::Device,
            )
            .unwrap();

        let connected = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&connected);
        device.on_connected(move |session_present| {
            log.lock().unwrap().push(session_present);
        });

        device.connect().await.unwrap();

        // Connack, handshake tick and the suback completing it.
        device.poll().await.unwrap();
        device.poll().await.unwrap();
        device.poll().await.unwrap();

        assert_eq!(connected.lock().unwrap().as_slice(), [false]);

        let actions = actions.lock().unwrap();
        let property_publish = actions.iter().any(|action| {
            matches!(
                action,
                Action::Publish { topic, .. }
                    if topic == "realm/device_id/org.astarte-platform.test.DeviceProperties/1/name"
            )
        });

        assert!(property_publish, "property republish missing: {actions:?}");
    }

    #[tokio::test]
    async fn interfaces_are_locked_while_connected() {
        let (mut device, _actions) = device(&[], vec![connack(true)]);

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        let err = device
            .add_interface(Interface::from_str(DEVICE_DATASTREAM).unwrap())
            .unwrap_err();

        assert!(matches!(err, Error::InterfacesLocked));

        device.disconnect().await.unwrap();

        device
            .add_interface(Interface::from_str(DEVICE_DATASTREAM).unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_fires_the_callback() {
        let (mut device, _actions) = device(&[], vec![connack(true)]);

        let disconnections = Arc::new(StdMutex::new(0));
        let count = Arc::clone(&disconnections);
        device.on_disconnected(move || {
            *count.lock().unwrap() += 1;
        });

        device.connect().await.unwrap();
        device.poll().await.unwrap();

        device.disconnect().await.unwrap();
        device.disconnect().await.unwrap();

        assert_eq!(*disconnections.lock().unwrap(), 1);
    }
}
