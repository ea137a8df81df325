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

//! Cache of the properties known to the device.
//!
//! Device owned properties are re-published during the connection handshake
//! when the broker lost the session, and are enumerated into the producer
//! properties control message. Server owned properties are cached on
//! reception and purged according to the consumer properties message.

use tracing::debug;

use crate::interface::{MappingType, Ownership};
use crate::payload;
use crate::types::AstarteType;

use super::{KvStore, NvRecords, StoreError};

/// Namespace reserved to the property cache in the underlying store.
const PROPERTIES_NAMESPACE: &str = "properties";

const OWNERSHIP_DEVICE: u8 = 0;
const OWNERSHIP_SERVER: u8 = 1;

/// A property stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProp {
    /// Interface name of the property.
    pub interface: String,
    /// Path of the property's mapping.
    pub path: String,
    /// Value of the property.
    pub value: AstarteType,
    /// Major version of the interface the property was stored with.
    ///
    /// Used to invalidate the cache when the interface version changes.
    pub interface_major: u32,
    /// Ownership of the interface the property belongs to.
    pub ownership: Ownership,
}

fn mapping_type_to_u8(mapping_type: MappingType) -> u8 {
    match mapping_type {
        MappingType::Double => 0,
        MappingType::Integer => 1,
        MappingType::Boolean => 2,
        MappingType::LongInteger => 3,
        MappingType::String => 4,
        MappingType::BinaryBlob => 5,
        MappingType::DateTime => 6,
        MappingType::DoubleArray => 7,
        MappingType::IntegerArray => 8,
        MappingType::BooleanArray => 9,
        MappingType::LongIntegerArray => 10,
        MappingType::StringArray => 11,
        MappingType::BinaryBlobArray => 12,
        MappingType::DateTimeArray => 13,
    }
}

fn mapping_type_from_u8(byte: u8) -> Result<MappingType, StoreError> {
    let mapping_type = match byte {
        0 => MappingType::Double,
        1 => MappingType::Integer,
        2 => MappingType::Boolean,
        3 => MappingType::LongInteger,
        4 => MappingType::String,
        5 => MappingType::BinaryBlob,
        6 => MappingType::DateTime,
        7 => MappingType::DoubleArray,
        8 => MappingType::IntegerArray,
        9 => MappingType::BooleanArray,
        10 => MappingType::LongIntegerArray,
        11 => MappingType::StringArray,
        12 => MappingType::BinaryBlobArray,
        13 => MappingType::DateTimeArray,
        _ => return Err(StoreError::Corrupted("unknown property type tag")),
    };

    Ok(mapping_type)
}

/// Property cache layered over the [`KvStore`].
#[derive(Debug, Clone)]
pub struct PropertyCache<B> {
    store: KvStore<B>,
}

impl<B> PropertyCache<B>
where
    B: NvRecords,
{
    /// Creates the cache over the given storage backend.
    pub fn new(backend: B) -> Self {
        Self {
            store: KvStore::new(backend),
        }
    }

    fn record_key(interface: &str, path: &str) -> String {
        format!("{interface};{path}")
    }

    /// Stores a property value.
    pub fn store_prop(
        &mut self,
        interface: &str,
        path: &str,
        value: &AstarteType,
        interface_major: u32,
        ownership: Ownership,
    ) -> Result<(), StoreError> {
        let Some(tag) = value.tag() else {
            return Err(StoreError::Corrupted("unset cannot be stored"));
        };

        let payload = payload::serialize_individual(value, None)?;

        let mut record = Vec::with_capacity(payload.len() + 6);
        record.extend_from_slice(&interface_major.to_le_bytes());
        record.push(match ownership {
            Ownership::Device => OWNERSHIP_DEVICE,
            Ownership::Server => OWNERSHIP_SERVER,
        });
        record.push(mapping_type_to_u8(tag));
        record.extend_from_slice(&payload);

        let key = Self::record_key(interface, path);

        debug!(interface, path, "storing property");

        self.store.insert(PROPERTIES_NAMESPACE, &key, &record)
    }

    fn decode_record(interface: &str, path: &str, record: &[u8]) -> Result<StoredProp, StoreError> {
        if record.len() < 6 {
            return Err(StoreError::Corrupted("property record too short"));
        }

        let (header, payload) = record.split_at(6);

        let interface_major =
            u32::from_le_bytes(header[0..4].try_into().expect("slice of 4 bytes"));

        let ownership = match header[4] {
            OWNERSHIP_DEVICE => Ownership::Device,
            OWNERSHIP_SERVER => Ownership::Server,
            _ => return Err(StoreError::Corrupted("unknown property ownership")),
        };

        let tag = mapping_type_from_u8(header[5])?;

        let (value, _) = payload::deserialize_individual(tag, payload)?;

        Ok(StoredProp {
            interface: interface.to_string(),
            path: path.to_string(),
            value,
            interface_major,
            ownership,
        })
    }

    /// Loads a property value.
    ///
    /// A cached value stored for a different major version of the interface
    /// is stale: it is deleted and [`None`] is returned.
    pub fn load_prop(
        &mut self,
        interface: &str,
        path: &str,
        interface_major: u32,
    ) -> Result<Option<AstarteType>, StoreError> {
        let key = Self::record_key(interface, path);

        let Some(record) = self.store.find(PROPERTIES_NAMESPACE, &key)? else {
            return Ok(None);
        };

        let prop = Self::decode_record(interface, path, &record)?;

        if prop.interface_major != interface_major {
            debug!(
                interface,
                path, "stored property has a different major version, deleting"
            );
            self.store.delete(PROPERTIES_NAMESPACE, &key)?;

            return Ok(None);
        }

        Ok(Some(prop.value))
    }

    /// Deletes a property from the cache.
    ///
    /// Deleting a property that is not cached is not an error.
    pub fn delete_prop(&mut self, interface: &str, path: &str) -> Result<(), StoreError> {
        let key = Self::record_key(interface, path);

        match self.store.delete(PROPERTIES_NAMESPACE, &key) {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Loads every cached property.
    pub fn load_all_props(&self) -> Result<Vec<StoredProp>, StoreError> {
        let mut props = Vec::new();

        for key in self.store.iter_keys(PROPERTIES_NAMESPACE) {
            let key = key?;

            let (interface, path) = key
                .split_once(';')
                .ok_or(StoreError::Corrupted("invalid property key"))?;

            let record = self
                .store
                .find(PROPERTIES_NAMESPACE, &key)?
                .ok_or(StoreError::Corrupted("missing property record"))?;

            props.push(Self::decode_record(interface, path, &record)?);
        }

        Ok(props)
    }

    /// Loads the device owned properties.
    pub fn device_props(&self) -> Result<Vec<StoredProp>, StoreError> {
        let mut props = self.load_all_props()?;
        props.retain(|prop| prop.ownership == Ownership::Device);

        Ok(props)
    }

    /// Loads the server owned properties.
    pub fn server_props(&self) -> Result<Vec<StoredProp>, StoreError> {
        let mut props = self.load_all_props()?;
        props.retain(|prop| prop.ownership == Ownership::Server);

        Ok(props)
    }
}
