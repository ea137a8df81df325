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

//! Interface definitions for the data exchanged with Astarte.
//!
//! An interface is a versioned, named schema bundling a set of typed
//! [`Mapping`]s. Interfaces are usually defined in JSON and loaded with
//! [`Interface::from_str`] or [`Interface::from_file`].

use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use self::endpoint::Endpoint;
use self::error::InterfaceError;

pub mod endpoint;
pub mod error;

/// Maximum length of an interface name, in bytes.
pub const MAX_INTERFACE_NAME_LEN: usize = 127;

/// Ownership of an interface.
///
/// The owner of an interface is the only side that can publish on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    /// The device sends data on the interface.
    Device,
    /// The server sends data on the interface.
    Server,
}

/// Type of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceTypeDef {
    /// A stream of timestamped values.
    Datastream,
    /// Persistent, settable and unsettable values.
    Properties,
}

/// Aggregation of the mappings of an interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Every mapping is sent on its own path.
    #[default]
    Individual,
    /// All the mappings are sent together on the common parent path.
    Object,
}

/// Delivery guarantee of a datastream mapping, mapped onto the MQTT QoS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    /// QoS 0, fire and forget.
    #[default]
    Unreliable,
    /// QoS 1, delivered at least once.
    Guaranteed,
    /// QoS 2, delivered exactly once.
    Unique,
}

impl From<Reliability> for mqttbytes::QoS {
    fn from(value: Reliability) -> Self {
        match value {
            Reliability::Unreliable => mqttbytes::QoS::AtMostOnce,
            Reliability::Guaranteed => mqttbytes::QoS::AtLeastOnce,
            Reliability::Unique => mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// Type of a mapping, seven scalars and their array counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingType {
    /// A double value.
    Double,
    /// A 32 bit signed integer.
    Integer,
    /// A boolean.
    Boolean,
    /// A 64 bit signed integer.
    LongInteger,
    /// An UTF-8 string.
    String,
    /// An arbitrary sequence of bytes.
    BinaryBlob,
    /// A timestamp with millisecond precision.
    DateTime,
    /// An array of doubles.
    DoubleArray,
    /// An array of 32 bit signed integers.
    IntegerArray,
    /// An array of booleans.
    BooleanArray,
    /// An array of 64 bit signed integers.
    LongIntegerArray,
    /// An array of strings.
    StringArray,
    /// An array of byte sequences.
    BinaryBlobArray,
    /// An array of timestamps.
    DateTimeArray,
}

impl MappingType {
    /// Whether the type is one of the array variants.
    pub fn is_array(self) -> bool {
        self.as_scalar() != self
    }

    /// Element type of an array, or the type itself for scalars.
    pub fn as_scalar(self) -> MappingType {
        match self {
            MappingType::DoubleArray => MappingType::Double,
            MappingType::IntegerArray => MappingType::Integer,
            MappingType::BooleanArray => MappingType::Boolean,
            MappingType::LongIntegerArray => MappingType::LongInteger,
            MappingType::StringArray => MappingType::String,
            MappingType::BinaryBlobArray => MappingType::BinaryBlob,
            MappingType::DateTimeArray => MappingType::DateTime,
            scalar => scalar,
        }
    }
}

impl Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MappingType::Double => "double",
            MappingType::Integer => "integer",
            MappingType::Boolean => "boolean",
            MappingType::LongInteger => "longinteger",
            MappingType::String => "string",
            MappingType::BinaryBlob => "binaryblob",
            MappingType::DateTime => "datetime",
            MappingType::DoubleArray => "doublearray",
            MappingType::IntegerArray => "integerarray",
            MappingType::BooleanArray => "booleanarray",
            MappingType::LongIntegerArray => "longintegerarray",
            MappingType::StringArray => "stringarray",
            MappingType::BinaryBlobArray => "binaryblobarray",
            MappingType::DateTimeArray => "datetimearray",
        };

        write!(f, "{name}")
    }
}

/// A typed endpoint inside an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    endpoint: Endpoint,
    mapping_type: MappingType,
    reliability: Reliability,
    explicit_timestamp: bool,
    allow_unset: bool,
}

impl Mapping {
    /// Endpoint template of the mapping.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Type the published values must conform to.
    pub fn mapping_type(&self) -> MappingType {
        self.mapping_type
    }

    /// Delivery guarantee for the mapping.
    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    /// Whether the timestamp is provided by the caller instead of the broker.
    pub fn explicit_timestamp(&self) -> bool {
        self.explicit_timestamp
    }

    /// Whether a property on this mapping can be unset.
    pub fn allow_unset(&self) -> bool {
        self.allow_unset
    }
}

/// A versioned schema for the data exchanged with Astarte.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    interface_name: String,
    version_major: u32,
    version_minor: u32,
    interface_type: InterfaceTypeDef,
    ownership: Ownership,
    aggregation: Aggregation,
    mappings: Vec<Mapping>,
}

impl Interface {
    /// Load an interface definition from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, InterfaceError> {
        let content = std::fs::read_to_string(path)?;

        Self::from_str(&content)
    }

    /// Name of the interface.
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    /// Major version of the interface.
    pub fn version_major(&self) -> u32 {
        self.version_major
    }

    /// Minor version of the interface.
    pub fn version_minor(&self) -> u32 {
        self.version_minor
    }

    /// Type of the interface.
    pub fn interface_type(&self) -> InterfaceTypeDef {
        self.interface_type
    }

    /// Ownership of the interface.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Aggregation of the interface mappings.
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Whether the interface is a properties interface.
    pub fn is_property(&self) -> bool {
        self.interface_type == InterfaceTypeDef::Properties
    }

    /// Whether the interface aggregates its mappings in an object.
    pub fn is_object(&self) -> bool {
        self.aggregation == Aggregation::Object
    }

    /// Iterates over the mappings of the interface.
    pub fn iter_mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    /// Resolves a concrete path to the mapping it belongs to.
    pub fn mapping(&self, path: &str) -> Option<&Mapping> {
        self.mappings
            .iter()
            .find(|mapping| mapping.endpoint.matches(path))
    }

    /// Resolves a mapping from the common object path and the entry key.
    ///
    /// The two parts are joined with a `/` separator before matching.
    pub(crate) fn mapping_from_paths(&self, prefix: &str, suffix: &str) -> Option<&Mapping> {
        let path = format!("{prefix}/{suffix}");

        self.mapping(&path)
    }

    /// Reliability shared by every mapping of an object interface.
    pub(crate) fn object_reliability(&self) -> Reliability {
        debug_assert!(self.is_object());

        self.mappings
            .first()
            .map(|mapping| mapping.reliability)
            .unwrap_or_default()
    }

    /// Explicit timestamp flag shared by every mapping of an object interface.
    pub(crate) fn object_explicit_timestamp(&self) -> bool {
        debug_assert!(self.is_object());

        self.mappings
            .first()
            .map(|mapping| mapping.explicit_timestamp)
            .unwrap_or_default()
    }
}

impl Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.interface_name, self.version_major, self.version_minor
        )
    }
}

impl FromStr for Interface {
    type Err = InterfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let def: InterfaceDef = serde_json::from_str(s)?;

        Interface::try_from(def)
    }
}

/// Raw interface definition as found in the JSON description.
#[derive(Debug, Clone, Deserialize)]
struct InterfaceDef {
    interface_name: String,
    version_major: u32,
    version_minor: u32,
    #[serde(rename = "type")]
    interface_type: InterfaceTypeDef,
    ownership: Ownership,
    #[serde(default)]
    aggregation: Aggregation,
    mappings: Vec<MappingDef>,
}

/// Raw mapping definition as found in the JSON description.
#[derive(Debug, Clone, Deserialize)]
struct MappingDef {
    endpoint: String,
    #[serde(rename = "type")]
    mapping_type: MappingType,
    #[serde(default)]
    reliability: Reliability,
    #[serde(default)]
    explicit_timestamp: bool,
    #[serde(default)]
    allow_unset: bool,
}

impl TryFrom<InterfaceDef> for Interface {
    type Error = InterfaceError;

    fn try_from(def: InterfaceDef) -> Result<Self, Self::Error> {
        if def.interface_name.is_empty() || def.interface_name.len() > MAX_INTERFACE_NAME_LEN {
            return Err(InterfaceError::InvalidName {
                name: def.interface_name,
            });
        }

        if def.version_major == 0 && def.version_minor == 0 {
            return Err(InterfaceError::MajorMinor);
        }

        if def.mappings.is_empty() {
            return Err(InterfaceError::EmptyMappings);
        }

        if def.interface_type == InterfaceTypeDef::Properties
            && def.aggregation == Aggregation::Object
        {
            return Err(InterfaceError::ObjectProperties);
        }

        let mappings = def
            .mappings
            .into_iter()
            .map(|mapping| {
                Ok(Mapping {
                    endpoint: mapping.endpoint.parse()?,
                    mapping_type: mapping.mapping_type,
                    reliability: mapping.reliability,
                    explicit_timestamp: mapping.explicit_timestamp,
                    allow_unset: mapping.allow_unset,
                })
            })
            .collect::<Result<Vec<Mapping>, InterfaceError>>()?;

        check_unique_mappings(&mappings)?;

        if def.aggregation == Aggregation::Object {
            check_object_mappings(&mappings)?;
        }

        Ok(Interface {
            interface_name: def.interface_name,
            version_major: def.version_major,
            version_minor: def.version_minor,
            interface_type: def.interface_type,
            ownership: def.ownership,
            aggregation: def.aggregation,
            mappings,
        })
    }
}

/// Rejects interfaces where a path could resolve to more than one mapping.
fn check_unique_mappings(mappings: &[Mapping]) -> Result<(), InterfaceError> {
    for (i, mapping) in mappings.iter().enumerate() {
        for other in &mappings[i + 1..] {
            if endpoints_overlap(&mapping.endpoint, &other.endpoint) {
                return Err(InterfaceError::DuplicateMapping {
                    endpoint: mapping.endpoint.to_string(),
                    duplicate: other.endpoint.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Two endpoints overlap when some concrete path matches both.
fn endpoints_overlap(first: &Endpoint, second: &Endpoint) -> bool {
    use self::endpoint::Level;

    first.len() == second.len()
        && first
            .levels()
            .zip(second.levels())
            .all(|(a, b)| match (a, b) {
                (Level::Literal(a), Level::Literal(b)) => a == b,
                _ => true,
            })
}

fn check_object_mappings(mappings: &[Mapping]) -> Result<(), InterfaceError> {
    // Validated non-empty by the caller.
    let first = &mappings[0];

    for mapping in mappings {
        if mapping.endpoint.len() < 2 {
            return Err(InterfaceError::ObjectEndpointTooShort(
                mapping.endpoint.to_string(),
            ));
        }

        if mapping.reliability != first.reliability
            || mapping.explicit_timestamp != first.explicit_timestamp
        {
            return Err(InterfaceError::InconsistentMapping);
        }

        if !mapping.endpoint.same_parent(&first.endpoint) {
            return Err(InterfaceError::InconsistentEndpoints);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const DEVICE_DATASTREAM: &str = r#"{
        "interface_name": "org.astarte-platform.test.DeviceDatastream",
        "version_major": 0,
        "version_minor": 1,
        "type": "datastream",
        "ownership": "device",
        "mappings": [
            {
                "endpoint": "/uptime",
                "type": "longinteger",
                "reliability": "guaranteed",
                "explicit_timestamp": true
            },
            {
                "endpoint": "/%{sensor_id}/value",
                "type": "double",
                "reliability": "unique"
            }
        ]
    }"#;

    const OBJECT_DATASTREAM: &str = r#"{
        "interface_name": "org.astarte-platform.test.ObjectDatastream",
        "version_major": 1,
        "version_minor": 0,
        "type": "datastream",
        "ownership": "device",
        "aggregation": "object",
        "mappings": [
            {
                "endpoint": "/%{group}/latitude",
                "type": "double",
                "reliability": "guaranteed"
            },
            {
                "endpoint": "/%{group}/longitude",
                "type": "double",
                "reliability": "guaranteed"
            }
        ]
    }"#;

    const DEVICE_PROPERTIES: &str = r#"{
        "interface_name": "org.astarte-platform.test.DeviceProperties",
        "version_major": 0,
        "version_minor": 1,
        "type": "properties",
        "ownership": "device",
        "mappings": [
            {
                "endpoint": "/%{id}/name",
                "type": "string",
                "allow_unset": true
            }
        ]
    }"#;

    #[test]
    fn parse_datastream_interface() {
        let interface = Interface::from_str(DEVICE_DATASTREAM).unwrap();

        assert_eq!(
            interface.interface_name(),
            "org.astarte-platform.test.DeviceDatastream"
        );
        assert_eq!(interface.version_major(), 0);
        assert_eq!(interface.version_minor(), 1);
        assert_eq!(interface.ownership(), Ownership::Device);
        assert_eq!(interface.interface_type(), InterfaceTypeDef::Datastream);
        assert_eq!(interface.aggregation(), Aggregation::Individual);

        let mapping = interface.mapping("/uptime").unwrap();
        assert_eq!(mapping.mapping_type(), MappingType::LongInteger);
        assert_eq!(mapping.reliability(), Reliability::Guaranteed);
        assert!(mapping.explicit_timestamp());
        assert!(!mapping.allow_unset());
    }

    #[test]
    fn resolve_parametric_mapping() {
        let interface = Interface::from_str(DEVICE_DATASTREAM).unwrap();

        let mapping = interface.mapping("/sensor_1/value").unwrap();
        assert_eq!(mapping.mapping_type(), MappingType::Double);

        assert!(interface.mapping("/sensor_1/other").is_none());
        assert!(interface.mapping("/sensor-1/value").is_none());
    }

    #[test]
    fn resolve_mapping_from_paths() {
        let interface = Interface::from_str(OBJECT_DATASTREAM).unwrap();

        let mapping = interface.mapping_from_paths("/group_a", "latitude").unwrap();
        assert_eq!(mapping.endpoint().as_str(), "/%{group}/latitude");
    }

    #[test]
    fn reject_zero_version() {
        let json = DEVICE_DATASTREAM.replace(r#""version_minor": 1"#, r#""version_minor": 0"#);

        let err = Interface::from_str(&json).unwrap_err();
        assert!(matches!(err, InterfaceError::MajorMinor));
    }

    #[test]
    fn reject_object_properties() {
        let json = DEVICE_PROPERTIES.replace(
            r#""type": "properties","#,
            r#""type": "properties", "aggregation": "object","#,
        );

        let err = Interface::from_str(&json).unwrap_err();
        assert!(matches!(err, InterfaceError::ObjectProperties));
    }

    #[test]
    fn reject_overlapping_endpoints() {
        let json = r#"{
            "interface_name": "org.astarte-platform.test.Overlap",
            "version_major": 0,
            "version_minor": 1,
            "type": "datastream",
            "ownership": "device",
            "mappings": [
                { "endpoint": "/%{id}/value", "type": "double" },
                { "endpoint": "/fixed/value", "type": "integer" }
            ]
        }"#;

        let err = Interface::from_str(json).unwrap_err();
        assert!(matches!(err, InterfaceError::DuplicateMapping { .. }));
    }

    #[test]
    fn reject_inconsistent_object() {
        let json = OBJECT_DATASTREAM.replace(
            r#""endpoint": "/%{group}/longitude",
                "type": "double",
                "reliability": "guaranteed""#,
            r#""endpoint": "/%{group}/longitude",
                "type": "double",
                "reliability": "unique""#,
        );

        let err = Interface::from_str(&json).unwrap_err();
        assert!(matches!(err, InterfaceError::InconsistentMapping));
    }

    #[test]
    fn reject_short_object_endpoint() {
        let json = r#"{
            "interface_name": "org.astarte-platform.test.ShortObject",
            "version_major": 0,
            "version_minor": 1,
            "type": "datastream",
            "ownership": "device",
            "aggregation": "object",
            "mappings": [
                { "endpoint": "/value", "type": "double" }
            ]
        }"#;

        let err = Interface::from_str(json).unwrap_err();
        assert!(matches!(err, InterfaceError::ObjectEndpointTooShort(_)));
    }

    #[test]
    fn mapping_type_scalars() {
        assert_eq!(MappingType::DoubleArray.as_scalar(), MappingType::Double);
        assert_eq!(
            MappingType::BinaryBlobArray.as_scalar(),
            MappingType::BinaryBlob
        );
        assert_eq!(MappingType::Integer.as_scalar(), MappingType::Integer);
        assert!(MappingType::StringArray.is_array());
        assert!(!MappingType::DateTime.is_array());
    }

    #[test]
    fn reliability_to_qos() {
        assert_eq!(
            mqttbytes::QoS::from(Reliability::Unreliable),
            mqttbytes::QoS::AtMostOnce
        );
        assert_eq!(
            mqttbytes::QoS::from(Reliability::Guaranteed),
            mqttbytes::QoS::AtLeastOnce
        );
        assert_eq!(
            mqttbytes::QoS::from(Reliability::Unique),
            mqttbytes::QoS::ExactlyOnce
        );
    }
}
