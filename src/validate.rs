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

//! Validation of outgoing data against the device introspection.
//!
//! Validation runs on every publish, so the broker never receives a message
//! that doesn't conform to the declared interface and user callbacks can
//! assume decoded values match their schema.

use crate::interface::{Aggregation, Interface, InterfaceTypeDef, Mapping, Ownership};
use crate::types::AstarteType;
use crate::Timestamp;

/// Errors while validating a value against an interface.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The path doesn't resolve to a mapping of the interface.
    #[error("path '{path}' doesn't match any mapping of '{interface}'")]
    MappingNotFound {
        /// Path that failed to resolve.
        path: String,
        /// Name of the interface.
        interface: String,
    },
    /// Only the owner of an interface can publish on it.
    #[error("interface '{0}' is not owned by the device")]
    Ownership(String),
    /// The interface is not of the expected type.
    #[error("interface '{name}' is not a {expected:?} interface")]
    InterfaceType {
        /// Name of the interface.
        name: String,
        /// Type required by the operation.
        expected: InterfaceTypeDef,
    },
    /// The interface doesn't have the expected aggregation.
    #[error("interface '{name}' doesn't have {expected:?} aggregation")]
    Aggregation {
        /// Name of the interface.
        name: String,
        /// Aggregation required by the operation.
        expected: Aggregation,
    },
    /// The value doesn't conform to the mapping type.
    #[error("value of type {got} is incompatible with the mapping of type {expected}")]
    ValueIncompatible {
        /// Type declared by the mapping.
        expected: crate::interface::MappingType,
        /// Type of the rejected value.
        got: &'static str,
    },
    /// Doubles must be finite numbers.
    #[error("value contains a NaN or infinite double")]
    ValueNotFinite,
    /// The mapping requires an explicit timestamp.
    #[error("mapping '{0}' requires an explicit timestamp")]
    TimestampRequired(String),
    /// The mapping doesn't support an explicit timestamp.
    #[error("mapping '{0}' doesn't support an explicit timestamp")]
    TimestampNotSupported(String),
    /// The mapping doesn't allow unsetting the property.
    #[error("mapping '{0}' doesn't allow unset")]
    UnsetNotAllowed(String),
    /// Object entries must be distinct.
    #[error("duplicated entry '{0}' in object aggregate")]
    DuplicateObjectEntry(String),
}

fn check_ownership(interface: &Interface) -> Result<(), ValidationError> {
    if interface.ownership() != Ownership::Device {
        return Err(ValidationError::Ownership(
            interface.interface_name().to_string(),
        ));
    }

    Ok(())
}

fn resolve_mapping<'a>(
    interface: &'a Interface,
    path: &str,
) -> Result<&'a Mapping, ValidationError> {
    interface
        .mapping(path)
        .ok_or_else(|| ValidationError::MappingNotFound {
            path: path.to_string(),
            interface: interface.interface_name().to_string(),
        })
}

fn check_value(mapping: &Mapping, value: &AstarteType) -> Result<(), ValidationError> {
    if value.tag() != Some(mapping.mapping_type()) {
        return Err(ValidationError::ValueIncompatible {
            expected: mapping.mapping_type(),
            got: value.display_type(),
        });
    }

    value
        .validate_floats()
        .map_err(|_| ValidationError::ValueNotFinite)
}

fn check_timestamp(
    endpoint: &str,
    explicit_timestamp: bool,
    timestamp: Option<&Timestamp>,
) -> Result<(), ValidationError> {
    match (explicit_timestamp, timestamp) {
        (true, None) => Err(ValidationError::TimestampRequired(endpoint.to_string())),
        (false, Some(_)) => Err(ValidationError::TimestampNotSupported(endpoint.to_string())),
        _ => Ok(()),
    }
}

/// Validates an individual datastream publish.
pub(crate) fn individual_datastream(
    interface: &Interface,
    path: &str,
    value: &AstarteType,
    timestamp: Option<&Timestamp>,
) -> Result<(), ValidationError> {
    check_ownership(interface)?;

    if interface.is_property() {
        return Err(ValidationError::InterfaceType {
            name: interface.interface_name().to_string(),
            expected: InterfaceTypeDef::Datastream,
        });
    }

    if interface.is_object() {
        return Err(ValidationError::Aggregation {
            name: interface.interface_name().to_string(),
            expected: Aggregation::Individual,
        });
    }

    let mapping = resolve_mapping(interface, path)?;

    check_value(mapping, value)?;
    check_timestamp(mapping.endpoint().as_str(), mapping.explicit_timestamp(), timestamp)
}

/// Validates an object aggregate publish.
///
/// Every entry is resolved under the common parent path and checked like an
/// individual value; the timestamp is checked against the flag shared by the
/// object mappings.
pub(crate) fn aggregated_datastream(
    interface: &Interface,
    path: &str,
    entries: &[(String, AstarteType)],
    timestamp: Option<&Timestamp>,
) -> Result<(), ValidationError> {
    check_ownership(interface)?;

    if !interface.is_object() {
        return Err(ValidationError::Aggregation {
            name: interface.interface_name().to_string(),
            expected: Aggregation::Object,
        });
    }

    for (i, (key, value)) in entries.iter().enumerate() {
        if entries[..i].iter().any(|(other, _)| other == key) {
            return Err(ValidationError::DuplicateObjectEntry(key.to_string()));
        }

        let full_path = format!("{path}/{key}");
        let mapping = resolve_mapping(interface, &full_path)?;

        check_value(mapping, value)?;
    }

    check_timestamp(path, interface.object_explicit_timestamp(), timestamp)
}

/// Validates a property set.
pub(crate) fn set_property(
    interface: &Interface,
    path: &str,
    value: &AstarteType,
) -> Result<(), ValidationError> {
    check_ownership(interface)?;

    if !interface.is_property() {
        return Err(ValidationError::InterfaceType {
            name: interface.interface_name().to_string(),
            expected: InterfaceTypeDef::Properties,
        });
    }

    let mapping = resolve_mapping(interface, path)?;

    check_value(mapping, value)
}

/// Validates a property unset.
pub(crate) fn unset_property(interface: &Interface, path: &str) -> Result<(), ValidationError> {
    check_ownership(interface)?;

    if !interface.is_property() {
        return Err(ValidationError::InterfaceType {
            name: interface.interface_name().to_string(),
            expected: InterfaceTypeDef::Properties,
        });
    }

    let mapping = resolve_mapping(interface, path)?;

    if !mapping.allow_unset() {
        return Err(ValidationError::UnsetNotAllowed(
            mapping.endpoint().as_str().to_string(),
        ));
    }

    Ok(())
}
