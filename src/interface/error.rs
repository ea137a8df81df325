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

//! Errors generated by the interface module.

use std::io;

use super::{endpoint::EndpointError, MAX_INTERFACE_NAME_LEN};

/// Error for parsing and validating an interface.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum InterfaceError {
    /// Couldn't parse the interface JSON.
    #[error("cannot parse interface JSON")]
    Parse(#[from] serde_json::Error),
    /// Cannot read the interface file.
    #[error("cannot read interface file")]
    Io(#[from] io::Error),
    /// Both major and minor are 0.
    #[error("wrong major and minor")]
    MajorMinor,
    /// The interface name is empty or longer than [`MAX_INTERFACE_NAME_LEN`].
    #[error("invalid interface name '{name}', max length is {MAX_INTERFACE_NAME_LEN}")]
    InvalidName {
        /// The offending name.
        name: String,
    },
    /// The interface has no mapping with the given path.
    #[error("couldn't find the mapping '{path}' in the interface")]
    MappingNotFound {
        /// Path that didn't resolve to a mapping.
        path: String,
    },
    /// Error while parsing the endpoint.
    #[error("invalid endpoint")]
    InvalidEndpoint(#[from] EndpointError),
    /// The interface has no mappings.
    #[error("interface with no mappings")]
    EmptyMappings,
    /// A properties interface must aggregate individual mappings.
    #[error("properties interface with object aggregation")]
    ObjectProperties,
    /// The mappings of an object must share reliability and explicit
    /// timestamp flags.
    #[error("object with inconsistent mappings")]
    InconsistentMapping,
    /// The object interface must have the same levels for every mapping,
    /// except the last one.
    #[error("object with inconsistent endpoints")]
    InconsistentEndpoints,
    /// The interface endpoints must all be unique.
    #[error("duplicate endpoint mapping '{endpoint}' and '{duplicate}'")]
    DuplicateMapping {
        /// First of the colliding endpoints.
        endpoint: String,
        /// Endpoint that collides with it.
        duplicate: String,
    },
    /// The object interface should have at least 2 levels.
    #[error("object endpoint should have at least 2 levels: '{0}'")]
    ObjectEndpointTooShort(String),
}
