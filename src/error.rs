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

//! Error types for the Astarte device client.

use crate::connection::ConnectionError;
use crate::device_id::DeviceIdError;
use crate::interface::error::InterfaceError;
use crate::interfaces::InterfacesError;
use crate::payload::PayloadError;
use crate::properties::PropertiesError;
use crate::store::StoreError;
use crate::topic::TopicError;
use crate::types::TypeError;
use crate::validate::ValidationError;

/// Astarte error.
///
/// Possible errors returned by the functions of the device client.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid interface definition.
    #[error("invalid interface")]
    Interface(#[from] InterfaceError),

    /// Couldn't mutate the device introspection.
    #[error("couldn't modify the introspection")]
    Interfaces(#[from] InterfacesError),

    /// The introspection can only change while disconnected.
    #[error("interfaces can only be added or removed while disconnected")]
    InterfacesLocked,

    /// The data to send doesn't conform to the interface.
    #[error("validation of the send failed")]
    Validation(#[from] ValidationError),

    /// Errors when converting between Astarte types.
    #[error("couldn't convert to an Astarte type")]
    Types(#[from] TypeError),

    /// Errors that can occur handling the payload.
    #[error("couldn't process payload")]
    Payload(#[from] PayloadError),

    /// Couldn't parse the topic of a received publish.
    #[error("invalid topic {}", .0.topic())]
    Topic(#[from] TopicError),

    /// Error while handling a properties control message.
    #[error("couldn't handle properties")]
    Properties(#[from] PropertiesError),

    /// Error returned by a store operation.
    #[error("couldn't complete the store operation")]
    Store(#[from] StoreError),

    /// Error of the MQTT session.
    #[error("mqtt session error")]
    Connection(#[from] ConnectionError),

    /// Error while handling a device id.
    #[error("invalid device id")]
    DeviceId(#[from] DeviceIdError),
}
