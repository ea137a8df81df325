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

//! Collection of the interfaces a device declares to implement.
//!
//! The collection preserves insertion order, so the introspection string
//! published to the broker is stable within a session.

use tracing::warn;

use crate::interface::Interface;

/// Size after which a warning is emitted for the introspection string.
const INTROSPECTION_WARN_LEN: usize = 4096;

/// Error returned while mutating the device introspection.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InterfacesError {
    /// No interface with the given name is registered.
    #[error("couldn't find interface '{name}'")]
    NotFound {
        /// Name of the missing interface.
        name: String,
    },
    /// An interface with the same name is already registered.
    #[error("interface '{name}' already present")]
    AlreadyPresent {
        /// Name of the duplicated interface.
        name: String,
    },
    /// The new version of the interface changes ownership or type.
    #[error("interface '{name}' conflicts with the registered one")]
    Conflicting {
        /// Name of the conflicting interface.
        name: String,
    },
    /// The new version of the interface is not strictly greater.
    #[error("invalid version {major}.{minor} for interface '{name}'")]
    InvalidVersion {
        /// Name of the interface being updated.
        name: String,
        /// Major version of the rejected update.
        major: u32,
        /// Minor version of the rejected update.
        minor: u32,
    },
}

/// The ordered set of interfaces declared by a device.
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    interfaces: Vec<Interface>,
}

impl Interfaces {
    /// Creates an empty introspection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an introspection from the given interfaces.
    pub fn from_iter<I>(interfaces: I) -> Result<Self, InterfacesError>
    where
        I: IntoIterator<Item = Interface>,
    {
        let mut this = Self::new();

        for interface in interfaces {
            this.add(interface)?;
        }

        Ok(this)
    }

    /// Registers a new interface.
    ///
    /// Fails if an interface with the same name is already present.
    pub fn add(&mut self, interface: Interface) -> Result<(), InterfacesError> {
        if self.get(interface.interface_name()).is_some() {
            return Err(InterfacesError::AlreadyPresent {
                name: interface.interface_name().to_string(),
            });
        }

        self.interfaces.push(interface);

        Ok(())
    }

    /// Registers a new version of an interface, replacing the previous one.
    ///
    /// Falls through to an [`add`](Self::add) when the interface is not
    /// present. The update must keep ownership and type, and carry a strictly
    /// greater version.
    pub fn update(&mut self, interface: Interface) -> Result<(), InterfacesError> {
        let Some(existing) = self
            .interfaces
            .iter_mut()
            .find(|i| i.interface_name() == interface.interface_name())
        else {
            self.interfaces.push(interface);

            return Ok(());
        };

        if existing.ownership() != interface.ownership()
            || existing.interface_type() != interface.interface_type()
        {
            return Err(InterfacesError::Conflicting {
                name: interface.interface_name().to_string(),
            });
        }

        let newer = interface.version_major() > existing.version_major()
            || (interface.version_major() == existing.version_major()
                && interface.version_minor() > existing.version_minor());

        if !newer {
            return Err(InterfacesError::InvalidVersion {
                name: interface.interface_name().to_string(),
                major: interface.version_major(),
                minor: interface.version_minor(),
            });
        }

        *existing = interface;

        Ok(())
    }

    /// Unregisters the interface with the given name.
    pub fn remove(&mut self, name: &str) -> Option<Interface> {
        let idx = self
            .interfaces
            .iter()
            .position(|i| i.interface_name() == name)?;

        Some(self.interfaces.remove(idx))
    }

    /// Returns the interface with the given name.
    pub fn get(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.interface_name() == name)
    }

    /// Returns the interface with the given name, if it is a property.
    pub fn get_property(&self, name: &str) -> Option<&Interface> {
        self.get(name).filter(|i| i.is_property())
    }

    /// Iterates over the interfaces in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter()
    }

    /// Number of registered interfaces.
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Whether no interface is registered.
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Builds the introspection string published on the base topic.
    ///
    /// Every interface contributes a `<name>:<major>:<minor>` entry, in
    /// insertion order, separated by `;`.
    pub fn get_introspection_string(&self) -> String {
        let introspection = self
            .interfaces
            .iter()
            .map(|interface| {
                format!(
                    "{}:{}:{}",
                    interface.interface_name(),
                    interface.version_major(),
                    interface.version_minor()
                )
            })
            .collect::<Vec<String>>()
            .join(";");

        if introspection.len() > INTROSPECTION_WARN_LEN {
            warn!(
                len = introspection.len(),
                "introspection string is larger than {INTROSPECTION_WARN_LEN} bytes"
            );
        }

        introspection
    }
}
