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

//! Device identifiers and the UUID utilities to generate them.
//!
//! An Astarte device id is the URL safe base64 encoding, without padding, of
//! a 128 bit identifier. The identifier can be random or derived
//! deterministically from a namespace and some unique hardware data.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use uuid::Uuid;

/// Error while parsing an UUID.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    /// The string is not a canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`
    /// UUID.
    #[error("invalid canonical UUID '{0}'")]
    Canonical(String),
}

/// Generates a random UUID.
///
/// The version nibble is forced to 4, but the variant bits are left as drawn,
/// so the result is not strictly RFC 4122 compliant in the variant field.
pub fn generate_random_uuid() -> Uuid {
    let mut bytes: [u8; 16] = rand::random();

    bytes[6] = (bytes[6] & 0x0f) | 0x40;

    Uuid::from_bytes(bytes)
}

/// Derives an UUID from the namespace and the given data, using the name
/// based version 5 scheme (SHA-1).
pub fn generate_uuid_v5(namespace: &Uuid, data: &[u8]) -> Uuid {
    Uuid::new_v5(namespace, data)
}

/// Parses an UUID in canonical form only.
///
/// Other representations accepted by the `uuid` crate, like the braced or
/// simple forms, are rejected.
pub fn parse_canonical_uuid(s: &str) -> Result<Uuid, DeviceIdError> {
    let canonical = s.len() == 36
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        });

    if !canonical {
        return Err(DeviceIdError::Canonical(s.to_string()));
    }

    Uuid::parse_str(s).map_err(|_| DeviceIdError::Canonical(s.to_string()))
}

/// Encodes the UUID in standard base64, 24 characters with padding.
pub fn to_base64(uuid: &Uuid) -> String {
    STANDARD.encode(uuid.as_bytes())
}

/// Encodes the UUID in URL safe base64 without padding, 22 characters.
///
/// This is the form used for the device id in the MQTT topics.
pub fn to_base64url(uuid: &Uuid) -> String {
    URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

/// Generates a random device id.
pub fn generate_random_device_id() -> String {
    to_base64url(&generate_random_uuid())
}

/// Derives a device id from a namespace UUID and some unique data, like a
/// MAC address or a serial number.
///
/// The same inputs always produce the same device id.
pub fn generate_deterministic_device_id(namespace: &Uuid, unique_data: &[u8]) -> String {
    to_base64url(&generate_uuid_v5(namespace, unique_data))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn uuid_v5_is_deterministic() {
        let namespace = parse_canonical_uuid("c21fb11c-b6c9-452a-9e86-6075e313d7e2").unwrap();

        let uuid = generate_uuid_v5(&namespace, b"00225588");

        assert_eq!(
            uuid.to_string(),
            "63c8fb48-02ab-53f4-a254-52956dcbbce4"
        );
    }

    #[test]
    fn uuid_v4_has_version_nibble() {
        let uuid = generate_random_uuid();

        assert_eq!(uuid.as_bytes()[6] >> 4, 4);
        assert_eq!(uuid.to_string().len(), 36);
    }

    #[test]
    fn canonical_parser_rejects_other_forms() {
        // Simple form.
        let err = parse_canonical_uuid("c21fb11cb6c9452a9e866075e313d7e2").unwrap_err();
        assert!(matches!(err, DeviceIdError::Canonical(_)));

        // Braced form.
        let err =
            parse_canonical_uuid("{c21fb11c-b6c9-452a-9e86-6075e313d7e2}").unwrap_err();
        assert!(matches!(err, DeviceIdError::Canonical(_)));

        // Non hex digit outside of the hyphen positions.
        let err = parse_canonical_uuid("z21fb11c-b6c9-452a-9e86-6075e313d7e2").unwrap_err();
        assert!(matches!(err, DeviceIdError::Canonical(_)));

        parse_canonical_uuid("c21fb11c-b6c9-452a-9e86-6075e313d7e2").unwrap();
    }

    #[test]
    fn base64_forms() {
        let uuid = parse_canonical_uuid("63c8fb48-02ab-53f4-a254-52956dcbbce4").unwrap();

        let standard = to_base64(&uuid);
        assert_eq!(standard.len(), 24);
        assert!(standard.ends_with("=="));

        let url = to_base64url(&uuid);
        assert_eq!(url.len(), 22);
        assert!(!url.contains('='));
        assert_eq!(url, "Y8j7SAKrU_SiVFKVbcu85A");
    }

    #[test]
    fn deterministic_device_id() {
        let namespace = parse_canonical_uuid("c21fb11c-b6c9-452a-9e86-6075e313d7e2").unwrap();

        let first = generate_deterministic_device_id(&namespace, b"00225588");
        let second = generate_deterministic_device_id(&namespace, b"00225588");

        assert_eq!(first, second);
        assert_eq!(first.len(), 22);
    }
}
