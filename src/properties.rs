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

//! Codec for the properties control messages.
//!
//! The payload of `/control/producer/properties` and
//! `/control/consumer/properties` is the big endian length of the
//! uncompressed text followed by the zlib compressed, `;` separated list of
//! `<interface><path>` entries.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::warn;

/// Error while handling a properties control message.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum PropertiesError {
    /// The payload is too short to contain the size prefix.
    #[error("properties payload is too short: {0} bytes")]
    TooShort(usize),
    /// Couldn't inflate the compressed list.
    #[error("couldn't decompress the properties payload")]
    Decompress(#[source] std::io::Error),
    /// Couldn't deflate the list.
    #[error("couldn't compress the properties payload")]
    Compress(#[source] std::io::Error),
}

/// Extracts the set of full property paths from a consumer properties
/// payload.
pub(crate) fn extract_set_properties(bdata: &[u8]) -> Result<Vec<String>, PropertiesError> {
    if bdata.len() < 4 {
        return Err(PropertiesError::TooShort(bdata.len()));
    }

    let (size, data) = bdata.split_at(4);
    let size = u32::from_be_bytes(size.try_into().expect("slice of 4 bytes"));

    let mut decoder = ZlibDecoder::new(data);
    let mut list = String::new();

    decoder
        .read_to_string(&mut list)
        .map_err(PropertiesError::Decompress)?;

    if list.len() != size as usize {
        warn!(
            declared = size,
            actual = list.len(),
            "properties payload size mismatch"
        );
    }

    if list.is_empty() {
        return Ok(Vec::new());
    }

    Ok(list.split(';').map(ToString::to_string).collect())
}

/// Builds the producer properties payload from the full property paths.
pub(crate) fn serialize_props(paths: &[String]) -> Result<Vec<u8>, PropertiesError> {
    let list = paths.join(";");

    let mut payload = Vec::with_capacity(list.len() / 2 + 4);
    payload.extend_from_slice(&(list.len() as u32).to_be_bytes());

    let mut encoder = ZlibEncoder::new(payload, Compression::default());
    encoder
        .write_all(list.as_bytes())
        .map_err(PropertiesError::Compress)?;

    encoder.finish().map_err(PropertiesError::Compress)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip() {
        let paths = [
            "com.test.Properties/1/name".to_string(),
            "com.test.Properties/2/name".to_string(),
        ];

        let payload = serialize_props(&paths).unwrap();
        let extracted = extract_set_properties(&payload).unwrap();

        assert_eq!(extracted, paths);
    }

    #[test]
    fn empty_list() {
        let payload = serialize_props(&[]).unwrap();

        let extracted = extract_set_properties(&payload).unwrap();

        assert_eq!(extracted, Vec::<String>::new());
    }

    #[test]
    fn rejects_short_payload() {
        let err = extract_set_properties(&[0, 0]).unwrap_err();

        assert!(matches!(err, PropertiesError::TooShort(2)));
    }

    #[test]
    fn rejects_garbage() {
        let err = extract_set_properties(&[0, 0, 0, 4, 0xde, 0xad, 0xbe, 0xef]).unwrap_err();

        assert!(matches!(err, PropertiesError::Decompress(_)));
    }
}
