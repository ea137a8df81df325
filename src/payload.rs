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

//! Binary document codec for the payloads exchanged with the broker.
//!
//! The wire format is a subset of BSON. Every payload is a top level document
//! with a `v` element carrying the transmitted value (or an embedded document
//! with one element per path for object aggregates) and an optional `t`
//! element carrying the explicit timestamp as a UTC datetime in milliseconds.
//!
//! Numeric payloads are little-endian regardless of the host endianness.

use chrono::{TimeZone, Utc};

use crate::interface::{Interface, MappingType};
use crate::types::AstarteType;
use crate::Timestamp;

const BSON_TYPE_DOUBLE: u8 = 0x01;
const BSON_TYPE_STRING: u8 = 0x02;
const BSON_TYPE_DOCUMENT: u8 = 0x03;
const BSON_TYPE_ARRAY: u8 = 0x04;
const BSON_TYPE_BINARY: u8 = 0x05;
const BSON_TYPE_BOOLEAN: u8 = 0x08;
const BSON_TYPE_DATETIME: u8 = 0x09;
const BSON_TYPE_INT32: u8 = 0x10;
const BSON_TYPE_INT64: u8 = 0x12;

const BSON_SUBTYPE_GENERIC: u8 = 0x00;

/// Errors that can occur handling the payload.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    /// Couldn't serialize the value.
    #[error("couldn't serialize the payload: {0}")]
    Serializer(&'static str),
    /// The payload is not a well formed document.
    #[error("couldn't deserialize the payload: {0}")]
    Deserializer(&'static str),
    /// The received element doesn't conform to the mapping type.
    #[error("expected value of type {expected}, received BSON element 0x{found:02x}")]
    Types {
        /// Type declared by the mapping.
        expected: MappingType,
        /// BSON element type found in the payload.
        found: u8,
    },
    /// A document was received without elements.
    #[error("BSON document with no elements")]
    EmptyDocument,
    /// An object aggregate was sent without entries.
    #[error("BSON array with no elements")]
    EmptyArray,
    /// An object entry doesn't resolve to a mapping of the interface.
    #[error("couldn't find mapping for object entry '{0}'")]
    ObjectMapping(String),
    /// The received timestamp is outside the representable range.
    #[error("invalid timestamp of {0} ms")]
    Timestamp(i64),
}

// -------------------------------------------------------------------------
// Serializer
// -------------------------------------------------------------------------

/// Streaming document writer.
///
/// A document is opened with a zero size placeholder, elements are appended,
/// and the size prefix is patched when the document is closed.
#[derive(Debug, Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self::default()
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Opens a document, returning the offset of the size placeholder.
    fn begin_document(&mut self) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);

        start
    }

    /// Terminates the document and patches its size prefix.
    fn end_document(&mut self, start: usize) {
        self.buf.push(0);

        let size = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
    }

    fn element_header(&mut self, element_type: u8, name: &str) {
        self.buf.push(element_type);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
    }

    fn append_double(&mut self, name: &str, value: f64) {
        self.element_header(BSON_TYPE_DOUBLE, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn append_int32(&mut self, name: &str, value: i32) {
        self.element_header(BSON_TYPE_INT32, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn append_int64(&mut self, name: &str, value: i64) {
        self.element_header(BSON_TYPE_INT64, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn append_boolean(&mut self, name: &str, value: bool) {
        self.element_header(BSON_TYPE_BOOLEAN, name);
        self.buf.push(value.into());
    }

    fn append_datetime(&mut self, name: &str, millis: i64) {
        self.element_header(BSON_TYPE_DATETIME, name);
        self.buf.extend_from_slice(&millis.to_le_bytes());
    }

    fn append_string(&mut self, name: &str, value: &str) {
        self.element_header(BSON_TYPE_STRING, name);
        self.buf
            .extend_from_slice(&((value.len() + 1) as i32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    fn append_binary(&mut self, name: &str, value: &[u8]) {
        self.element_header(BSON_TYPE_BINARY, name);
        self.buf
            .extend_from_slice(&(value.len() as i32).to_le_bytes());
        self.buf.push(BSON_SUBTYPE_GENERIC);
        self.buf.extend_from_slice(value);
    }

    /// Appends an array element, encoded as a document with `"0"`, `"1"`, …
    /// keys in order.
    fn append_array<T>(&mut self, name: &str, items: &[T], append: impl Fn(&mut Self, &str, &T)) {
        self.element_header(BSON_TYPE_ARRAY, name);

        let doc = self.begin_document();
        for (i, item) in items.iter().enumerate() {
            let key = i.to_string();

            append(self, &key, item);
        }
        self.end_document(doc);
    }

    fn append_value(&mut self, name: &str, value: &AstarteType) -> Result<(), PayloadError> {
        match value {
            AstarteType::Double(v) => self.append_double(name, *v),
            AstarteType::Integer(v) => self.append_int32(name, *v),
            AstarteType::Boolean(v) => self.append_boolean(name, *v),
            AstarteType::LongInteger(v) => self.append_int64(name, *v),
            AstarteType::String(v) => self.append_string(name, v),
            AstarteType::BinaryBlob(v) => self.append_binary(name, v),
            AstarteType::DateTime(v) => self.append_datetime(name, v.timestamp_millis()),
            AstarteType::DoubleArray(arr) => {
                self.append_array(name, arr, |w, key, v| w.append_double(key, *v))
            }
            AstarteType::IntegerArray(arr) => {
                self.append_array(name, arr, |w, key, v| w.append_int32(key, *v))
            }
            AstarteType::BooleanArray(arr) => {
                self.append_array(name, arr, |w, key, v| w.append_boolean(key, *v))
            }
            AstarteType::LongIntegerArray(arr) => {
                self.append_array(name, arr, |w, key, v| w.append_int64(key, *v))
            }
            AstarteType::StringArray(arr) => {
                self.append_array(name, arr, |w, key, v| w.append_string(key, v))
            }
            AstarteType::BinaryBlobArray(arr) => {
                self.append_array(name, arr, |w, key, v| w.append_binary(key, v))
            }
            AstarteType::DateTimeArray(arr) => self.append_array(name, arr, |w, key, v| {
                w.append_datetime(key, v.timestamp_millis())
            }),
            AstarteType::Unset => return Err(PayloadError::Serializer("unset is not a value")),
        }

        Ok(())
    }
}

/// Serializes an individual value with its optional explicit timestamp.
///
/// [`AstarteType::Unset`] serializes to the empty payload used to unset a
/// property.
pub(crate) fn serialize_individual(
    value: &AstarteType,
    timestamp: Option<&Timestamp>,
) -> Result<Vec<u8>, PayloadError> {
    if matches!(value, AstarteType::Unset) {
        return Ok(Vec::new());
    }

    let mut writer = Writer::new();

    let doc = writer.begin_document();
    writer.append_value("v", value)?;
    if let Some(timestamp) = timestamp {
        writer.append_datetime("t", timestamp.timestamp_millis());
    }
    writer.end_document(doc);

    Ok(writer.into_inner())
}

/// Serializes an object aggregate as an embedded document keyed by the entry
/// paths.
pub(crate) fn serialize_object(
    entries: &[(String, AstarteType)],
    timestamp: Option<&Timestamp>,
) -> Result<Vec<u8>, PayloadError> {
    if entries.is_empty() {
        return Err(PayloadError::EmptyArray);
    }

    let mut writer = Writer::new();

    let doc = writer.begin_document();
    writer.element_header(BSON_TYPE_DOCUMENT, "v");
    let inner = writer.begin_document();
    for (key, value) in entries {
        writer.append_value(key, value)?;
    }
    writer.end_document(inner);

    if let Some(timestamp) = timestamp {
        writer.append_datetime("t", timestamp.timestamp_millis());
    }
    writer.end_document(doc);

    Ok(writer.into_inner())
}

// -------------------------------------------------------------------------
// Deserializer
// -------------------------------------------------------------------------

fn recognized_element_type(element_type: u8) -> bool {
    matches!(
        element_type,
        BSON_TYPE_DOUBLE
            | BSON_TYPE_STRING
            | BSON_TYPE_DOCUMENT
            | BSON_TYPE_ARRAY
            | BSON_TYPE_BINARY
            | BSON_TYPE_BOOLEAN
            | BSON_TYPE_DATETIME
            | BSON_TYPE_INT32
            | BSON_TYPE_INT64
    )
}

/// View over the elements of a received document.
///
/// Validation is coarse on purpose: the declared size must fit the buffer,
/// the document must be terminated and the first element must be of a
/// recognized type. Everything else is checked lazily while iterating.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Document<'a> {
    elements: &'a [u8],
}

impl<'a> Document<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Result<Self, PayloadError> {
        if buf.len() < 5 {
            return Err(PayloadError::Deserializer("document too short"));
        }

        let size = i32::from_le_bytes(buf[0..4].try_into().expect("slice of 4 bytes"));
        let size = usize::try_from(size)
            .map_err(|_| PayloadError::Deserializer("negative document size"))?;

        if size < 5 || size > buf.len() {
            return Err(PayloadError::Deserializer("document size out of bounds"));
        }

        if buf[size - 1] != 0 {
            return Err(PayloadError::Deserializer("document not terminated"));
        }

        let elements = &buf[4..size - 1];

        if let Some(&first) = elements.first() {
            if !recognized_element_type(first) {
                return Err(PayloadError::Deserializer("unrecognized element type"));
            }
        }

        Ok(Self { elements })
    }

    pub(crate) fn iter(&self) -> ElementIter<'a> {
        ElementIter {
            rest: self.elements,
        }
    }

    /// Linear scan for the element with the given name.
    pub(crate) fn element_lookup(&self, name: &str) -> Result<Option<Element<'a>>, PayloadError> {
        for element in self.iter() {
            let element = element?;

            if element.name == name {
                return Ok(Some(element));
            }
        }

        Ok(None)
    }

    pub(crate) fn count_elements(&self) -> Result<usize, PayloadError> {
        let mut count = 0;

        for element in self.iter() {
            element?;

            count += 1;
        }

        Ok(count)
    }
}

/// Iterator over the elements of a [`Document`].
#[derive(Debug)]
pub(crate) struct ElementIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Result<Element<'a>, PayloadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        match parse_element(self.rest) {
            Ok((element, rest)) => {
                self.rest = rest;

                Some(Ok(element))
            }
            Err(err) => {
                // Stop the iteration on a corrupted element.
                self.rest = &[];

                Some(Err(err))
            }
        }
    }
}

/// A single decoded element of a document.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Element<'a> {
    element_type: u8,
    name: &'a str,
    data: ElementData<'a>,
}

#[derive(Debug, Clone, Copy)]
enum ElementData<'a> {
    Double(f64),
    String(&'a str),
    Document(&'a [u8]),
    Array(&'a [u8]),
    Binary(&'a [u8]),
    Boolean(bool),
    DateTime(i64),
    Int32(i32),
    Int64(i64),
}

fn split_at_checked(buf: &[u8], len: usize) -> Result<(&[u8], &[u8]), PayloadError> {
    if buf.len() < len {
        return Err(PayloadError::Deserializer("truncated element"));
    }

    Ok(buf.split_at(len))
}

fn read_i32_len(buf: &[u8]) -> Result<(usize, &[u8]), PayloadError> {
    let (len, rest) = split_at_checked(buf, 4)?;
    let len = i32::from_le_bytes(len.try_into().expect("slice of 4 bytes"));
    let len =
        usize::try_from(len).map_err(|_| PayloadError::Deserializer("negative element length"))?;

    Ok((len, rest))
}

fn parse_element(buf: &[u8]) -> Result<(Element<'_>, &[u8]), PayloadError> {
    let (&element_type, rest) = buf
        .split_first()
        .ok_or(PayloadError::Deserializer("truncated element"))?;

    let name_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(PayloadError::Deserializer("unterminated element name"))?;
    let name = std::str::from_utf8(&rest[..name_end])
        .map_err(|_| PayloadError::Deserializer("element name is not valid UTF-8"))?;
    let rest = &rest[name_end + 1..];

    let (data, rest) = match element_type {
        BSON_TYPE_DOUBLE => {
            let (bytes, rest) = split_at_checked(rest, 8)?;
            let value = f64::from_le_bytes(bytes.try_into().expect("slice of 8 bytes"));

            (ElementData::Double(value), rest)
        }
        BSON_TYPE_STRING => {
            let (len, rest) = read_i32_len(rest)?;
            if len == 0 {
                return Err(PayloadError::Deserializer("string with zero length"));
            }
            let (bytes, rest) = split_at_checked(rest, len)?;
            if bytes[len - 1] != 0 {
                return Err(PayloadError::Deserializer("unterminated string"));
            }
            let value = std::str::from_utf8(&bytes[..len - 1])
                .map_err(|_| PayloadError::Deserializer("string is not valid UTF-8"))?;

            (ElementData::String(value), rest)
        }
        BSON_TYPE_DOCUMENT | BSON_TYPE_ARRAY => {
            let (len, _) = read_i32_len(rest)?;
            let (bytes, rest) = split_at_checked(rest, len)?;

            if element_type == BSON_TYPE_DOCUMENT {
                (ElementData::Document(bytes), rest)
            } else {
                (ElementData::Array(bytes), rest)
            }
        }
        BSON_TYPE_BINARY => {
            let (len, rest) = read_i32_len(rest)?;
            let (&subtype, rest) = rest
                .split_first()
                .ok_or(PayloadError::Deserializer("truncated element"))?;
            if subtype != BSON_SUBTYPE_GENERIC {
                return Err(PayloadError::Deserializer("unsupported binary subtype"));
            }
            let (bytes, rest) = split_at_checked(rest, len)?;

            (ElementData::Binary(bytes), rest)
        }
        BSON_TYPE_BOOLEAN => {
            let (byte, rest) = split_at_checked(rest, 1)?;

            (ElementData::Boolean(byte[0] != 0), rest)
        }
        BSON_TYPE_DATETIME => {
            let (bytes, rest) = split_at_checked(rest, 8)?;
            let value = i64::from_le_bytes(bytes.try_into().expect("slice of 8 bytes"));

            (ElementData::DateTime(value), rest)
        }
        BSON_TYPE_INT32 => {
            let (bytes, rest) = split_at_checked(rest, 4)?;
            let value = i32::from_le_bytes(bytes.try_into().expect("slice of 4 bytes"));

            (ElementData::Int32(value), rest)
        }
        BSON_TYPE_INT64 => {
            let (bytes, rest) = split_at_checked(rest, 8)?;
            let value = i64::from_le_bytes(bytes.try_into().expect("slice of 8 bytes"));

            (ElementData::Int64(value), rest)
        }
        _ => return Err(PayloadError::Deserializer("unrecognized element type")),
    };

    Ok((
        Element {
            element_type,
            name,
            data,
        },
        rest,
    ))
}

fn timestamp_from_millis(millis: i64) -> Result<Timestamp, PayloadError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(PayloadError::Timestamp(millis))
}

/// Converts an element into a value of the expected mapping type.
///
/// The mapping type disambiguates the cases where the document alone is not
/// enough, like integers received for a long integer mapping.
fn value_from_element(
    element: &Element<'_>,
    expected: MappingType,
) -> Result<AstarteType, PayloadError> {
    let mismatch = || PayloadError::Types {
        expected,
        found: element.element_type,
    };

    let value = match (expected, &element.data) {
        (MappingType::Double, ElementData::Double(v)) => AstarteType::Double(*v),
        (MappingType::Integer, ElementData::Int32(v)) => AstarteType::Integer(*v),
        (MappingType::Boolean, ElementData::Boolean(v)) => AstarteType::Boolean(*v),
        (MappingType::LongInteger, ElementData::Int64(v)) => AstarteType::LongInteger(*v),
        (MappingType::LongInteger, ElementData::Int32(v)) => AstarteType::LongInteger((*v).into()),
        (MappingType::String, ElementData::String(v)) => AstarteType::String(v.to_string()),
        (MappingType::BinaryBlob, ElementData::Binary(v)) => AstarteType::BinaryBlob(v.to_vec()),
        (MappingType::DateTime, ElementData::DateTime(millis)) => {
            AstarteType::DateTime(timestamp_from_millis(*millis)?)
        }
        (expected, ElementData::Array(raw)) if expected.is_array() => {
            deserialize_array(raw, expected)?
        }
        _ => return Err(mismatch()),
    };

    Ok(value)
}

fn collect_array<'a, T>(
    doc: &Document<'a>,
    count: usize,
    extract: impl Fn(&Element<'a>) -> Result<T, PayloadError>,
) -> Result<Vec<T>, PayloadError> {
    let mut items = Vec::with_capacity(count);

    for element in doc.iter() {
        let element = element?;

        items.push(extract(&element)?);
    }

    Ok(items)
}

/// Decodes an array element, checking every child against the scalar type of
/// the mapping.
///
/// An array without elements decodes to the length zero value of the expected
/// mapping type.
fn deserialize_array(raw: &[u8], expected: MappingType) -> Result<AstarteType, PayloadError> {
    let doc = Document::new(raw)?;
    let count = doc.count_elements()?;
    let scalar = expected.as_scalar();

    let mismatch = |element: &Element| PayloadError::Types {
        expected: scalar,
        found: element.element_type,
    };

    let value = match expected {
        MappingType::DoubleArray => {
            AstarteType::DoubleArray(collect_array(&doc, count, |el| match el.data {
                ElementData::Double(v) => Ok(v),
                _ => Err(mismatch(el)),
            })?)
        }
        MappingType::IntegerArray => {
            AstarteType::IntegerArray(collect_array(&doc, count, |el| match el.data {
                ElementData::Int32(v) => Ok(v),
                _ => Err(mismatch(el)),
            })?)
        }
        MappingType::BooleanArray => {
            AstarteType::BooleanArray(collect_array(&doc, count, |el| match el.data {
                ElementData::Boolean(v) => Ok(v),
                _ => Err(mismatch(el)),
            })?)
        }
        MappingType::LongIntegerArray => {
            AstarteType::LongIntegerArray(collect_array(&doc, count, |el| match el.data {
                ElementData::Int64(v) => Ok(v),
                ElementData::Int32(v) => Ok(v.into()),
                _ => Err(mismatch(el)),
            })?)
        }
        MappingType::StringArray => {
            AstarteType::StringArray(collect_array(&doc, count, |el| match el.data {
                ElementData::String(v) => Ok(v.to_string()),
                _ => Err(mismatch(el)),
            })?)
        }
        MappingType::BinaryBlobArray => {
            AstarteType::BinaryBlobArray(collect_array(&doc, count, |el| match el.data {
                ElementData::Binary(v) => Ok(v.to_vec()),
                _ => Err(mismatch(el)),
            })?)
        }
        MappingType::DateTimeArray => {
            AstarteType::DateTimeArray(collect_array(&doc, count, |el| match el.data {
                ElementData::DateTime(millis) => timestamp_from_millis(millis),
                _ => Err(mismatch(el)),
            })?)
        }
        _ => return Err(PayloadError::Deserializer("expected an array mapping type")),
    };

    Ok(value)
}

fn deserialize_timestamp(doc: &Document<'_>) -> Result<Option<Timestamp>, PayloadError> {
    let Some(element) = doc.element_lookup("t")? else {
        return Ok(None);
    };

    let ElementData::DateTime(millis) = element.data else {
        return Err(PayloadError::Types {
            expected: MappingType::DateTime,
            found: element.element_type,
        });
    };

    timestamp_from_millis(millis).map(Some)
}

/// Deserializes an individual value of the expected mapping type, with the
/// optional explicit timestamp of the envelope.
pub(crate) fn deserialize_individual(
    expected: MappingType,
    buf: &[u8],
) -> Result<(AstarteType, Option<Timestamp>), PayloadError> {
    let doc = Document::new(buf)?;

    let element = doc
        .element_lookup("v")?
        .ok_or(PayloadError::Deserializer("missing value element"))?;

    let value = value_from_element(&element, expected)?;
    let timestamp = deserialize_timestamp(&doc)?;

    Ok((value, timestamp))
}

/// Deserializes an object aggregate received on the given parent path.
///
/// Every entry of the embedded document is resolved to a mapping of the
/// interface to recover its expected type.
pub(crate) fn deserialize_object(
    interface: &Interface,
    path: &str,
    buf: &[u8],
) -> Result<(Vec<(String, AstarteType)>, Option<Timestamp>), PayloadError> {
    let doc = Document::new(buf)?;

    let element = doc
        .element_lookup("v")?
        .ok_or(PayloadError::Deserializer("missing value element"))?;

    let ElementData::Document(raw) = element.data else {
        return Err(PayloadError::Deserializer(
            "object value is not an embedded document",
        ));
    };

    let inner = Document::new(raw)?;

    let mut entries = Vec::new();
    for entry in inner.iter() {
        let entry = entry?;

        let mapping = interface
            .mapping_from_paths(path, entry.name)
            .ok_or_else(|| PayloadError::ObjectMapping(entry.name.to_string()))?;

        let value = value_from_element(&entry, mapping.mapping_type())?;

        entries.push((entry.name.to_string(), value));
    }

    if entries.is_empty() {
        return Err(PayloadError::EmptyDocument);
    }

    let timestamp = deserialize_timestamp(&doc)?;

    Ok((entries, timestamp))
}
