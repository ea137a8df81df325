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

//! Value types supported by the Astarte data model.

use chrono::{DateTime, Utc};

use crate::interface::MappingType;

/// Errors when converting between Rust types and [`AstarteType`].
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// The value cannot be converted into the requested type.
    #[error("conversion error from {ty} to the requested type")]
    Conversion {
        /// Type of the value being converted.
        ty: &'static str,
    },
    /// A double was NaN or infinite.
    #[error("float value is not a number")]
    Float,
}

/// Data for an [Astarte data type](https://docs.astarte-platform.org/latest/080-mqtt-v1-protocol.html#astarte-data-types-to-bson-types).
///
/// Variants mirror the mapping types an interface can declare, plus [`Unset`]
/// which models the zero-length payload used to clear a property.
///
/// [`Unset`]: AstarteType::Unset
#[derive(Debug, Clone, PartialEq)]
pub enum AstarteType {
    /// A double value, which is never NaN or infinite once validated.
    Double(f64),
    /// A 32 bit signed integer.
    Integer(i32),
    /// A boolean.
    Boolean(bool),
    /// A 64 bit signed integer.
    LongInteger(i64),
    /// An UTF-8 string.
    String(String),
    /// An arbitrary sequence of bytes.
    BinaryBlob(Vec<u8>),
    /// A timestamp with millisecond precision.
    DateTime(DateTime<Utc>),
    /// An array of doubles.
    DoubleArray(Vec<f64>),
    /// An array of 32 bit signed integers.
    IntegerArray(Vec<i32>),
    /// An array of booleans.
    BooleanArray(Vec<bool>),
    /// An array of 64 bit signed integers.
    LongIntegerArray(Vec<i64>),
    /// An array of UTF-8 strings.
    StringArray(Vec<String>),
    /// An array of byte sequences.
    BinaryBlobArray(Vec<Vec<u8>>),
    /// An array of timestamps.
    DateTimeArray(Vec<DateTime<Utc>>),
    /// Marker for a property that is being unset.
    Unset,
}

impl AstarteType {
    /// Returns the mapping type the value conforms to, or [`None`] for
    /// [`AstarteType::Unset`].
    pub fn tag(&self) -> Option<MappingType> {
        let tag = match self {
            AstarteType::Double(_) => MappingType::Double,
            AstarteType::Integer(_) => MappingType::Integer,
            AstarteType::Boolean(_) => MappingType::Boolean,
            AstarteType::LongInteger(_) => MappingType::LongInteger,
            AstarteType::String(_) => MappingType::String,
            AstarteType::BinaryBlob(_) => MappingType::BinaryBlob,
            AstarteType::DateTime(_) => MappingType::DateTime,
            AstarteType::DoubleArray(_) => MappingType::DoubleArray,
            AstarteType::IntegerArray(_) => MappingType::IntegerArray,
            AstarteType::BooleanArray(_) => MappingType::BooleanArray,
            AstarteType::LongIntegerArray(_) => MappingType::LongIntegerArray,
            AstarteType::StringArray(_) => MappingType::StringArray,
            AstarteType::BinaryBlobArray(_) => MappingType::BinaryBlobArray,
            AstarteType::DateTimeArray(_) => MappingType::DateTimeArray,
            AstarteType::Unset => return None,
        };

        Some(tag)
    }

    /// Name of the type, used in logs and error messages.
    pub fn display_type(&self) -> &'static str {
        match self {
            AstarteType::Double(_) => "double",
            AstarteType::Integer(_) => "integer",
            AstarteType::Boolean(_) => "boolean",
            AstarteType::LongInteger(_) => "long integer",
            AstarteType::String(_) => "string",
            AstarteType::BinaryBlob(_) => "binary blob",
            AstarteType::DateTime(_) => "datetime",
            AstarteType::DoubleArray(_) => "double array",
            AstarteType::IntegerArray(_) => "integer array",
            AstarteType::BooleanArray(_) => "boolean array",
            AstarteType::LongIntegerArray(_) => "long integer array",
            AstarteType::StringArray(_) => "string array",
            AstarteType::BinaryBlobArray(_) => "binary blob array",
            AstarteType::DateTimeArray(_) => "datetime array",
            AstarteType::Unset => "unset",
        }
    }

    /// Checks that every double in the value is a finite number.
    ///
    /// Values containing NaN or infinities are rejected by validation before
    /// they reach the wire.
    pub(crate) fn validate_floats(&self) -> Result<(), TypeError> {
        match self {
            AstarteType::Double(d) => d.is_finite().then_some(()).ok_or(TypeError::Float),
            AstarteType::DoubleArray(arr) => arr
                .iter()
                .all(|d| d.is_finite())
                .then_some(())
                .ok_or(TypeError::Float),
            _ => Ok(()),
        }
    }
}

impl PartialEq<MappingType> for AstarteType {
    fn eq(&self, other: &MappingType) -> bool {
        self.tag() == Some(*other)
    }
}

/// Implements the conversions between a rust type and the corresponding
/// [`AstarteType`] variant, in both directions.
macro_rules! impl_type_conversion_traits {
    ($(($ty:ty, $variant:ident),)*) => {
        $(
            impl From<$ty> for AstarteType {
                fn from(value: $ty) -> Self {
                    AstarteType::$variant(value)
                }
            }

            impl TryFrom<AstarteType> for $ty {
                type Error = TypeError;

                fn try_from(value: AstarteType) -> Result<Self, Self::Error> {
                    match value {
                        AstarteType::$variant(value) => Ok(value),
                        other => Err(TypeError::Conversion {
                            ty: other.display_type(),
                        }),
                    }
                }
            }
        )*
    };
}

impl_type_conversion_traits!(
    (f64, Double),
    (i32, Integer),
    (bool, Boolean),
    (i64, LongInteger),
    (String, String),
    (Vec<u8>, BinaryBlob),
    (DateTime<Utc>, DateTime),
    (Vec<f64>, DoubleArray),
    (Vec<i32>, IntegerArray),
    (Vec<bool>, BooleanArray),
    (Vec<i64>, LongIntegerArray),
    (Vec<String>, StringArray),
    (Vec<Vec<u8>>, BinaryBlobArray),
    (Vec<DateTime<Utc>>, DateTimeArray),
);

impl From<&str> for AstarteType {
    fn from(value: &str) -> Self {
        AstarteType::String(value.to_string())
    }
}

impl From<&[u8]> for AstarteType {
    fn from(value: &[u8]) -> Self {
        AstarteType::BinaryBlob(value.to_vec())
    }
}
