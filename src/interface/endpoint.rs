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

//! Endpoint templates of a mapping and their matching against concrete paths.
//!
//! An endpoint is a `/`-separated template where each level is either a
//! literal or a parameter in the form `%{name}`. A parameter level matches a
//! single path level made of `[a-zA-Z_][a-zA-Z0-9_]*`.

use std::fmt::{self, Display};
use std::str::FromStr;

/// Error while parsing an endpoint template.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The endpoint is empty.
    #[error("endpoint is empty")]
    Empty,
    /// The endpoint doesn't start with a slash.
    #[error("endpoint must start with a slash: '{0}'")]
    Prefix(String),
    /// The endpoint contains an empty level.
    #[error("endpoint has an empty level: '{0}'")]
    EmptyLevel(String),
    /// A parameter must span the whole level.
    #[error("parameter must span the whole level in '{0}'")]
    Parameter(String),
    /// A parameter name must be `[a-zA-Z_][a-zA-Z0-9_]*`.
    #[error("invalid parameter name '{name}' in '{endpoint}'")]
    ParameterName {
        /// Parameter name that failed validation.
        name: String,
        /// Endpoint the parameter belongs to.
        endpoint: String,
    },
}

/// A single level of an endpoint template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Level {
    Literal(String),
    Parameter(String),
}

impl Level {
    fn matches(&self, level: &str) -> bool {
        match self {
            Level::Literal(literal) => literal == level,
            Level::Parameter(_) => is_valid_ident(level),
        }
    }
}

/// Returns true for a non-empty `[a-zA-Z_][a-zA-Z0-9_]*` identifier.
fn is_valid_ident(level: &str) -> bool {
    let mut chars = level.chars();

    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parsed endpoint of a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: String,
    levels: Vec<Level>,
}

impl Endpoint {
    /// Original template string.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Number of levels in the template.
    pub(crate) fn len(&self) -> usize {
        self.levels.len()
    }

    /// Iterates over the levels of the template.
    pub(crate) fn levels(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter()
    }

    /// Whether the endpoint contains at least one parameter level.
    pub fn is_parametric(&self) -> bool {
        self.levels
            .iter()
            .any(|level| matches!(level, Level::Parameter(_)))
    }

    /// Anchored match of a concrete path against the template.
    ///
    /// The path must have the same number of levels, with every literal equal
    /// and every parameter a valid identifier.
    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };

        let mut levels = rest.split('/');
        let matched = self
            .levels
            .iter()
            .all(|level| levels.next().is_some_and(|l| level.matches(l)));

        matched && levels.next().is_none()
    }

    /// Compares every level but the last with the other endpoint.
    ///
    /// Object aggregates require all mappings to share the parent path.
    pub(crate) fn same_parent(&self, other: &Endpoint) -> bool {
        self.levels.len() == other.levels.len()
            && self.levels[..self.levels.len() - 1] == other.levels[..other.levels.len() - 1]
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }

        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| EndpointError::Prefix(s.to_string()))?;

        let levels = rest
            .split('/')
            .map(|level| parse_level(level, s))
            .collect::<Result<Vec<Level>, EndpointError>>()?;

        Ok(Endpoint {
            path: s.to_string(),
            levels,
        })
    }
}

fn parse_level(level: &str, endpoint: &str) -> Result<Level, EndpointError> {
    if level.is_empty() {
        return Err(EndpointError::EmptyLevel(endpoint.to_string()));
    }

    if let Some(param) = level.strip_prefix("%{") {
        let name = param
            .strip_suffix('}')
            .ok_or_else(|| EndpointError::Parameter(endpoint.to_string()))?;

        if !is_valid_ident(name) {
            return Err(EndpointError::ParameterName {
                name: name.to_string(),
                endpoint: endpoint.to_string(),
            });
        }

        return Ok(Level::Parameter(name.to_string()));
    }

    // A parameter sequence in the middle of a level is not allowed.
    if level.contains("%{") || level.contains('}') {
        return Err(EndpointError::Parameter(endpoint.to_string()));
    }

    Ok(Level::Literal(level.to_string()))
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_literal_endpoint() {
        let endpoint: Endpoint = "/boot/count".parse().unwrap();

        assert_eq!(endpoint.as_str(), "/boot/count");
        assert_eq!(endpoint.len(), 2);
        assert!(!endpoint.is_parametric());
    }

    #[test]
    fn parse_parametric_endpoint() {
        let endpoint: Endpoint = "/%{sensor_id}/value".parse().unwrap();

        assert!(endpoint.is_parametric());
        assert_eq!(
            endpoint.levels,
            [
                Level::Parameter("sensor_id".to_string()),
                Level::Literal("value".to_string())
            ]
        );
    }

    #[test]
    fn parse_invalid_endpoints() {
        assert_eq!("".parse::<Endpoint>(), Err(EndpointError::Empty));
        assert_eq!(
            "no/slash".parse::<Endpoint>(),
            Err(EndpointError::Prefix("no/slash".to_string()))
        );
        assert_eq!(
            "/a//b".parse::<Endpoint>(),
            Err(EndpointError::EmptyLevel("/a//b".to_string()))
        );
        assert_eq!(
            "/a/%{open".parse::<Endpoint>(),
            Err(EndpointError::Parameter("/a/%{open".to_string()))
        );
        assert_eq!(
            "/a/pre%{x}".parse::<Endpoint>(),
            Err(EndpointError::Parameter("/a/pre%{x}".to_string()))
        );
        assert_eq!(
            "/a/%{1bad}".parse::<Endpoint>(),
            Err(EndpointError::ParameterName {
                name: "1bad".to_string(),
                endpoint: "/a/%{1bad}".to_string()
            })
        );
    }

    #[test]
    fn match_literal_path() {
        let endpoint: Endpoint = "/boot/count".parse().unwrap();

        assert!(endpoint.matches("/boot/count"));
        assert!(!endpoint.matches("/boot"));
        assert!(!endpoint.matches("/boot/count/extra"));
        assert!(!endpoint.matches("boot/count"));
    }

    #[test]
    fn match_parametric_path() {
        let endpoint: Endpoint = "/%{sensor_id}/value".parse().unwrap();

        assert!(endpoint.matches("/sensor_1/value"));
        assert!(endpoint.matches("/_hidden/value"));
        assert!(!endpoint.matches("/1sensor/value"));
        assert!(!endpoint.matches("/sensor-1/value"));
        assert!(!endpoint.matches("//value"));
    }

    #[test]
    fn object_parent_comparison() {
        let first: Endpoint = "/%{id}/x".parse().unwrap();
        let second: Endpoint = "/%{id}/y".parse().unwrap();
        let third: Endpoint = "/other/x".parse().unwrap();

        assert!(first.same_parent(&second));
        assert!(!first.same_parent(&third));
    }
}
