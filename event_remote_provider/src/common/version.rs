// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Semantic protocol version carried on every control message.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error when parsing a protocol version string
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VersionParseError {
    /// The version string is not of the form `major.minor.patch`
    #[error("version must be of the form major.minor.patch: {0}")]
    Malformed(String),
}

/// Semantic version of the wire protocol, e.g. `"1.0.0"`.
///
/// Two versions are compatible when their major components are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major component; incompatible changes
    pub major: u16,
    /// Minor component; backwards-compatible additions
    pub minor: u16,
    /// Patch component
    pub patch: u16,
}

impl ProtocolVersion {
    /// Returns true if a message carrying `other` can be processed by a
    /// peer speaking `self`.
    #[must_use]
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = s.split('.');
        let mut next = || {
            components
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| VersionParseError::Malformed(s.to_string()))
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if components.next().is_some() {
            return Err(VersionParseError::Malformed(s.to_string()));
        }
        Ok(ProtocolVersion {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
