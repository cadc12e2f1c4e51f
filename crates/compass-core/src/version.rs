//! Three-component numeric versions.
//!
//! `"1"`, `"1.2"` and `"1.2.3"` are all accepted; missing components are zero.
//! A pre-release or build qualifier (`1.2.3-rc.1`, `1.2.3+abc`) is dropped by
//! [`Version::parse`], so two versions that differ only in qualifiers compare
//! equal. Version rules never carry qualifiers and use [`Version::parse_numeric`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const ZERO: Version = Version::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a published version, ignoring any pre-release/build qualifier.
    pub fn parse(text: &str) -> RegistryResult<Self> {
        let trimmed = text.trim();
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        Self::parse_components(core, text)
    }

    /// Parse a purely numeric version (no qualifiers allowed).
    pub fn parse_numeric(text: &str) -> RegistryResult<Self> {
        Self::parse_components(text.trim(), text)
    }

    fn parse_components(core: &str, original: &str) -> RegistryResult<Self> {
        if core.is_empty() {
            return Err(invalid(original, "empty version"));
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for part in core.split('.') {
            if count == parts.len() {
                return Err(invalid(original, "more than three components"));
            }
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid(original, &format!("component \"{part}\" is not a number")));
            }
            parts[count] = part
                .parse()
                .map_err(|_| invalid(original, &format!("component \"{part}\" is out of range")))?;
            count += 1;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }

    /// The smallest version strictly greater than `self`, if one exists.
    pub fn successor(&self) -> Option<Version> {
        if self.patch < u32::MAX {
            Some(Version::new(self.major, self.minor, self.patch + 1))
        } else if self.minor < u32::MAX {
            Some(Version::new(self.major, self.minor + 1, 0))
        } else if self.major < u32::MAX {
            Some(Version::new(self.major + 1, 0, 0))
        } else {
            None
        }
    }
}

fn invalid(version: &str, reason: &str) -> RegistryError {
    RegistryError::InvalidVersion {
        version: version.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}
