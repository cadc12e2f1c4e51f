//! Version rules: half-open intervals over [`Version`].
//!
//! Three textual forms are understood:
//!
//! | text            | interval                  |
//! |-----------------|---------------------------|
//! | `1.2.3`         | `[1.2.3, 1.2.4)`          |
//! | `1.0.0-2.0.0`   | `[1.0.0, 2.0.0)`          |
//! | `2.0.0+`        | `[2.0.0, ∞)`              |
//!
//! A rule is an immutable value; clones are cheap and safe to share.

use std::fmt;
use std::str::FromStr;

use crate::errors::{RegistryError, RegistryResult};
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionRule {
    lower: Version,
    upper: Option<Version>,
}

impl VersionRule {
    /// Text of the rule that accepts every version.
    pub const ALL: &'static str = "0.0.0+";

    pub fn all() -> Self {
        Self::at_least(Version::ZERO)
    }

    pub fn exact(version: Version) -> Self {
        Self {
            lower: version,
            upper: version.successor(),
        }
    }

    pub fn at_least(version: Version) -> Self {
        Self {
            lower: version,
            upper: None,
        }
    }

    pub fn range(lower: Version, upper: Version) -> RegistryResult<Self> {
        if lower > upper {
            return Err(RegistryError::InvalidVersionRule {
                rule: format!("{lower}-{upper}"),
                reason: "lower bound is greater than upper bound".to_string(),
            });
        }
        Ok(Self {
            lower,
            upper: Some(upper),
        })
    }

    pub fn parse(text: &str) -> RegistryResult<Self> {
        let trimmed = text.trim();
        let invalid = |reason: String| RegistryError::InvalidVersionRule {
            rule: text.to_string(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("empty rule".to_string()));
        }

        if let Some(lower) = trimmed.strip_suffix('+') {
            let lower = Version::parse_numeric(lower).map_err(|e| invalid(e.to_string()))?;
            return Ok(Self::at_least(lower));
        }

        if let Some((lower, upper)) = trimmed.split_once('-') {
            let lower = Version::parse_numeric(lower).map_err(|e| invalid(e.to_string()))?;
            let upper = Version::parse_numeric(upper).map_err(|e| invalid(e.to_string()))?;
            if lower > upper {
                return Err(invalid(format!(
                    "lower bound {lower} is greater than upper bound {upper}"
                )));
            }
            return Ok(Self {
                lower,
                upper: Some(upper),
            });
        }

        let version = Version::parse_numeric(trimmed).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::exact(version))
    }

    pub fn lower_bound(&self) -> Version {
        self.lower
    }

    /// Exclusive upper bound; `None` means unbounded.
    pub fn upper_bound(&self) -> Option<Version> {
        self.upper
    }

    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        self.lower <= *version && self.upper.is_none_or(|upper| *version < upper)
    }

    pub fn is_exact(&self) -> bool {
        self.upper.is_some() && self.upper == self.lower.successor()
    }

    pub fn is_open_ended(&self) -> bool {
        self.upper.is_none()
    }
}

impl fmt::Display for VersionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upper {
            _ if self.is_exact() => write!(f, "{}", self.lower),
            Some(upper) => write!(f, "{}-{}", self.lower, upper),
            None => write!(f, "{}+", self.lower),
        }
    }
}

impl FromStr for VersionRule {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionRule::parse(s)
    }
}
