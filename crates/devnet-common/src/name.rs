//! Validated names for clusters, services and engine objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DevnetError, DevnetResult};

/// A validated resource name.
///
/// Names must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
///
/// These are the rules the container engine applies to container and network
/// names, so a cluster name can prefix every child resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
    /// Maximum length of a resource name.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the format is invalid.
    pub fn new(name: impl Into<String>) -> DevnetResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Generate a random cluster name (`devnet-` followed by 12 hex characters).
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(format!("devnet-{}", hex::encode(&uuid.as_bytes()[..6])))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of a child resource namespaced under this one (`<self>-<suffix>`).
    #[must_use]
    pub fn child(&self, suffix: &str) -> String {
        format!("{}-{}", self.0, suffix)
    }

    fn validate(name: &str) -> DevnetResult<()> {
        let invalid = |reason: &str| DevnetError::config(format!("invalid name '{name}': {reason}"));

        let Some(first) = name.chars().next() else {
            return Err(invalid("must not be empty"));
        };
        if name.len() > Self::MAX_LENGTH {
            return Err(invalid("longer than 64 characters"));
        }
        if !first.is_ascii_alphanumeric() {
            return Err(invalid("must start with a letter or digit"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(&format!("unexpected character '{c}'")));
        }

        Ok(())
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceName {
    type Err = DevnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ResourceName {
    type Error = DevnetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceName> for String {
    fn from(name: ResourceName) -> Self {
        name.0
    }
}

impl AsRef<str> for ResourceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
