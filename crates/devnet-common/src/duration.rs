//! Human-readable durations for configuration files.
//!
//! Supported formats:
//! - "250ms" (milliseconds)
//! - "30s" (seconds), "2m" (minutes), "1h" (hours)
//! - "30" (plain number, seconds)

use std::time::Duration;

use crate::error::{DevnetError, DevnetResult};

/// Parse a duration string.
pub fn parse_duration(s: &str) -> DevnetResult<Duration> {
    let s = s.trim();
    let invalid = || DevnetError::config(format!("invalid duration '{s}', use e.g. '250ms', '30s', '2m'"));

    // Order matters: "ms" must be tried before "m" and "s"
    let units: [(&str, u64); 4] = [("ms", 1), ("s", 1000), ("m", 60_000), ("h", 3_600_000)];

    for (suffix, millis_per_unit) in units {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.trim().parse().map_err(|_| invalid())?;
            let millis = value.checked_mul(millis_per_unit).ok_or_else(invalid)?;
            return Ok(Duration::from_millis(millis));
        }
    }

    let secs: u64 = s.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(secs))
}

/// Format a duration with the largest unit that represents it exactly.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

/// Serde adapter: `#[serde(with = "devnet_common::duration::humanized")]`.
pub mod humanized {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as a human-readable string.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    /// Deserialize a duration from a human-readable string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional durations.
pub mod humanized_option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize an optional duration as a human-readable string.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&super::format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional duration from a human-readable string.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| super::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
