//! Parsing for Go-style duration strings such as `"1h30m"` or `"500ms"`.
//!
//! Plans carry step timeouts and check intervals in this format, and the
//! engine configuration uses it too.

use crate::errors::{ExecError, Result};
use std::time::Duration;

/// Parses a duration string made of one or more `<number><unit>` segments.
///
/// Accepted units are `ns`, `us`, `µs`, `ms`, `s`, `m` and `h`. Numbers may
/// carry a fractional part (`"1.5h"`). A bare `"0"` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = |reason: &str| ExecError::InvalidDuration {
        value: input.to_string(),
        reason: reason.to_string(),
    };

    if s.is_empty() {
        return Err(invalid("empty duration string"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;

    while !rest.is_empty() {
        let num_end = rest
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map_or(rest.len(), |(i, _)| i);
        if num_end == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| invalid("invalid number"))?;
        rest = &rest[num_end..];

        let unit_end = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map_or(rest.len(), |(i, _)| i);
        let multiplier = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_end..];

        total_nanos += value * multiplier;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Serde adapter storing a [`Duration`] as a duration string.
pub mod serde_duration {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as whole seconds or milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", value.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        }
    }

    /// Deserializes a duration string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
