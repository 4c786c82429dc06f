//! Timestamp codec
//!
//! Parses client-supplied instants (sync cursors and write preconditions).
//! Only fully-qualified RFC 3339 instants with an explicit offset are
//! accepted; anything that could be read as a local time is rejected.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;

/// Reasons a client timestamp is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimestampError {
    /// Not an offset-qualified ISO-8601 instant
    #[error("invalid timestamp format, expected ISO-8601 with offset (e.g. 2024-01-20T10:00:00Z)")]
    InvalidTimestamp,

    /// Later than the server clock at validation time
    #[error("timestamp is ahead of the server clock")]
    FutureTimestamp,
}

/// Parse and validate a client instant against the server's `now`.
///
/// Server instants carry microsecond precision, so the parsed value is
/// truncated to microseconds before any comparison.
pub fn parse(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimestampError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TimestampError::InvalidTimestamp);
    }

    let instant = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| TimestampError::InvalidTimestamp)?
        .with_timezone(&Utc)
        .trunc_subsecs(6);

    if instant > now {
        return Err(TimestampError::FutureTimestamp);
    }

    Ok(instant)
}

/// Canonical wire form: UTC, microseconds, `Z` suffix.
///
/// Fixed width, so lexical order matches chronological order.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Read back an instant written by [`format_instant`]
pub fn decode_stored(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

/// Serde adapter that writes instants in canonical wire form
pub mod serde_instant {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(instant: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_instant(*instant))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::decode_stored(&raw).map_err(D::Error::custom)
    }

    /// Same as the parent module, for nullable instants
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            instant: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match instant {
                Some(instant) => serializer.serialize_str(&super::super::format_instant(*instant)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::super::decode_stored(&raw).map_err(D::Error::custom))
                .transpose()
        }
    }
}
