//! Wall-clock timestamps in milliseconds since the Unix epoch.
//!
//! Every persisted record in driftsync (cache entries, queued mutations,
//! conflicts, offline state) stamps time with this type so comparisons never
//! depend on string formats. Remote records may carry their `updatedAt` either
//! as epoch millis or as an RFC 3339 string; [`Timestamp::from_json`] accepts
//! both.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Creates a timestamp from epoch milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the epoch milliseconds.
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns this timestamp shifted forward by `duration` (saturating).
    #[must_use]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Parses an RFC 3339 string such as `2024-05-01T10:00:00Z`.
    pub fn parse_rfc3339(s: &str) -> crate::Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|e| crate::Error::InvalidTimestamp(format!("{s}: {e}")))
    }

    /// Reads a timestamp out of a JSON value: an integer is taken as epoch
    /// millis, a string as RFC 3339. Anything else yields `None`.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Self),
            Value::String(s) => Self::parse_rfc3339(s).ok(),
            _ => None,
        }
    }

    /// Reads the `field` member of a JSON object as a timestamp.
    #[must_use]
    pub fn from_field(record: &Value, field: &str) -> Option<Self> {
        record.get(field).and_then(Self::from_json)
    }

    /// Returns true if this timestamp is strictly after the other.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self > other
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => write!(f, "{}ms", self.0),
        }
    }
}
