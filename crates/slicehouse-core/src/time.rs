//! UTC Timestamps
//!
//! `UtcTime` is the only timestamp type stored in metadata. It is truncated to
//! millisecond precision and always rendered in the fixed-width form
//! `2006-01-02T15:04:05.000Z`, so timestamps embedded in keys sort
//! lexicographically in creation order.
//!
//! ## Example
//! ```ignore
//! let opened_at = UtcTime::parse("2000-01-01T19:00:00.000Z")?;
//! assert_eq!(opened_at.to_string(), "2000-01-01T19:00:00.000Z");
//! ```

use std::fmt;
use std::ops::Add;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Millisecond precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTime(DateTime<Utc>);

impl UtcTime {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.trunc_subsecs(3))
    }

    pub fn parse(value: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
            .map_err(|e| Error::InvalidTime {
                value: value.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch, used to seed deterministic choices.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    pub fn duration_since(&self, earlier: UtcTime) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or_default()
    }
}

impl Add<Duration> for UtcTime {
    type Output = UtcTime;

    fn add(self, rhs: Duration) -> UtcTime {
        let millis = i64::try_from(rhs.as_millis()).unwrap_or(i64::MAX);
        match TimeDelta::try_milliseconds(millis).and_then(|d| self.0.checked_add_signed(d)) {
            Some(dt) => UtcTime(dt),
            None => UtcTime(DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        UtcTime::parse(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_format() {
        let t = UtcTime::parse("2000-01-01T19:00:00Z").unwrap();
        assert_eq!(t.to_string(), "2000-01-01T19:00:00.000Z");

        let t = UtcTime::parse("2000-01-01T19:00:00.123456+02:00").unwrap();
        assert_eq!(t.to_string(), "2000-01-01T17:00:00.123Z");
    }

    #[test]
    fn test_add_and_duration_since() {
        let t = UtcTime::parse("2000-01-01T19:00:00.000Z").unwrap();
        let later = t + Duration::from_secs(90);
        assert_eq!(later.to_string(), "2000-01-01T19:01:30.000Z");
        assert_eq!(later.duration_since(t), Duration::from_secs(90));
        assert_eq!(t.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn test_serde_as_string() {
        let t = UtcTime::parse("2000-01-01T19:00:00.000Z").unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"2000-01-01T19:00:00.000Z\"");
        let back: UtcTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_invalid_time() {
        assert!(matches!(
            UtcTime::parse("yesterday"),
            Err(Error::InvalidTime { .. })
        ));
    }
}
