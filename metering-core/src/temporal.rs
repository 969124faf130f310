//! Timestamps and half-open time windows.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use time::{
    format_description::well_known::Rfc3339, macros::datetime, Duration, OffsetDateTime, UtcOffset,
};

use crate::error::ValidationError;

/// The zero value of a timestamp that was never set. The Unix epoch is a real instant.
const ZERO_INSTANT: OffsetDateTime = datetime!(0001-01-01 00:00:00 UTC);

/// A non-zero instant, always held in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    pub fn new(at: OffsetDateTime) -> Result<Self, ValidationError> {
        Self::named("timestamp", at)
    }

    /// Like [`Timestamp::new`] but reports `field` on failure.
    pub fn named(field: &'static str, at: OffsetDateTime) -> Result<Self, ValidationError> {
        if at == ZERO_INSTANT {
            return Err(ValidationError::ZeroTimestamp(field));
        }
        Ok(Timestamp(at.to_offset(UtcOffset::UTC)))
    }

    pub fn now() -> Self {
        Timestamp(OffsetDateTime::now_utc())
    }

    pub fn parse_rfc3339(input: &str) -> Result<Self, ValidationError> {
        let at = OffsetDateTime::parse(input.trim(), &Rfc3339).map_err(|e| {
            ValidationError::InvalidTimestamp {
                input: input.to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::new(at)
    }

    pub fn as_offset(&self) -> OffsetDateTime {
        self.0
    }

    /// UTC RFC3339 rendering, e.g. `2024-01-01T00:00:00Z`.
    pub fn to_rfc3339(&self) -> String {
        // Years outside 0..=9999 have no RFC3339 form.
        self.0.format(&Rfc3339).unwrap_or_else(|_| format!("{:?}", self.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl std::ops::Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.0 - rhs.0
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        time::serde::rfc3339::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let at = time::serde::rfc3339::deserialize(deserializer)?;
        Timestamp::new(at).map_err(de::Error::custom)
    }
}

/// Half-open interval `[start, end)`. `start == end` denotes an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct TimeWindow {
    start: Timestamp,
    end: Timestamp,
}

#[derive(Deserialize)]
struct RawWindow {
    start: Timestamp,
    end: Timestamp,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = ValidationError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        TimeWindow::new(raw.start, raw.end)
    }
}

impl TimeWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvertedWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn instant(at: Timestamp) -> Self {
        Self { start: at, end: at }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// `start <= at < end`; an instant window contains nothing.
    pub fn contains(&self, at: Timestamp) -> bool {
        self.start <= at && at < self.end
    }

    /// Overlap of `[from, to)` with this window, `None` when it is empty.
    pub fn clamp(&self, from: Timestamp, to: Timestamp) -> Option<TimeWindow> {
        let start = from.max(self.start);
        let end = to.min(self.end);
        (start < end).then_some(TimeWindow { start, end })
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
