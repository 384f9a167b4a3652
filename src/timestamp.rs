//! Minute-resolution timestamps and half-open time ranges.
//!
//! Every persisted key and every in-memory series index is a [`MinuteStamp`]:
//! a naive local date-time with seconds and sub-seconds dropped. The persisted
//! text form (`%Y-%m-%d %H:%M`) sorts lexicographically in time order, which
//! is what the range queries rely on.

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use core::fmt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::error::Error;

/// Persisted key format.
pub const KEY_FORMAT: &str = "%Y-%m-%d %H:%M";
/// Format used by the CGM cloud API for sample timestamps.
pub const REMOTE_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";
/// Clock time typed by a user.
pub const CLOCK_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampError {
    pub input: String,
    pub expected: &'static str,
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid timestamp format: {:?} (expected {})", self.input, self.expected)
    }
}

impl Error for TimestampError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MinuteStamp(NaiveDateTime);

impl MinuteStamp {
    /// Truncate any date-time to its minute.
    pub fn truncate(dt: NaiveDateTime) -> Self {
        let dt = dt
            .with_nanosecond(0)
            .and_then(|d| d.with_second(0))
            .unwrap_or(dt);
        MinuteStamp(dt)
    }

    pub fn now() -> Self {
        Self::truncate(chrono::Local::now().naive_local())
    }

    /// Parse a persisted key. Anything after the minute is ignored, so rows
    /// written with a trailing `:SS` still load.
    pub fn parse_key(s: &str) -> Result<Self, TimestampError> {
        let head = s.get(..16).unwrap_or(s);
        NaiveDateTime::parse_from_str(head, KEY_FORMAT)
            .map(Self::truncate)
            .map_err(|_| TimestampError {
                input: s.to_string(),
                expected: KEY_FORMAT,
            })
    }

    /// Parse the remote API sample format, e.g. `3/9/2025 9:30:58 PM`.
    pub fn parse_remote(s: &str) -> Result<Self, TimestampError> {
        NaiveDateTime::parse_from_str(s.trim(), REMOTE_FORMAT)
            .map(Self::truncate)
            .map_err(|_| TimestampError {
                input: s.to_string(),
                expected: REMOTE_FORMAT,
            })
    }

    pub fn to_key(&self) -> String {
        self.0.format(KEY_FORMAT).to_string()
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.0
    }

    pub fn plus_minutes(&self, mins: i64) -> Self {
        MinuteStamp(self.0 + Duration::minutes(mins))
    }

    pub fn minus_minutes(&self, mins: i64) -> Self {
        MinuteStamp(self.0 - Duration::minutes(mins))
    }

    /// The most recent `HH:MM` at or before `self`: today if that time has
    /// already passed, otherwise yesterday.
    pub fn latest_clock_time(&self, hhmm: &str) -> Result<Self, TimestampError> {
        let time = NaiveTime::parse_from_str(hhmm.trim(), CLOCK_FORMAT).map_err(|_| TimestampError {
            input: hhmm.to_string(),
            expected: CLOCK_FORMAT,
        })?;
        let candidate = MinuteStamp(self.0.date().and_time(time));
        if candidate > *self {
            Ok(candidate.minus_minutes(24 * 60))
        } else {
            Ok(candidate)
        }
    }

    /// Whole minutes from `earlier` to `self` (negative if `earlier` is later).
    pub fn minutes_since(&self, earlier: MinuteStamp) -> i64 {
        (self.0 - earlier.0).num_minutes()
    }
}

impl fmt::Display for MinuteStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

impl Serialize for MinuteStamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_key())
    }
}

impl<'de> Deserialize<'de> for MinuteStamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MinuteStamp::parse_key(&s).map_err(serde::de::Error::custom)
    }
}

/// Half-open range `[start, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub start: MinuteStamp,
    pub end: MinuteStamp,
}

impl TimeRange {
    pub fn new(start: MinuteStamp, end: MinuteStamp) -> Self {
        TimeRange { start, end }
    }

    /// The `mins` minutes before `at`, with `at` itself included.
    pub fn ending_at(at: MinuteStamp, mins: i64) -> Self {
        TimeRange {
            start: at.minus_minutes(mins),
            end: at.plus_minutes(1),
        }
    }

    /// `before` minutes ahead of `at` through `after` minutes past it, inclusive.
    pub fn around(at: MinuteStamp, before: i64, after: i64) -> Self {
        TimeRange {
            start: at.minus_minutes(before),
            end: at.plus_minutes(after + 1),
        }
    }

    pub fn contains(&self, ts: MinuteStamp) -> bool {
        ts >= self.start && ts < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 9).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn clock_time_resolves_to_the_most_recent_occurrence() {
        let now = MinuteStamp::truncate(dt(9, 15, 0));
        assert_eq!(now.latest_clock_time("08:30").unwrap().to_key(), "2025-03-09 08:30");
        assert_eq!(now.latest_clock_time("09:15").unwrap(), now);
        assert_eq!(now.latest_clock_time("21:00").unwrap().to_key(), "2025-03-08 21:00");
        assert!(now.latest_clock_time("25:00").is_err());
    }

    #[test]
    fn truncates_to_the_minute() {
        let ts = MinuteStamp::truncate(dt(21, 30, 58));
        assert_eq!(ts.to_key(), "2025-03-09 21:30");
    }

    #[test]
    fn parses_keys_with_trailing_seconds() {
        let ts = MinuteStamp::parse_key("2025-03-09 21:30:58").unwrap();
        assert_eq!(ts, MinuteStamp::truncate(dt(21, 30, 0)));
    }

    #[test]
    fn parses_remote_twelve_hour_format() {
        let ts = MinuteStamp::parse_remote("3/9/2025 9:30:58 PM").unwrap();
        assert_eq!(ts.to_key(), "2025-03-09 21:30");
    }

    #[test]
    fn rejects_garbage() {
        let err = MinuteStamp::parse_key("yesterday-ish").unwrap_err();
        assert_eq!(err.input, "yesterday-ish");
        assert!(MinuteStamp::parse_remote("2025-03-09 21:30").is_err());
    }

    #[test]
    fn key_order_matches_time_order() {
        let a = MinuteStamp::truncate(dt(9, 59, 0));
        let b = MinuteStamp::truncate(dt(10, 0, 0));
        assert!(a < b);
        assert!(a.to_key() < b.to_key());
    }

    #[test]
    fn ending_at_includes_the_terminal_minute() {
        let at = MinuteStamp::truncate(dt(12, 0, 0));
        let range = TimeRange::ending_at(at, 15);
        assert!(range.contains(at));
        assert!(range.contains(at.minus_minutes(15)));
        assert!(!range.contains(at.minus_minutes(16)));
        assert!(!range.contains(at.plus_minutes(1)));
    }
}
