//! Wall-clock timestamps used for `capture_time_micros` and the operator
//! latency accumulators, narrowed to microsecond resolution to match the
//! `"YYYY-Mon-DD HH:MM:SS.uuuuuu"` JSON rendering, and built on `std::time`
//! rather than a dedicated clock crate since this crate has no hot-path
//! cycle budget of its own.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time, in microseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize, Display)]
pub struct TimePoint(u64);

impl TimePoint {
    pub const ZERO: Self = Self(0);

    pub fn new(micros_since_epoch: u64) -> Self {
        Self(micros_since_epoch)
    }

    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(d.as_micros() as u64)
    }

    pub fn micros_since_epoch(self) -> u64 {
        self.0
    }

    /// Elapsed duration from `self` to `other`. Saturates to zero if `other`
    /// precedes `self` (clock skew between threads should never be treated
    /// as a negative queueing latency).
    pub fn elapsed_until(self, other: TimePoint) -> Duration {
        if other.0 >= self.0 {
            Duration::from_micros(other.0 - self.0)
        } else {
            Duration::ZERO
        }
    }

    /// Renders the ISO-like `"YYYY-Mon-DD HH:MM:SS.uuuuuu"` format used in
    /// JSON frame output.
    pub fn to_json_string(self) -> String {
        let dt: DateTime<Utc> = DateTime::from_timestamp_micros(self.0 as i64).unwrap_or_default();
        dt.format("%Y-%b-%d %H:%M:%S%.6f").to_string()
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;
    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs.as_micros() as u64)
    }
}

impl Sub for TimePoint {
    type Output = Duration;
    fn sub(self, rhs: TimePoint) -> Duration {
        self.elapsed_until_checked(rhs)
    }
}

impl TimePoint {
    fn elapsed_until_checked(self, earlier: TimePoint) -> Duration {
        if self.0 >= earlier.0 {
            Duration::from_micros(self.0 - earlier.0)
        } else {
            Duration::ZERO
        }
    }
}
