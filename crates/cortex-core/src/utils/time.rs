//! Time helpers. Timestamps are stored as unix milliseconds.

use chrono::{DateTime, Duration, Utc};

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Timestamp `duration` before now, in milliseconds.
pub fn millis_ago(duration: Duration) -> i64 {
    (Utc::now() - duration).timestamp_millis()
}

/// Convert stored milliseconds back to a UTC datetime. Out-of-range values
/// clamp to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}
