//! Timestamp conversions for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

#[inline]
pub fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert epoch milliseconds back to a `DateTime<Utc>`.
///
/// Out-of-range values clamp to the representable bounds.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

#[inline]
pub fn opt_to_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_ms)
}

#[inline]
pub fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

/// `dt` truncated to millisecond precision, as it reads back from storage.
pub fn truncate_ms(dt: DateTime<Utc>) -> DateTime<Utc> {
    from_ms(to_ms(dt))
}
