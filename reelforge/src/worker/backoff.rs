//! Jittered exponential backoff for retries that consume budget.

use std::time::Duration;

use rand::random;

/// Delay before retry number `retry` (1-based).
///
/// `base * 2^(retry - 1)`, plus up to a quarter of that as jitter, never more
/// than `cap`.
pub fn retry_delay(base: Duration, retry: u32, cap: Duration) -> Duration {
    let exponent = retry.saturating_sub(1).min(20);
    let backoff = base.saturating_mul(1u32 << exponent).min(cap);

    let quarter_ms = u64::try_from(backoff.as_millis() / 4).unwrap_or(u64::MAX);
    let jitter = Duration::from_millis(random::<u64>() % quarter_ms.saturating_add(1));
    backoff.saturating_add(jitter).min(cap)
}
