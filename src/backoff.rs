//! Backoff policy for redelivery delays.
//!
//! The delay before the next redelivery grows geometrically with the number of attempts
//! already made: `next_delay(n) = base × factor^n`. Retry count `0` (a message that has
//! never been redelivered) waits exactly `base`. No jitter is applied, so the same inputs
//! always produce the same delay.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use redeliver::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::new(Duration::from_millis(100), 3);
//! assert_eq!(backoff.next_delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(1), Duration::from_millis(300));
//! assert_eq!(backoff.next_delay(2), Duration::from_millis(900));
//! ```
//!
//! Overflow behavior: products that do not fit in a `Duration` saturate to `Duration::MAX`,
//! so they always compare as exceeding any configured maximum delay.

use std::fmt;
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Trait implemented by delay policies the ingest side can consult.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn next_delay(&self, retry_count: u32) -> Duration;
}

/// Geometric backoff: `base × factor^retry_count`, computed in integer nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    factor: u64,
}

impl BackoffPolicy {
    /// Create a policy. Any base and factor are accepted; a factor of `0` releases
    /// already-retried messages immediately, a factor of `1` keeps the delay constant.
    pub fn new(base: Duration, factor: u64) -> Self {
        Self { base, factor }
    }

    /// Constant delay regardless of retry count.
    pub fn constant(delay: Duration) -> Self {
        Self::new(delay, 1)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn factor(&self) -> u64 {
        self.factor
    }

    /// Delay to apply to a message that has already been redelivered `retry_count` times.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let Some(multiplier) = u128::from(self.factor).checked_pow(retry_count) else {
            return Duration::MAX;
        };
        match self.base.as_nanos().checked_mul(multiplier) {
            Some(nanos) => saturating_from_nanos(nanos),
            None => Duration::MAX,
        }
    }
}

impl BackoffStrategy for BackoffPolicy {
    fn next_delay(&self, retry_count: u32) -> Duration {
        BackoffPolicy::next_delay(self, retry_count)
    }
}

fn saturating_from_nanos(nanos: u128) -> Duration {
    match u64::try_from(nanos / NANOS_PER_SEC) {
        // remainder is < 1e9 so it always fits in u32
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}
