//! Backoff policy: how long a deferred message stays invisible.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest visibility timeout SQS accepts (12 hours).
pub const MAX_VISIBILITY_SECS: u64 = 43_200;

/// Exponential backoff for retryable failures.
///
/// delay = base * 2^(receive_count - 1), capped at `cap`.
///
/// Example with base=1s, cap=60s:
/// - receive_count 1: 1s
/// - receive_count 2: 2s
/// - receive_count 3: 4s
/// - receive_count 7: 60s (64s capped)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay after the delivery with the given receive count failed.
    ///
    /// `receive_count` is 1-indexed; 0 is treated as 1.
    pub fn next_delay(&self, receive_count: u32) -> Duration {
        let exponent = receive_count.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// `next_delay` rounded up to whole seconds and clamped to what
    /// `ChangeMessageVisibility` accepts.
    pub fn as_visibility_seconds(&self, receive_count: u32) -> u32 {
        let delay = self.next_delay(receive_count);
        let mut secs = delay.as_secs();
        if delay.subsec_nanos() > 0 {
            secs += 1;
        }
        secs.min(MAX_VISIBILITY_SECS) as u32
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}
