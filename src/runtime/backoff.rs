//! Exponential backoff between retry attempts.

use rand::RngExt;
use std::time::Duration;

/// Computes how long to wait before the next retry.
///
/// Delay sequence with a 100ms base: 100ms, 200ms, 400ms, ... capped at
/// `max_delay`. With `jitter` the delay is drawn uniformly from
/// `[0, computed]` so it never exceeds the deterministic value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay,
            max_retries,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based). `None` means give up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let delay = self.ceiling_for(attempt);
        if self.jitter && !delay.is_zero() {
            let nanos = rand::rng().random_range(0..=delay.as_nanos() as u64);
            return Some(Duration::from_nanos(nanos));
        }
        Some(delay)
    }

    /// The un-jittered delay for `attempt`, clamped to `max_delay`.
    fn ceiling_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
