//! Bounded exponential backoff with jitter.
//!
//! Used for bulk chunk retries and subscription reconnects. Each delay is
//! drawn from `[exp/2, exp]` where `exp = base * 2^attempt`, then clamped so
//! the sequence never decreases and never exceeds `max`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    last: Duration,
    jitter: bool,
}

impl Backoff {
    /// Create a jittered backoff starting at `base` and capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
            last: Duration::ZERO,
            jitter: true,
        }
    }

    /// Disable jitter; delays become exactly `base * 2^attempt` (capped).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.exponential(self.attempt);
        let candidate = if self.jitter && !exp.is_zero() {
            let half = exp / 2;
            let spread = (exp - half).as_nanos().min(u64::MAX as u128) as u64;
            half + Duration::from_nanos(rand::thread_rng().gen_range(0..=spread))
        } else {
            exp
        };

        let delay = candidate.max(self.last).min(self.max);
        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over from `base` after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
