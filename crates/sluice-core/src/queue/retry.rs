//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter, capped at `max_delay`.
///
/// Shared by the task queue (delay before a `Retrying` task becomes eligible)
/// and the advanced batch strategy (sleep between tries of one item).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_delay: Duration,

    /// Upper bound of the uniform jitter added to each delay.
    pub jitter_bound: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_bound: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No jitter; handy where tests need exact timings.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_bound = Duration::ZERO;
        self
    }

    /// Delay without jitter for the given attempt (1-indexed).
    ///
    /// `min(initial * multiplier^(attempts - 1), max_delay)`
    ///
    /// Example with initial=1s, multiplier=2.0, max=30s:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    /// - attempt 6: 30s (capped)
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // inf / NaN fall back to the cap
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Delay before the next try: base delay plus uniform jitter, capped at
    /// `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let jitter = if self.jitter_bound.is_zero() {
            Duration::ZERO
        } else {
            let bound = u64::try_from(self.jitter_bound.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
        };
        (self.base_delay(attempts) + jitter).min(self.max_delay)
    }
}
