//! Exponential backoff with jitter.
//!
//! One formula is shared by the retry invoker and by stream reconnection:
//!
//! ```text
//! delay = min(base_delay * 2^attempt * (1 + random * jitter_ratio), max_delay)
//! ```
//!
//! The cap is applied after jitter, so a capped delay is exactly `max_delay`.

use crate::error::{ResilienceError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Longest span ever added to an `Instant`. Server hints and configured
/// lifetimes beyond it count as forever.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, with `after` capped at [`FAR_FUTURE`] so the addition
/// cannot overflow.
pub(crate) fn deadline(start: Instant, after: Duration) -> Instant {
    start + after.min(FAR_FUTURE)
}

/// Largest exponent used when growing the delay. Anything past this is far
/// beyond any sane `max_delay` anyway.
const MAX_EXPONENT: u32 = 1023;

/// Bounded exponential backoff configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts allowed before giving up.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Fraction of the delay added as random jitter, in `[0, 1)`.
    pub jitter_ratio: f64,
}

/// Policy driving stream reconnection.
pub type ReconnectPolicy = BackoffPolicy;

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::for_reconnect()
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter_ratio: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter_ratio,
        }
    }

    /// Defaults for long-lived stream reconnection: 10 attempts, 1s..30s.
    pub fn for_reconnect() -> Self {
        Self::new(10, Duration::from_secs(1), Duration::from_secs(30), 0.3)
    }

    /// Defaults for outbound remote calls: 4 attempts (3 retries), 1s..30s.
    pub fn for_retry() -> Self {
        Self::new(4, Duration::from_secs(1), Duration::from_secs(30), 0.3)
    }

    /// Same policy without randomization.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(ResilienceError::InvalidPolicy(format!(
                "jitter_ratio must be in [0, 1), got {}",
                self.jitter_ratio
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::InvalidPolicy(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), with random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unit = if self.jitter_ratio > 0.0 {
            rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        self.delay_with(attempt, unit)
    }

    /// Delay for `attempt` with a caller-supplied random sample in `[0, 1)`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay.as_nanos() as f64;
        let raw = base * 2f64.powi(attempt.min(MAX_EXPONENT) as i32);
        let jittered = raw * (1.0 + unit.clamp(0.0, 1.0) * self.jitter_ratio);
        let capped = jittered.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been used.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
