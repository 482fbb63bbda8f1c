//! Cache configuration and entry types.

use crate::backoff::{deadline, FAR_FUTURE};
use crate::error::{ResilienceError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Per-fetch timing.
///
/// An entry is fresh for `stale_window`, then served stale (and refreshed in
/// the background) until `ttl`, after which it is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Total lifetime of an entry.
    pub ttl: Duration,
    /// How long an entry counts as fresh. Must be shorter than `ttl`.
    pub stale_window: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            stale_window: Duration::from_secs(30),
        }
    }
}

impl FetchOptions {
    pub fn new(ttl: Duration, stale_window: Duration) -> Self {
        Self { ttl, stale_window }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl > FAR_FUTURE {
            return Err(ResilienceError::InvalidOptions(format!(
                "ttl {:?} exceeds the supported maximum {:?}",
                self.ttl, FAR_FUTURE
            )));
        }
        if self.stale_window >= self.ttl {
            return Err(ResilienceError::InvalidOptions(format!(
                "stale_window {:?} must be shorter than ttl {:?}",
                self.stale_window, self.ttl
            )));
        }
        Ok(())
    }
}

/// Cache-wide configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Timing used by `mutate` for keys that were never fetched.
    pub default_options: FetchOptions,

    /// Re-run the last known fetcher right after `invalidate`.
    pub refetch_on_invalidate: bool,
}

/// A cached value with its timing. Handed out by value only.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub created_at: Instant,
    pub stale_at: Instant,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub(crate) fn new(key: &str, value: T, options: FetchOptions, now: Instant) -> Self {
        Self {
            key: key.to_string(),
            value,
            created_at: now,
            stale_at: deadline(now, options.stale_window),
            expires_at: deadline(now, options.ttl),
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.stale_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Past the freshness window but still servable.
    pub fn is_stale(&self, now: Instant) -> bool {
        !self.is_fresh(now) && !self.is_expired(now)
    }
}
