//! Process-wide record of labels that are currently rate limited.

use crate::backoff::deadline;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// One rate-limit observation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub label: String,
    pub retry_after: Duration,
    pub recorded_at: Instant,
}

impl RateLimitRecord {
    fn wait_until(&self) -> Instant {
        deadline(self.recorded_at, self.retry_after)
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.wait_until().saturating_duration_since(now)
    }
}

/// Advisory ledger of server-imposed waits, keyed by label.
///
/// Shared between every caller in the process so one can cheaply check
/// whether an endpoint is known to be rate limited. Expired records are
/// removed lazily when read. Nothing here blocks a call.
#[derive(Debug, Default)]
pub struct RateLimitLedger {
    limits: Mutex<HashMap<String, RateLimitRecord>>,
}

impl RateLimitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `label` asked us to wait `retry_after`.
    pub fn record(&self, label: &str, retry_after: Duration) {
        self.limits.lock().insert(
            label.to_string(),
            RateLimitRecord {
                label: label.to_string(),
                retry_after,
                recorded_at: Instant::now(),
            },
        );
    }

    pub fn is_rate_limited(&self, label: &str) -> bool {
        !self.remaining_wait(label).is_zero()
    }

    /// Time left before `label` may be called again (zero when not limited).
    pub fn remaining_wait(&self, label: &str) -> Duration {
        let now = Instant::now();
        let mut limits = self.limits.lock();

        let remaining = match limits.get(label) {
            Some(record) => record.remaining(now),
            None => return Duration::ZERO,
        };
        if remaining.is_zero() {
            limits.remove(label);
        }
        remaining
    }

    /// All labels still limited, with their remaining wait.
    pub fn active(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let mut limits = self.limits.lock();
        limits.retain(|_, record| !record.remaining(now).is_zero());

        let mut active: Vec<(String, Duration)> = limits
            .values()
            .map(|record| (record.label.clone(), record.remaining(now)))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    pub fn clear(&self) {
        self.limits.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_record_and_expire() {
        let ledger = RateLimitLedger::new();
        ledger.record("chat.postMessage", Duration::from_secs(10));

        assert!(ledger.is_rate_limited("chat.postMessage"));
        assert!(!ledger.is_rate_limited("conversations.list"));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(ledger.remaining_wait("chat.postMessage"), Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!ledger.is_rate_limited("chat.postMessage"));
        assert!(ledger.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_prunes_expired() {
        let ledger = RateLimitLedger::new();
        ledger.record("a", Duration::from_secs(1));
        ledger.record("b", Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(2)).await;

        let active = ledger.active();
        assert_eq!(active, vec![("b".to_string(), Duration::from_secs(28))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear() {
        let ledger = RateLimitLedger::new();
        ledger.record("a", Duration::from_secs(5));
        ledger.clear();
        assert!(!ledger.is_rate_limited("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_hint_does_not_overflow() {
        let ledger = RateLimitLedger::new();
        let hint = crate::retry::parse_retry_after("18446744073709551615").unwrap();
        ledger.record("files.upload", hint);

        assert!(ledger.is_rate_limited("files.upload"));
        assert!(ledger.remaining_wait("files.upload") > Duration::from_secs(86_400 * 365));
        assert_eq!(ledger.active().len(), 1);
    }
}
