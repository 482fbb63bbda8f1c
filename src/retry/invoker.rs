//! Bounded retry loop for remote operations.

use crate::backoff::BackoffPolicy;
use crate::error::Result;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::ledger::RateLimitLedger;
use super::remote::{FailureClass, RemoteFailure};

/// Result of a single attempt.
enum RetryOutcome<T, E> {
    Success(T),
    RetryableFailure {
        error: E,
        retry_after: Option<Duration>,
    },
    FatalFailure(E),
}

impl<T, E: RemoteFailure> RetryOutcome<T, E> {
    fn from_result(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(value) => RetryOutcome::Success(value),
            Err(error) => match error.classify() {
                FailureClass::Retryable { retry_after } => {
                    RetryOutcome::RetryableFailure { error, retry_after }
                }
                FailureClass::Fatal => RetryOutcome::FatalFailure(error),
            },
        }
    }
}

/// Executes remote operations with bounded retries.
///
/// Retryable failures wait either the server's `retry_after` hint (which is
/// also recorded in the shared [`RateLimitLedger`]) or the policy's
/// exponential backoff. Fatal failures return immediately. When attempts run
/// out the last failure is returned as-is.
#[derive(Clone, Debug)]
pub struct RetryInvoker {
    policy: BackoffPolicy,
    ledger: Arc<RateLimitLedger>,
}

impl RetryInvoker {
    pub fn new(policy: BackoffPolicy, ledger: Arc<RateLimitLedger>) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy, ledger })
    }

    /// Default retry policy with a private ledger.
    pub fn with_defaults() -> Self {
        Self {
            policy: BackoffPolicy::for_retry(),
            ledger: Arc::new(RateLimitLedger::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<RateLimitLedger> {
        &self.ledger
    }

    /// Run `operation` until it succeeds, fails fatally, or exhausts
    /// `max_attempts`.
    pub async fn invoke<T, E, F, Fut>(&self, label: &str, mut operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: RemoteFailure + fmt::Display,
    {
        let wait = self.ledger.remaining_wait(label);
        if !wait.is_zero() {
            debug!(label, remaining_ms = wait.as_millis() as u64, "calling a rate limited label");
        }

        let max_attempts = self.policy.max_attempts;
        let mut attempt: u32 = 0;

        loop {
            match RetryOutcome::from_result(operation().await) {
                RetryOutcome::Success(value) => return Ok(value),
                RetryOutcome::FatalFailure(error) => {
                    debug!(label, attempt, error = %error, "fatal failure, not retrying");
                    return Err(error);
                }
                RetryOutcome::RetryableFailure { error, retry_after } => {
                    if attempt + 1 >= max_attempts {
                        warn!(label, attempts = attempt + 1, error = %error, "retries exhausted");
                        return Err(error);
                    }

                    let delay = match retry_after {
                        Some(wait) => {
                            self.ledger.record(label, wait);
                            warn!(
                                label,
                                attempt = attempt + 1,
                                max_attempts,
                                delay_ms = wait.as_millis() as u64,
                                "rate limited, waiting for server hint"
                            );
                            wait
                        }
                        None => {
                            let delay = self.policy.delay_for(attempt);
                            warn!(
                                label,
                                attempt = attempt + 1,
                                max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "retryable failure, backing off"
                            );
                            delay
                        }
                    };

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
