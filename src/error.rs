//! Error types for the resilience layer.

use crate::retry::{FailureClass, RemoteError, RemoteFailure};
use std::time::Duration;
use thiserror::Error;

/// Main error type for resilience operations.
///
/// `Clone` so a single deduplicated fetch result can be handed to every
/// caller awaiting the same cache key.
#[derive(Clone, Debug, Error)]
pub enum ResilienceError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid fetch options: {0}")]
    InvalidOptions(String),
}

impl From<serde_json::Error> for ResilienceError {
    fn from(e: serde_json::Error) -> Self {
        ResilienceError::Protocol(e.to_string())
    }
}

impl RemoteFailure for ResilienceError {
    fn classify(&self) -> FailureClass {
        match self {
            ResilienceError::Transport(_) => FailureClass::Retryable { retry_after: None },
            ResilienceError::RateLimited { retry_after } => FailureClass::Retryable {
                retry_after: Some(*retry_after),
            },
            ResilienceError::Remote(remote) => remote.classify(),
            _ => FailureClass::Fatal,
        }
    }
}

/// Result type for resilience operations.
pub type Result<T> = std::result::Result<T, ResilienceError>;
