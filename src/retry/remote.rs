//! Classification of remote call failures.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed attempt may be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying could plausibly succeed. `retry_after` is a server-supplied
    /// wait that overrides the backoff schedule.
    Retryable { retry_after: Option<Duration> },
    /// Retrying is pointless (auth, validation, other client errors).
    Fatal,
}

/// A failure produced by a remote callable.
pub trait RemoteFailure {
    fn classify(&self) -> FailureClass;

    fn is_retryable(&self) -> bool {
        matches!(self.classify(), FailureClass::Retryable { .. })
    }
}

/// What went wrong with a remote call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The remote answered with an HTTP-like status code.
    Status(u16),
    /// A platform-level rate limit signal outside of HTTP 429.
    RateLimited,
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    DnsFailure,
    BrokenPipe,
    HostUnreachable,
    Other,
}

impl RemoteErrorKind {
    /// Connection-level failures worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::ConnectionReset
                | RemoteErrorKind::ConnectionRefused
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::DnsFailure
                | RemoteErrorKind::BrokenPipe
                | RemoteErrorKind::HostUnreachable
        )
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::Status(code) => write!(f, "status {}", code),
            RemoteErrorKind::RateLimited => f.write_str("rate limited"),
            RemoteErrorKind::ConnectionReset => f.write_str("connection reset"),
            RemoteErrorKind::ConnectionRefused => f.write_str("connection refused"),
            RemoteErrorKind::Timeout => f.write_str("timed out"),
            RemoteErrorKind::DnsFailure => f.write_str("dns failure"),
            RemoteErrorKind::BrokenPipe => f.write_str("broken pipe"),
            RemoteErrorKind::HostUnreachable => f.write_str("host unreachable"),
            RemoteErrorKind::Other => f.write_str("remote error"),
        }
    }
}

/// Structured remote failure.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// Server-supplied wait before the next attempt.
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Status(code), message)
    }

    /// HTTP 429 carrying a wait hint in whole seconds.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::status(429, "too many requests")
            .with_retry_after(Duration::from_secs(retry_after_secs))
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    /// Attach a `Retry-After` header value. Unparseable values are ignored.
    pub fn with_retry_after_header(mut self, header: &str) -> Self {
        if let Some(wait) = parse_retry_after(header) {
            self.retry_after = Some(wait);
        }
        self
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            RemoteErrorKind::Status(code) => Some(code),
            _ => None,
        }
    }
}

impl RemoteFailure for RemoteError {
    fn classify(&self) -> FailureClass {
        let retryable = match self.kind {
            RemoteErrorKind::Status(429) => true,
            RemoteErrorKind::Status(code) => (500..600).contains(&code),
            RemoteErrorKind::RateLimited => true,
            kind => kind.is_transient(),
        };

        if retryable {
            FailureClass::Retryable {
                retry_after: self.retry_after,
            }
        } else {
            FailureClass::Fatal
        }
    }
}

impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                RemoteErrorKind::ConnectionReset
            }
            io::ErrorKind::ConnectionRefused => RemoteErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => RemoteErrorKind::Timeout,
            io::ErrorKind::BrokenPipe => RemoteErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable => {
                RemoteErrorKind::HostUnreachable
            }
            _ => RemoteErrorKind::Other,
        };
        RemoteError::new(kind, e.to_string())
    }
}

/// Parse a `Retry-After` value given in whole seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
