//! Retrying outbound remote calls.
//!
//! - [`RetryInvoker`] runs one operation with bounded retries
//! - [`RemoteFailure`] decides fatal vs retryable per failure
//! - [`RateLimitLedger`] remembers server-imposed waits per label
//!
//! # Example
//!
//! ```ignore
//! let ledger = Arc::new(RateLimitLedger::new());
//! let invoker = RetryInvoker::new(BackoffPolicy::for_retry(), Arc::clone(&ledger))?;
//!
//! let channels = invoker
//!     .invoke("conversations.list", || client.list_channels())
//!     .await?;
//!
//! if ledger.is_rate_limited("conversations.list") {
//!     // serve cached data instead
//! }
//! ```

mod invoker;
mod ledger;
mod remote;

pub use invoker::RetryInvoker;
pub use ledger::{RateLimitLedger, RateLimitRecord};
pub use remote::{parse_retry_after, FailureClass, RemoteError, RemoteErrorKind, RemoteFailure};
