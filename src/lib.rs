//! # Feed Resilience
//!
//! Fault-tolerance primitives for a client that reads a remote news backend
//! over unreliable links.
//!
//! ## Core Concepts
//!
//! - **Retry**: Bounded retries with exponential backoff, jitter and
//!   server-supplied retry-after hints
//! - **Cache**: Stale-while-revalidate responses with shared in-flight fetches
//! - **Streams**: Change-feed connections that reconnect themselves
//! - **Coordinator**: Several feeds reported as one connection state
//!
//! ## Example
//!
//! ```ignore
//! use feed_resilience::{BackoffPolicy, FetchOptions, RateLimitLedger, ResponseCache, RetryInvoker};
//!
//! let invoker = RetryInvoker::new(BackoffPolicy::for_retry(), Arc::new(RateLimitLedger::new()))?;
//! let cache: ResponseCache<Vec<Article>> = ResponseCache::default();
//!
//! let articles = cache
//!     .fetch("news:latest", move || {
//!         let invoker = invoker.clone();
//!         async move { invoker.invoke("news.latest", || api.latest()).await }
//!     }, FetchOptions::default())
//!     .await?;
//! ```

pub mod backoff;
pub mod cache;
pub mod error;
pub mod retry;
pub mod stream;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use backoff::{BackoffPolicy, ReconnectPolicy};
pub use cache::{CacheConfig, CacheEntry, FetchOptions, ResponseCache};
pub use error::{ResilienceError, Result};
pub use retry::{
    parse_retry_after, FailureClass, RateLimitLedger, RateLimitRecord, RemoteError,
    RemoteErrorKind, RemoteFailure, RetryInvoker,
};
pub use stream::{
    ChangeFeed, ChangeFeedTransport, DualChannelCoordinator, FeedStatus, PushStream, SignalSink,
    StreamConnection, StreamHandle, StreamTransport, Transport, TransportGuard,
};
pub use subscriptions::{
    DropReason, ListenerRegistry, ListenerSet, Notification, Subscription, SubscriptionConfig,
    SubscriptionHandle, SubscriptionId,
};
pub use types::*;
