//! Response cache with stale-while-revalidate semantics.
//!
//! Entries move through three windows:
//! - fresh (`now < stale_at`): served as-is
//! - stale (`stale_at <= now < expires_at`): served, refreshed in background
//! - expired: evicted on access, the next caller waits for a fetch
//!
//! Concurrent fetches of one key share a single in-flight request, and every
//! write is broadcast to the key's listeners.
//!
//! # Example
//!
//! ```ignore
//! let cache: ResponseCache<Vec<Channel>> = ResponseCache::default();
//! let _sub = cache.subscribe("channels", |channels| render(channels));
//!
//! let invoker = invoker.clone();
//! let channels = cache
//!     .fetch(
//!         "channels",
//!         move || {
//!             let invoker = invoker.clone();
//!             async move { invoker.invoke("conversations.list", || api.channels()).await }
//!         },
//!         FetchOptions::default(),
//!     )
//!     .await?;
//! ```

mod store;
mod types;

pub use store::ResponseCache;
pub use types::{CacheConfig, CacheEntry, FetchOptions};
