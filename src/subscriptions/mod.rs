//! Listener registries for broadcasting values to consumers.
//!
//! Two delivery styles share one registry:
//! - Callback listeners, invoked synchronously in registration order and
//!   removed when their [`Subscription`] guard is dropped
//! - Bounded channel subscribers, dropped when they fall behind
//!
//! # Example
//!
//! ```ignore
//! let registry: ListenerRegistry<String, u32> = ListenerRegistry::new();
//!
//! let _sub = registry.subscribe("unread".to_string(), |count| {
//!     println!("unread: {count}");
//! });
//! let handle = registry.subscribe_channel("unread".to_string(), SubscriptionConfig::default());
//!
//! registry.emit(&"unread".to_string(), &3);
//! assert!(matches!(handle.recv(), Ok(Notification::Value(3))));
//! ```

mod manager;
mod types;

pub use manager::{ListenerRegistry, ListenerSet};
pub use types::{
    DropReason, Listener, Notification, Subscription, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId,
};
