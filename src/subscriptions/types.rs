//! Subscription types for listener registries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Configuration for a channel subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered notifications before dropping the subscriber.
    /// Default: 64
    pub buffer_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

/// Callback invoked synchronously with every published value.
pub type Listener<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Messages delivered to channel subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification<V> {
    /// A new value was published.
    Value(V),
    /// Subscription was dropped; no further values follow.
    Dropped { reason: DropReason },
}

/// Why a channel subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

/// Guard for a callback listener. The listener is removed when the guard is
/// dropped or [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    id: SubscriptionId,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, remove: Box<dyn FnOnce() + Send + Sync>) -> Self {
        Self {
            id,
            remove: Some(remove),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the listener registered for the lifetime of its registry.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Handle to a channel subscription.
pub struct SubscriptionHandle<V> {
    pub id: SubscriptionId,
    /// Channel to receive notifications.
    pub receiver: crossbeam_channel::Receiver<Notification<V>>,
}

impl<V> SubscriptionHandle<V> {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<Notification<V>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<Notification<V>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Notification<V>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
