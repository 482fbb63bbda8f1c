//! Listener registry for broadcasting values to interested consumers.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

use super::types::{
    DropReason, Listener, Notification, Subscription, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId,
};

/// Internal channel subscription state.
struct ChannelSubscriber<V> {
    id: SubscriptionId,
    sender: Sender<Notification<V>>,
}

impl<V> ChannelSubscriber<V> {
    /// Try to send a notification. Returns false if the buffer is full or the
    /// receiver is gone (subscriber will be dropped).
    fn try_send(&self, notification: Notification<V>) -> bool {
        self.sender.try_send(notification).is_ok()
    }
}

struct Registry<K, V> {
    /// Callback listeners by key, in registration order.
    listeners: RwLock<HashMap<K, Vec<(SubscriptionId, Listener<V>)>>>,
    /// Channel subscribers by key.
    channels: RwLock<HashMap<K, Vec<ChannelSubscriber<V>>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl<K: Eq + Hash, V> Registry<K, V> {
    fn remove_listener(&self, key: &K, id: SubscriptionId) {
        let mut listeners = self.listeners.write();
        if let Some(list) = listeners.get_mut(key) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                listeners.remove(key);
            }
        }
    }
}

/// Keyed registry of listeners.
///
/// Callback listeners are invoked synchronously, outside of any lock, in
/// registration order. A panicking listener is logged and skipped; it does
/// not prevent delivery to the others. Channel subscribers get a bounded
/// buffer and are dropped when it overflows.
pub struct ListenerRegistry<K, V> {
    inner: Arc<Registry<K, V>>,
}

impl<K, V> Clone for ListenerRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> ListenerRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                listeners: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a callback listener for `key`.
    pub fn subscribe<F>(&self, key: K, listener: F) -> Subscription
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let listener: Listener<V> = Arc::new(listener);
        self.inner
            .listeners
            .write()
            .entry(key.clone())
            .or_default()
            .push((id, listener));

        let weak: Weak<Registry<K, V>> = Arc::downgrade(&self.inner);
        Subscription::new(
            id,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_listener(&key, id);
                }
            }),
        )
    }

    /// Register a bounded channel subscriber for `key`.
    pub fn subscribe_channel(&self, key: K, config: SubscriptionConfig) -> SubscriptionHandle<V> {
        let id = self.next_id();
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.inner
            .channels
            .write()
            .entry(key)
            .or_default()
            .push(ChannelSubscriber { id, sender });

        SubscriptionHandle { id, receiver }
    }

    /// Remove a channel subscriber.
    pub fn unsubscribe_channel(&self, key: &K, id: SubscriptionId) {
        let mut channels = self.inner.channels.write();
        if let Some(list) = channels.get_mut(key) {
            if let Some(pos) = list.iter().position(|sub| sub.id == id) {
                let sub = list.remove(pos);
                // Best effort
                let _ = sub.sender.try_send(Notification::Dropped {
                    reason: DropReason::Unsubscribed,
                });
            }
            if list.is_empty() {
                channels.remove(key);
            }
        }
    }

    /// Number of callback listeners plus channel subscribers for `key`.
    pub fn subscription_count(&self, key: &K) -> usize {
        let listeners = self.inner.listeners.read().get(key).map_or(0, Vec::len);
        let channels = self.inner.channels.read().get(key).map_or(0, Vec::len);
        listeners + channels
    }

    /// Publish `value` to everything registered under `key`.
    pub fn emit(&self, key: &K, value: &V) {
        let listeners: Vec<Listener<V>> = self
            .inner
            .listeners
            .read()
            .get(key)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                warn!("listener panicked; continuing with remaining listeners");
            }
        }

        self.broadcast(key, value);
    }

    /// Channel broadcast. Drops subscribers that fail to receive.
    fn broadcast(&self, key: &K, value: &V) {
        let mut to_remove = Vec::new();

        {
            let channels = self.inner.channels.read();
            if let Some(list) = channels.get(key) {
                for sub in list {
                    if !sub.try_send(Notification::Value(value.clone())) {
                        to_remove.push(sub.id);
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut channels = self.inner.channels.write();
            if let Some(list) = channels.get_mut(key) {
                list.retain(|sub| {
                    if to_remove.contains(&sub.id) {
                        // Might fail too, that's ok
                        let _ = sub.sender.try_send(Notification::Dropped {
                            reason: DropReason::BufferOverflow,
                        });
                        false
                    } else {
                        true
                    }
                });
                if list.is_empty() {
                    channels.remove(key);
                }
            }
        }
    }
}

impl<K, V> Default for ListenerRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Unkeyed listener list.
pub struct ListenerSet<V> {
    registry: ListenerRegistry<(), V>,
}

impl<V> Clone for ListenerSet<V> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> ListenerSet<V> {
    pub fn new() -> Self {
        Self {
            registry: ListenerRegistry::new(),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.registry.subscribe((), listener)
    }

    pub fn emit(&self, value: &V) {
        self.registry.emit(&(), value);
    }

    pub fn len(&self) -> usize {
        self.registry.subscription_count(&())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send + Sync + 'static> Default for ListenerSet<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_subscribe_unsubscribe() {
        let registry: ListenerRegistry<String, u32> = ListenerRegistry::new();

        let sub = registry.subscribe("news".to_string(), |_| {});
        assert_eq!(registry.subscription_count(&"news".to_string()), 1);

        sub.unsubscribe();
        assert_eq!(registry.subscription_count(&"news".to_string()), 0);
    }

    #[test]
    fn test_drop_guard_removes_listener() {
        let registry: ListenerRegistry<String, u32> = ListenerRegistry::new();
        {
            let _sub = registry.subscribe("news".to_string(), |_| {});
            assert_eq!(registry.subscription_count(&"news".to_string()), 1);
        }
        assert_eq!(registry.subscription_count(&"news".to_string()), 0);
    }

    #[test]
    fn test_emit_only_to_matching_key() {
        let registry: ListenerRegistry<String, u32> = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = Arc::clone(&seen);
        let _a = registry.subscribe("a".to_string(), move |v| seen_a.lock().push(("a", *v)));
        let seen_b = Arc::clone(&seen);
        let _b = registry.subscribe("b".to_string(), move |v| seen_b.lock().push(("b", *v)));

        registry.emit(&"a".to_string(), &7);

        assert_eq!(*seen.lock(), vec![("a", 7)]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _bad = set.subscribe(|_| panic!("boom"));
        let seen_clone = Arc::clone(&seen);
        let _good = set.subscribe(move |v| seen_clone.lock().push(*v));

        set.emit(&3);
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself_during_emit() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_clone = Arc::clone(&slot);
        let sub = set.subscribe(move |_| {
            if let Some(sub) = slot_clone.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        set.emit(&1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_channel_receives_values() {
        let registry: ListenerRegistry<String, u32> = ListenerRegistry::new();
        let handle = registry.subscribe_channel("k".to_string(), SubscriptionConfig::default());

        registry.emit(&"k".to_string(), &5);

        let got = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(got, Notification::Value(5));
    }

    #[test]
    fn test_drop_slow_channel_subscriber() {
        let registry: ListenerRegistry<String, u32> = ListenerRegistry::new();
        let _handle =
            registry.subscribe_channel("k".to_string(), SubscriptionConfig { buffer_size: 2 });

        for i in 0..10 {
            registry.emit(&"k".to_string(), &i);
        }

        assert_eq!(registry.subscription_count(&"k".to_string()), 0);
    }

    #[test]
    fn test_unsubscribe_channel_sends_dropped() {
        let registry: ListenerRegistry<String, u32> = ListenerRegistry::new();
        let handle = registry.subscribe_channel("k".to_string(), SubscriptionConfig::default());

        registry.unsubscribe_channel(&"k".to_string(), handle.id);

        let got = handle.try_recv().unwrap();
        assert_eq!(
            got,
            Notification::Dropped {
                reason: DropReason::Unsubscribed
            }
        );
    }
}
