//! Stale-while-revalidate response cache.

use crate::error::Result;
use crate::subscriptions::{
    ListenerRegistry, Subscription, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::types::{CacheConfig, CacheEntry, FetchOptions};

type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
type InFlight<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Everything the cache knows about one key.
struct Slot<T> {
    entry: Option<CacheEntry<T>>,
    /// Last fetcher used for this key, kept for refetch/invalidate.
    fetcher: Option<(Fetcher<T>, FetchOptions)>,
    /// Fetch currently running for this key, tagged with its flight id.
    in_flight: Option<(u64, InFlight<T>)>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entry: None,
            fetcher: None,
            in_flight: None,
        }
    }
}

enum Lookup<T> {
    Fresh(T),
    Stale(T),
    Miss,
}

struct CacheInner<T> {
    config: CacheConfig,
    slots: Mutex<HashMap<String, Slot<T>>>,
    listeners: ListenerRegistry<String, T>,
    next_flight: AtomicU64,
    /// Runtime the cache was built on. Background refreshes run there even
    /// when the triggering call happens elsewhere.
    runtime: Option<Handle>,
}

impl<T> CacheInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start a fetch for `key` and mark it in flight. Must be called with the
    /// slot lock held; the returned future does not run until polled.
    fn start_flight(
        self: &Arc<Self>,
        key: &str,
        slot: &mut Slot<T>,
        fetcher: Fetcher<T>,
        options: FetchOptions,
        background: bool,
    ) -> InFlight<T> {
        let id = self.next_flight.fetch_add(1, Ordering::SeqCst);
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = key.to_string();

        let flight = async move {
            let result = fetcher().await;
            if let Some(inner) = weak.upgrade() {
                inner.complete(&key, id, options, &result, background);
            }
            result
        }
        .boxed()
        .shared();

        slot.in_flight = Some((id, flight.clone()));
        flight
    }

    /// Record the outcome of flight `id`.
    fn complete(&self, key: &str, id: u64, options: FetchOptions, result: &Result<T>, background: bool) {
        let written = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            if matches!(slot.in_flight, Some((current, _)) if current == id) {
                slot.in_flight = None;
            }

            match result {
                Ok(value) => {
                    slot.entry = Some(CacheEntry::new(key, value.clone(), options, Instant::now()));
                    Some(value.clone())
                }
                Err(e) if background => {
                    warn!(key, error = %e, "background refresh failed, keeping stale entry");
                    None
                }
                Err(e) => {
                    debug!(key, error = %e, "fetch failed");
                    None
                }
            }
        };

        if let Some(value) = written {
            self.listeners.emit(&key.to_string(), &value);
        }
    }

    /// Drive `flight` in the background. Without a runtime the in-flight
    /// marker is cleared so a later access starts over.
    fn spawn_flight(&self, key: &str, slot: &mut Slot<T>, flight: InFlight<T>) {
        match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => {
                handle.spawn(async move {
                    let _ = flight.await;
                });
            }
            None => {
                warn!(key, "no async runtime, background fetch skipped");
                slot.in_flight = None;
            }
        }
    }

    fn write(&self, key: &str, value: T) {
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            let options = slot
                .fetcher
                .as_ref()
                .map(|(_, options)| *options)
                .unwrap_or(self.config.default_options);
            slot.entry = Some(CacheEntry::new(key, value.clone(), options, Instant::now()));
        }
        self.listeners.emit(&key.to_string(), &value);
    }
}


/// Time-keyed cache with in-flight deduplication and change broadcast.
///
/// Cloning is cheap and every clone shares the same entries and listeners,
/// so one cache can be constructed per process and handed to all consumers.
pub struct ResponseCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ResponseCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Build a cache. Fails if `config.default_options` is inconsistent.
    ///
    /// Called inside a tokio runtime, the cache keeps a handle to it for
    /// background refreshes.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.default_options.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                slots: Mutex::new(HashMap::new()),
                listeners: ListenerRegistry::new(),
                next_flight: AtomicU64::new(1),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get the value for `key`, fetching it if needed.
    ///
    /// - fresh entry: returned without calling `fetcher`
    /// - stale entry: returned immediately; one background refresh is started
    ///   unless one is already running
    /// - missing or expired: waits for the fetch; concurrent callers share it
    pub async fn fetch<F, Fut>(&self, key: &str, fetcher: F, options: FetchOptions) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        options.validate()?;
        let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());
        let now = Instant::now();

        let flight = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            slot.fetcher = Some((Arc::clone(&fetcher), options));

            let lookup = match slot.entry.as_ref() {
                Some(entry) if entry.is_fresh(now) => Lookup::Fresh(entry.value.clone()),
                Some(entry) if !entry.is_expired(now) => Lookup::Stale(entry.value.clone()),
                _ => Lookup::Miss,
            };

            match lookup {
                Lookup::Fresh(value) => {
                    trace!(key, "fresh hit");
                    return Ok(value);
                }
                Lookup::Stale(value) => {
                    if slot.in_flight.is_none() {
                        debug!(key, "stale hit, revalidating");
                        let flight = self.inner.start_flight(key, slot, fetcher, options, true);
                        self.inner.spawn_flight(key, slot, flight);
                    }
                    return Ok(value);
                }
                Lookup::Miss => {
                    // Expired entries are evicted on access
                    slot.entry = None;
                    match slot.in_flight.as_ref() {
                        Some((_, flight)) => {
                            trace!(key, "joining in-flight fetch");
                            flight.clone()
                        }
                        None => self.inner.start_flight(key, slot, fetcher, options, false),
                    }
                }
            }
        };

        flight.await
    }

    /// Current value, stale or fresh. Expired entries are evicted.
    pub fn get(&self, key: &str) -> Option<T> {
        self.entry(key).map(|entry| entry.value)
    }

    /// Snapshot of the live entry for `key`.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = Instant::now();
        let mut slots = self.inner.slots.lock();
        let slot = slots.get_mut(key)?;
        if slot.entry.as_ref().is_some_and(|entry| entry.is_expired(now)) {
            slot.entry = None;
        }
        slot.entry.clone()
    }

    /// Overwrite the value for `key` and notify its listeners.
    pub fn mutate(&self, key: &str, value: T) {
        self.inner.write(key, value);
    }

    /// Drop the entry for `key`. With `refetch_on_invalidate` set, the last
    /// fetcher used for the key is started again right away.
    pub fn invalidate(&self, key: &str) {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.entry = None;
        slot.in_flight = None;

        if self.inner.config.refetch_on_invalidate {
            if let Some((fetcher, options)) = slot.fetcher.clone() {
                debug!(key, "invalidated, refetching");
                let flight = self.inner.start_flight(key, slot, fetcher, options, false);
                self.inner.spawn_flight(key, slot, flight);
            }
        }
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut slots = self.inner.slots.lock();
        for (key, slot) in slots.iter_mut() {
            if key.starts_with(prefix) {
                slot.entry = None;
                slot.in_flight = None;
            }
        }
    }

    /// Forget every entry, fetcher and in-flight marker. Listeners stay.
    pub fn clear(&self) {
        self.inner.slots.lock().clear();
    }

    /// Fetch `key` again with its last fetcher, ignoring freshness.
    /// Returns `Ok(None)` when the key was never fetched.
    pub async fn refetch(&self, key: &str) -> Result<Option<T>> {
        let flight = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return Ok(None);
            };
            let Some((fetcher, options)) = slot.fetcher.clone() else {
                return Ok(None);
            };
            self.inner.start_flight(key, slot, fetcher, options, false)
        };

        flight.await.map(Some)
    }

    /// Fetch and store `key` regardless of what is cached.
    pub async fn prefetch<F, Fut>(&self, key: &str, fetcher: F, options: FetchOptions) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        options.validate()?;
        let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());

        let flight = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            slot.fetcher = Some((Arc::clone(&fetcher), options));
            self.inner.start_flight(key, slot, fetcher, options, false)
        };

        flight.await
    }

    /// Call `listener` with every value written for `key`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(key.to_string(), listener)
    }

    /// Channel of values written for `key`. Dropped if it falls `buffer_size`
    /// writes behind.
    pub fn watch(&self, key: &str, buffer_size: usize) -> SubscriptionHandle<T> {
        self.inner
            .listeners
            .subscribe_channel(key.to_string(), SubscriptionConfig { buffer_size })
    }

    /// Stop a channel opened with [`watch`](Self::watch). The channel gets a
    /// final `Dropped` notice.
    pub fn unwatch(&self, key: &str, id: SubscriptionId) {
        self.inner.listeners.unsubscribe_channel(&key.to_string(), id);
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner
            .slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.in_flight.is_some())
    }

    /// Number of keys holding an entry (expired ones included until touched).
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::with_valid_config(CacheConfig::default())
    }
}
