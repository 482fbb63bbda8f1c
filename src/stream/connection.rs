//! Reconnecting stream connection.

use crate::backoff::ReconnectPolicy;
use crate::error::{ResilienceError, Result};
use crate::subscriptions::{ListenerSet, Subscription};
use crate::types::{ChangeEvent, ConnectionState};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::transport::{
    ChangeFeed, ChangeFeedTransport, Inbound, PushStream, Signal, SignalSink, StreamTransport,
    Transport, TransportGuard,
};

type EventHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
type EventFilter = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Mutable connection state. Only touched under `Shared::inner`.
struct Inner {
    state: ConnectionState,
    attempts: u32,
    /// Bumped on every teardown. Sinks and timers carry the generation they
    /// were issued for and are ignored once it moves on.
    generation: u64,
    enabled: bool,
    guard: Option<Box<dyn TransportGuard>>,
    timer: Option<JoinHandle<()>>,
}

impl Inner {
    /// Returns true if the state actually changed.
    fn set_state(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.enabled && self.generation == generation
    }

    /// Invalidate outstanding callbacks and take the transport and timer.
    fn teardown(&mut self) -> (Option<Box<dyn TransportGuard>>, Option<JoinHandle<()>>) {
        self.generation += 1;
        (self.guard.take(), self.timer.take())
    }
}

fn release(guard: Option<Box<dyn TransportGuard>>, timer: Option<JoinHandle<()>>) {
    if let Some(timer) = timer {
        timer.abort();
    }
    if let Some(guard) = guard {
        guard.close();
    }
}

struct Shared {
    id: String,
    policy: ReconnectPolicy,
    transport: Box<dyn Transport>,
    inner: Mutex<Inner>,
    /// Held while applying a transition and notifying about it, so status
    /// listeners see transitions in order. Reentrant because listeners may
    /// call back into the connection.
    dispatch: ReentrantMutex<()>,
    status: ListenerSet<ConnectionState>,
    handler: RwLock<Option<EventHandler>>,
    filter: RwLock<Option<EventFilter>>,
    /// Runtime reconnect timers are spawned on. Transports may report from
    /// their own threads, so this cannot be looked up at failure time.
    runtime: Mutex<Option<Handle>>,
}

impl Shared {
    /// The stored runtime, adopting the caller's if none was captured yet.
    fn runtime(&self) -> Option<Handle> {
        let mut runtime = self.runtime.lock();
        if runtime.is_none() {
            *runtime = Handle::try_current().ok();
        }
        runtime.clone()
    }

    fn emit(&self, transitions: &[ConnectionState]) {
        for state in transitions {
            self.status.emit(state);
        }
    }

    fn sink(self: &Arc<Self>, generation: u64) -> SignalSink {
        let weak: Weak<Self> = Arc::downgrade(self);
        SignalSink::new(move |signal| {
            if let Some(shared) = weak.upgrade() {
                shared.on_signal(generation, signal);
            }
        })
    }

    fn enable(self: &Arc<Self>) {
        let _dispatch = self.dispatch.lock();
        self.runtime();
        {
            let mut inner = self.inner.lock();
            if inner.enabled {
                trace!(id = %self.id, "enable ignored, already enabled");
                return;
            }
            inner.enabled = true;
            inner.attempts = 0;
        }
        self.start_attempt();
    }

    fn disable(&self) {
        let _dispatch = self.dispatch.lock();
        let (guard, timer, changed) = {
            let mut inner = self.inner.lock();
            if !inner.enabled && inner.guard.is_none() && inner.timer.is_none() {
                return;
            }
            inner.enabled = false;
            let (guard, timer) = inner.teardown();
            (guard, timer, inner.set_state(ConnectionState::Disconnected))
        };

        release(guard, timer);
        debug!(id = %self.id, "stream disabled");
        if changed {
            self.emit(&[ConnectionState::Disconnected]);
        }
    }

    fn reconnect(self: &Arc<Self>) {
        let _dispatch = self.dispatch.lock();
        self.runtime();
        let (guard, timer) = {
            let mut inner = self.inner.lock();
            inner.enabled = true;
            inner.attempts = 0;
            inner.teardown()
        };
        release(guard, timer);
        info!(id = %self.id, "manual reconnect");
        self.start_attempt();
    }

    /// Open a fresh transport. Caller holds `dispatch`.
    fn start_attempt(self: &Arc<Self>) {
        let (generation, old_guard, changed) = {
            let mut inner = self.inner.lock();
            if !inner.enabled {
                return;
            }
            let (guard, timer) = inner.teardown();
            // The timer that got us here has already fired
            drop(timer);
            let changed = inner.set_state(ConnectionState::Connecting);
            (inner.generation, guard, changed)
        };

        release(old_guard, None);
        if changed {
            self.emit(&[ConnectionState::Connecting]);
        }

        debug!(id = %self.id, generation, "connecting");
        match self.transport.connect(self.sink(generation)) {
            Ok(guard) => {
                let mut inner = self.inner.lock();
                if inner.is_current(generation) {
                    inner.guard = Some(guard);
                } else {
                    drop(inner);
                    trace!(id = %self.id, generation, "attempt superseded while connecting");
                    guard.close();
                }
            }
            Err(e) => {
                warn!(id = %self.id, error = %e, "transport failed to start");
                self.handle_failure(generation, e.to_string());
            }
        }
    }

    fn on_signal(self: &Arc<Self>, generation: u64, signal: Signal) {
        let _dispatch = self.dispatch.lock();
        if !self.inner.lock().is_current(generation) {
            trace!(id = %self.id, generation, signal = signal.kind(), "discarding signal from stale transport");
            return;
        }

        match signal {
            Signal::Opened => self.handle_open(generation),
            Signal::Message(inbound) => self.deliver(inbound),
            Signal::Failed(reason) => self.handle_failure(generation, reason),
            Signal::Closed => self.handle_failure(generation, "closed by remote".to_string()),
        }
    }

    fn handle_open(&self, generation: u64) {
        let changed = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            inner.attempts = 0;
            inner.set_state(ConnectionState::Connected)
        };

        if changed {
            info!(id = %self.id, "stream connected");
            self.emit(&[ConnectionState::Connected]);
        }
    }

    fn handle_failure(self: &Arc<Self>, generation: u64, reason: String) {
        let (guard, transitions, retry) = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            let (guard, timer) = inner.teardown();
            drop(timer);

            let mut transitions = Vec::with_capacity(2);
            if inner.set_state(ConnectionState::Error) {
                transitions.push(ConnectionState::Error);
            }

            let retry = if self.policy.allows(inner.attempts) {
                let delay = self.policy.delay_for(inner.attempts);
                inner.attempts += 1;
                Some((delay, inner.attempts, inner.generation))
            } else {
                inner.set_state(ConnectionState::Disconnected);
                transitions.push(ConnectionState::Disconnected);
                None
            };
            (guard, transitions, retry)
        };

        release(guard, None);

        match retry {
            Some((delay, attempt, timer_generation)) => {
                warn!(
                    id = %self.id,
                    reason = %reason,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "stream failed, scheduling reconnect"
                );
                self.emit(&transitions);
                self.schedule(delay, timer_generation);
            }
            None => {
                warn!(
                    id = %self.id,
                    reason = %reason,
                    max_attempts = self.policy.max_attempts,
                    "stream failed, giving up until reconnect"
                );
                self.emit(&transitions);
            }
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration, generation: u64) {
        let runtime = match self.runtime() {
            Some(runtime) => runtime,
            None => {
                warn!(id = %self.id, "no async runtime, cannot schedule reconnect");
                let changed = {
                    let mut inner = self.inner.lock();
                    inner.is_current(generation) && inner.set_state(ConnectionState::Disconnected)
                };
                if changed {
                    self.emit(&[ConnectionState::Disconnected]);
                }
                return;
            }
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire_timer(generation);
            }
        });

        let mut inner = self.inner.lock();
        if inner.is_current(generation) {
            inner.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    fn fire_timer(self: &Arc<Self>, generation: u64) {
        let _dispatch = self.dispatch.lock();
        {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                trace!(id = %self.id, generation, "discarding stale reconnect timer");
                return;
            }
            inner.timer = None;
        }
        self.start_attempt();
    }

    fn deliver(&self, inbound: Inbound) {
        let mut event = match inbound {
            Inbound::Event(event) => event,
            Inbound::Text(raw) => match serde_json::from_str::<ChangeEvent>(&raw) {
                Ok(event) => event,
                Err(e) => {
                    let error = ResilienceError::from(e);
                    warn!(id = %self.id, %error, "dropping malformed message");
                    return;
                }
            },
        };
        if event.source_id.is_empty() {
            event.source_id = self.id.clone();
        }

        let filter = self.filter.read().clone();
        if let Some(filter) = filter {
            if !filter(&event) {
                trace!(id = %self.id, "event filtered out");
                return;
            }
        }

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(id = %self.id, "event handler panicked; connection kept");
            }
        }
    }
}

/// A change-feed subscription that reconnects itself.
///
/// ```text
/// Disconnected --enable--> Connecting --open--> Connected
///                               |                   |
///                               +------error--------+--> Error --backoff--> Connecting
///                                                          |
///                                            attempts used up --> Disconnected
/// ```
///
/// `disable()` returns any state to Disconnected. After giving up, only
/// `reconnect()` starts again. Dropping the connection disables it.
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    pub fn new<T: Transport>(id: impl Into<String>, transport: T, policy: ReconnectPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                id: id.into(),
                policy,
                transport: Box::new(transport),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    generation: 0,
                    enabled: false,
                    guard: None,
                    timer: None,
                }),
                dispatch: ReentrantMutex::new(()),
                status: ListenerSet::new(),
                handler: RwLock::new(None),
                filter: RwLock::new(None),
                runtime: Mutex::new(Handle::try_current().ok()),
            }),
        })
    }

    /// Spawn reconnect timers on `runtime`. Needed when the connection is
    /// built and enabled outside of any tokio runtime.
    pub fn with_runtime(self, runtime: Handle) -> Self {
        *self.shared.runtime.lock() = Some(runtime);
        self
    }

    /// Connection over a push stream opened at `address`.
    pub fn push_stream<T: StreamTransport>(
        id: impl Into<String>,
        transport: T,
        address: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        Self::new(id, PushStream::new(transport, address), policy)
    }

    /// Connection over a change-feed channel for `topic`.
    pub fn change_feed<T: ChangeFeedTransport>(
        id: impl Into<String>,
        transport: Arc<T>,
        topic: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        Self::new(id, ChangeFeed::new(transport, topic), policy)
    }

    /// Drop events for which `filter` returns false before they reach the
    /// handler.
    pub fn with_filter<F>(self, filter: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        *self.shared.filter.write() = Some(Arc::new(filter));
        self
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Retries scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.shared.inner.lock().attempts
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.inner.lock().enabled
    }

    /// Whether a reconnect timer is pending.
    pub fn has_pending_reconnect(&self) -> bool {
        self.shared.inner.lock().timer.is_some()
    }

    /// Start connecting. No-op while already enabled.
    pub fn enable(&self) {
        self.shared.enable();
    }

    /// Tear down the transport and cancel any pending reconnect.
    pub fn disable(&self) {
        self.shared.disable();
    }

    /// Reset the attempt counter and connect again from scratch.
    pub fn reconnect(&self) {
        self.shared.reconnect();
    }

    /// Listen for state transitions.
    pub fn on_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.status.subscribe(listener)
    }

    /// Set the event handler, replacing any previous one.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.shared.disable();
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("StreamConnection")
            .field("id", &self.shared.id)
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .field("enabled", &inner.enabled)
            .finish()
    }
}
