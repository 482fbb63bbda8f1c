//! Scripted transports shared by the integration tests.

#![allow(dead_code)]

use feed_resilience::{ChangeFeedTransport, Result, SignalSink, StreamHandle, StreamTransport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Route crate logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Change-feed client that records subscriptions and lets the test drive
/// each topic's status.
#[derive(Default)]
pub struct ScriptedFeed {
    subscriptions: Mutex<Vec<(u64, String, SignalSink)>>,
    unsubscribed: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
}

impl ScriptedFeed {
    /// Sink of the newest subscription for `topic`.
    pub fn sink(&self, topic: &str) -> SignalSink {
        self.subscriptions
            .lock()
            .iter()
            .rev()
            .find(|(_, t, _)| t == topic)
            .map(|(_, _, sink)| sink.clone())
            .expect("topic was never subscribed")
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(_, t, _)| t == topic)
            .count()
    }

    /// Subscriptions not yet released.
    pub fn live(&self) -> usize {
        let unsubscribed = self.unsubscribed.lock();
        self.subscriptions
            .lock()
            .iter()
            .filter(|(id, _, _)| !unsubscribed.contains(id))
            .count()
    }
}

impl ChangeFeedTransport for ScriptedFeed {
    type Subscription = u64;

    fn subscribe(&self, topic: &str, sink: SignalSink) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().push((id, topic.to_string(), sink));
        Ok(id)
    }

    fn unsubscribe(&self, subscription: u64) {
        self.unsubscribed.lock().insert(subscription);
    }
}

/// Push-stream client. Handles count how often they were closed.
#[derive(Clone, Default)]
pub struct ScriptedStream {
    pub opened: Arc<Mutex<Vec<(String, SignalSink)>>>,
    pub closed: Arc<AtomicUsize>,
    pub refuse: Arc<AtomicBool>,
}

impl ScriptedStream {
    pub fn last_sink(&self) -> SignalSink {
        self.opened
            .lock()
            .last()
            .map(|(_, sink)| sink.clone())
            .expect("stream was never opened")
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }
}

pub struct ScriptedHandle {
    closed: Arc<AtomicUsize>,
}

impl StreamHandle for ScriptedHandle {
    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl StreamTransport for ScriptedStream {
    type Handle = ScriptedHandle;

    fn open(&self, address: &str, sink: SignalSink) -> Result<ScriptedHandle> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(feed_resilience::ResilienceError::Transport(format!(
                "connection refused: {address}"
            )));
        }
        self.opened.lock().push((address.to_string(), sink));
        Ok(ScriptedHandle {
            closed: Arc::clone(&self.closed),
        })
    }
}
