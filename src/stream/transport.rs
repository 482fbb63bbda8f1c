//! Transport capabilities a stream connection can drive.
//!
//! A connection talks to exactly one [`Transport`]. Two shapes are adapted to
//! it:
//! - [`StreamTransport`]: a push stream opened at an address that reports
//!   open, message and error callbacks (server-sent events, websockets)
//! - [`ChangeFeedTransport`]: a subscribe/unsubscribe channel that reports a
//!   subscription status and delivers change events (database change feeds)
//!
//! Transports report back through a [`SignalSink`]. Sinks are bound to one
//! connection attempt, so signals from a transport that has since been torn
//! down are ignored by the connection.

use crate::error::Result;
use crate::types::ChangeEvent;
use std::fmt;
use std::sync::Arc;

/// Inbound payload from a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Raw text, decoded as a JSON change event by the connection.
    Text(String),
    /// Already structured.
    Event(ChangeEvent),
}

/// What a transport reports to its connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    Opened,
    Message(Inbound),
    Failed(String),
    Closed,
}

impl Signal {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Signal::Opened => "opened",
            Signal::Message(_) => "message",
            Signal::Failed(_) => "failed",
            Signal::Closed => "closed",
        }
    }
}

/// Subscription status reported by a change-feed channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Callback handle a transport uses to report back.
#[derive(Clone)]
pub struct SignalSink {
    deliver: Arc<dyn Fn(Signal) + Send + Sync>,
}

impl SignalSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn signal(&self, signal: Signal) {
        (self.deliver)(signal);
    }

    pub fn opened(&self) {
        self.signal(Signal::Opened);
    }

    pub fn message(&self, raw: impl Into<String>) {
        self.signal(Signal::Message(Inbound::Text(raw.into())));
    }

    pub fn event(&self, event: ChangeEvent) {
        self.signal(Signal::Message(Inbound::Event(event)));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.signal(Signal::Failed(reason.into()));
    }

    pub fn closed(&self) {
        self.signal(Signal::Closed);
    }

    /// Map a change-feed subscription status onto connection signals.
    pub fn status(&self, status: FeedStatus) {
        match status {
            FeedStatus::Subscribed => self.opened(),
            FeedStatus::ChannelError => self.failed("channel error"),
            FeedStatus::TimedOut => self.failed("subscription timed out"),
            FeedStatus::Closed => self.closed(),
        }
    }
}

impl fmt::Debug for SignalSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignalSink")
    }
}

/// A live transport instance. Closing it must stop further signals as soon
/// as practical; late signals are tolerated.
pub trait TransportGuard: Send {
    fn close(self: Box<Self>);
}

/// The one capability a connection needs: start a transport that reports
/// through `sink`.
///
/// `connect` must not block. It may report signals synchronously before it
/// returns.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, sink: SignalSink) -> Result<Box<dyn TransportGuard>>;
}

/// Push-style stream opened at an address.
pub trait StreamTransport: Send + Sync + 'static {
    type Handle: StreamHandle;

    fn open(&self, address: &str, sink: SignalSink) -> Result<Self::Handle>;
}

/// An open push stream.
pub trait StreamHandle: Send + 'static {
    fn close(&mut self);
}

/// Subscribe/unsubscribe change-feed channel.
pub trait ChangeFeedTransport: Send + Sync + 'static {
    type Subscription: Send + 'static;

    fn subscribe(&self, topic: &str, sink: SignalSink) -> Result<Self::Subscription>;

    fn unsubscribe(&self, subscription: Self::Subscription);
}

/// Adapts a [`StreamTransport`] bound to one address.
pub struct PushStream<T> {
    transport: T,
    address: String,
}

impl<T: StreamTransport> PushStream<T> {
    pub fn new(transport: T, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }
}

struct PushGuard<H>(H);

impl<H: StreamHandle> TransportGuard for PushGuard<H> {
    fn close(mut self: Box<Self>) {
        self.0.close();
    }
}

impl<T: StreamTransport> Transport for PushStream<T> {
    fn connect(&self, sink: SignalSink) -> Result<Box<dyn TransportGuard>> {
        let handle = self.transport.open(&self.address, sink)?;
        Ok(Box::new(PushGuard(handle)))
    }
}

/// Adapts a [`ChangeFeedTransport`] bound to one topic. The transport is
/// shared so several feeds can ride one client.
pub struct ChangeFeed<T> {
    transport: Arc<T>,
    topic: String,
}

impl<T: ChangeFeedTransport> ChangeFeed<T> {
    pub fn new(transport: Arc<T>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }
}

struct FeedGuard<T: ChangeFeedTransport> {
    transport: Arc<T>,
    subscription: T::Subscription,
}

impl<T: ChangeFeedTransport> TransportGuard for FeedGuard<T> {
    fn close(self: Box<Self>) {
        let FeedGuard {
            transport,
            subscription,
        } = *self;
        transport.unsubscribe(subscription);
    }
}

impl<T: ChangeFeedTransport> Transport for ChangeFeed<T> {
    fn connect(&self, sink: SignalSink) -> Result<Box<dyn TransportGuard>> {
        let subscription = self.transport.subscribe(&self.topic, sink)?;
        Ok(Box::new(FeedGuard {
            transport: Arc::clone(&self.transport),
            subscription,
        }))
    }
}
