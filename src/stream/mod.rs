//! Self-healing change-feed connections.
//!
//! A [`StreamConnection`] owns one transport at a time and walks the
//! `Disconnected -> Connecting -> Connected -> Error` state machine,
//! reconnecting with exponential backoff until its attempt budget runs out.
//! A [`DualChannelCoordinator`] runs several connections and reports one
//! aggregate state.
//!
//! # Example
//!
//! ```ignore
//! let feed = Arc::new(RealtimeClient::new(url, key));
//! let protocols = StreamConnection::change_feed("protocols", Arc::clone(&feed), "public:ProtocolAnalyses", ReconnectPolicy::default())?;
//! let notices = StreamConnection::change_feed("notices", feed, "public:Kungorelser", ReconnectPolicy::default())?;
//!
//! let coordinator = DualChannelCoordinator::pair(protocols, notices);
//! let _status = coordinator.on_status_change(|state| println!("feed {state}"));
//! coordinator.on_event(|tagged| apply(&tagged.member, &tagged.event));
//! coordinator.enable();
//! ```

mod connection;
mod coordinator;
mod transport;

pub use connection::StreamConnection;
pub use coordinator::{aggregate_state, DualChannelCoordinator};
pub use transport::{
    ChangeFeed, ChangeFeedTransport, FeedStatus, Inbound, PushStream, Signal, SignalSink,
    StreamHandle, StreamTransport, Transport, TransportGuard,
};
