//! Stream connection behaviour over both transport shapes.

mod common;

use common::{ScriptedFeed, ScriptedStream};
use feed_resilience::{
    ChangeEvent, ChangeOperation, ConnectionState, FeedStatus, ReconnectPolicy, StreamConnection,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::new(
        max_attempts,
        Duration::from_millis(1000),
        Duration::from_millis(30_000),
        0.0,
    )
}

// --- Push stream ---

#[tokio::test(start_paused = true)]
async fn test_push_stream_delivers_decoded_events() {
    let stream = ScriptedStream::default();
    let conn = StreamConnection::push_stream(
        "news-sse",
        stream.clone(),
        "https://feed.example/api/news/stream",
        fast_policy(10),
    )
    .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    conn.on_event(move |event| events_clone.lock().push(event.clone()));

    conn.enable();
    assert_eq!(
        stream.opened.lock()[0].0,
        "https://feed.example/api/news/stream"
    );

    let sink = stream.last_sink();
    sink.opened();
    sink.message(r#"{"operation":"INSERT","payload":{"id":"a1","title":"Merger"}}"#);
    sink.message("{truncated");
    sink.message(r#"{"sourceId":"override","operation":"UPDATE","payload":{"id":"a1"}}"#);

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].source_id, "news-sse");
    assert_eq!(events[0].operation, ChangeOperation::Insert);
    assert_eq!(events[0].payload, Some(json!({"id": "a1", "title": "Merger"})));
    assert_eq!(events[1].source_id, "override");
}

#[tokio::test(start_paused = true)]
async fn test_push_stream_backoff_schedule() {
    common::init_tracing();
    let stream = ScriptedStream::default();
    let conn =
        StreamConnection::push_stream("news-sse", stream.clone(), "sse://news", fast_policy(10))
            .unwrap();

    conn.enable();
    stream.last_sink().failed("network down");

    // Delays double: 1s, 2s, 4s
    for (n, delay) in [1000u64, 2000, 4000].into_iter().enumerate() {
        assert_eq!(conn.state(), ConnectionState::Error);
        tokio::time::sleep(Duration::from_millis(delay - 1)).await;
        assert_eq!(stream.open_count(), n + 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(stream.open_count(), n + 2);
        stream.last_sink().failed("network down");
    }

    assert_eq!(conn.attempts(), 4);
    assert_eq!(stream.closed.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_push_stream_gives_up_then_manual_reconnect() {
    let stream = ScriptedStream::default();
    stream.refuse.store(true, Ordering::SeqCst);
    let conn =
        StreamConnection::push_stream("news-sse", stream.clone(), "sse://news", fast_policy(3))
            .unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let states_clone = Arc::clone(&states);
    let _sub = conn.on_status_change(move |s| states_clone.lock().push(*s));

    conn.enable();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(states.lock().last(), Some(&ConnectionState::Disconnected));
    assert!(!conn.has_pending_reconnect());

    stream.refuse.store(false, Ordering::SeqCst);
    conn.reconnect();
    stream.last_sink().opened();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drop_closes_transport_and_cancels_timer() {
    let stream = ScriptedStream::default();
    {
        let conn =
            StreamConnection::push_stream("news-sse", stream.clone(), "sse://news", fast_policy(3))
                .unwrap();
        conn.enable();
        stream.last_sink().opened();
    }
    assert_eq!(stream.closed.load(Ordering::SeqCst), 1);

    // A late message from the dropped connection's transport goes nowhere
    stream.last_sink().failed("late");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(stream.open_count(), 1);
}

// --- Change feed ---

#[tokio::test(start_paused = true)]
async fn test_change_feed_status_drives_state() {
    common::init_tracing();
    let feed = Arc::new(ScriptedFeed::default());
    let conn = StreamConnection::change_feed(
        "protocols",
        Arc::clone(&feed),
        "public:ProtocolAnalyses",
        fast_policy(10),
    )
    .unwrap();

    conn.enable();
    assert_eq!(conn.state(), ConnectionState::Connecting);

    feed.sink("public:ProtocolAnalyses").status(FeedStatus::Subscribed);
    assert_eq!(conn.state(), ConnectionState::Connected);

    feed.sink("public:ProtocolAnalyses").status(FeedStatus::TimedOut);
    assert_eq!(conn.state(), ConnectionState::Error);
    assert_eq!(feed.live(), 0);

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(feed.subscribe_count("public:ProtocolAnalyses"), 2);
    assert_eq!(feed.live(), 1);

    conn.disable();
    assert_eq!(feed.live(), 0);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_change_feed_error_from_client_thread() {
    let feed = Arc::new(ScriptedFeed::default());
    let conn = StreamConnection::change_feed(
        "protocols",
        Arc::clone(&feed),
        "public:ProtocolAnalyses",
        fast_policy(10),
    )
    .unwrap();

    conn.enable();
    let sink = feed.sink("public:ProtocolAnalyses");
    sink.status(FeedStatus::Subscribed);

    // Realtime clients deliver status from their own socket thread
    std::thread::spawn(move || sink.status(FeedStatus::ChannelError))
        .join()
        .unwrap();

    assert_eq!(conn.state(), ConnectionState::Error);
    assert_eq!(conn.attempts(), 1);
    assert!(conn.has_pending_reconnect());

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(feed.subscribe_count("public:ProtocolAnalyses"), 2);
    assert_eq!(conn.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_change_feed_filter_and_structured_events() {
    let feed = Arc::new(ScriptedFeed::default());
    let cutoff = "2025-01-01";
    let conn = StreamConnection::change_feed("notices", Arc::clone(&feed), "public:Kungorelser", fast_policy(10))
        .unwrap()
        .with_filter(move |event| {
            event
                .payload
                .as_ref()
                .and_then(|p| p.get("publicerad"))
                .and_then(|d| d.as_str())
                .map_or(true, |date| date >= cutoff)
        });

    let ids = Arc::new(Mutex::new(Vec::new()));
    let ids_clone = Arc::clone(&ids);
    conn.on_event(move |event| {
        if let Some(id) = event.payload.as_ref().and_then(|p| p.get("id")) {
            ids_clone.lock().push(id.clone());
        }
    });

    conn.enable();
    let sink = feed.sink("public:Kungorelser");
    sink.status(FeedStatus::Subscribed);
    sink.event(ChangeEvent::insert("notices", json!({"id": 1, "publicerad": "2024-12-30"})));
    sink.event(ChangeEvent::insert("notices", json!({"id": 2, "publicerad": "2025-02-01"})));
    sink.event(ChangeEvent::delete("notices", "3"));

    assert_eq!(*ids.lock(), vec![json!(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_status_listener_unsubscribe() {
    let feed = Arc::new(ScriptedFeed::default());
    let conn = StreamConnection::change_feed("protocols", Arc::clone(&feed), "t", fast_policy(10)).unwrap();

    let seen = Arc::new(Mutex::new(0usize));
    let seen_clone = Arc::clone(&seen);
    let sub = conn.on_status_change(move |_| *seen_clone.lock() += 1);

    conn.enable();
    assert_eq!(*seen.lock(), 1);

    sub.unsubscribe();
    feed.sink("t").status(FeedStatus::Subscribed);
    assert_eq!(*seen.lock(), 1);
}
