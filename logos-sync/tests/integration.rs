//! End-to-end tests: real relay, real WebSocket sessions.
//!
//! Each test binds its own relay on a free port and connects engines through
//! `WsTransport`, verifying the full record → batch → confirm → render path.

use std::sync::Arc;

use logos_sync::engine::{EngineConfig, EngineEvent, SessionContext, SyncEngine};
use logos_sync::protocol::{
    self, Batch, BatchAck, ElementOp, Event, MissingRange, MissingRangeRequest, PingAck,
    PingRequest, Topic,
};
use logos_sync::relay::{RelayConfig, RelayServer};
use logos_sync::render::RecordingSink;
use logos_sync::transport::ws::{WsConfig, WsTransport};
use logos_sync::transport::{Transport, TransportEvent};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const BOARD: &str = "board-1";

/// Bind a relay on a free port; returns the server and its ws:// URL.
async fn start_relay() -> (Arc<RelayServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(RelayServer::new(RelayConfig::for_testing()));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

struct Participant {
    engine: SyncEngine,
    sink: Arc<RecordingSink>,
    events: UnboundedReceiver<EngineEvent>,
}

/// Connect a session to `BOARD` and wait until it is online.
async fn join(url: &str) -> Participant {
    let session_id = Uuid::new_v4();
    let transport = WsTransport::connect(WsConfig::for_testing(url, BOARD).with_session(session_id))
        .await
        .unwrap();
    let sink = Arc::new(RecordingSink::new());
    let mut engine = SyncEngine::start(
        transport,
        SessionContext::with_session(BOARD, session_id),
        sink.clone(),
        EngineConfig::for_testing(),
    )
    .unwrap();
    let mut events = engine.take_event_rx().unwrap();
    wait_for(&mut events, |e| *e == EngineEvent::ConnectionChanged { online: true }).await;

    Participant {
        engine,
        sink,
        events,
    }
}

async fn wait_for(
    events: &mut UnboundedReceiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("Engine event stream closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for engine event")
}

/// Poll `check` until it holds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "Timed out waiting for {what}");
}

/// Poll the relay's board log until it holds `expected` events; returns the last count.
async fn stored_events(server: &RelayServer, expected: usize) -> usize {
    let mut stored = server.board_events(BOARD).await.len();
    for _ in 0..500 {
        if stored == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stored = server.board_events(BOARD).await.len();
    }
    stored
}

/// Raw transport for driving the relay without an engine.
async fn raw_session(url: &str) -> Arc<WsTransport> {
    let transport = WsTransport::connect(WsConfig::for_testing(url, BOARD))
        .await
        .unwrap();
    let mut events = transport.take_events().unwrap();
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == TransportEvent::Connected {
                return;
            }
        }
    })
    .await
    .expect("Transport never connected");
    transport
}

fn local_event(id: &str, origin: Uuid, client_timestamp: f64) -> Event {
    Event {
        id: id.to_string(),
        client_timestamp,
        server_timestamp: None,
        origin_session_id: origin,
        payload: vec![1, 2, 3],
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay basics
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (_server, url) = start_relay().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_ping_is_acknowledged() {
    let (_server, url) = start_relay().await;
    let transport = raw_session(&url).await;

    let payload = protocol::encode(&PingRequest { client_time: 0.0 }).unwrap();
    let rx = transport.request(Topic::Ping, payload).unwrap();
    let bytes = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    let ack: PingAck = protocol::decode(&bytes).unwrap();
    assert!(ack.latency >= 0.0);
}

#[tokio::test]
async fn test_resent_batch_is_stored_once() {
    let (server, url) = start_relay().await;
    let transport = raw_session(&url).await;
    let origin = transport.session_id();

    let batch = Batch {
        batch_id: "batch_1".into(),
        channel_id: BOARD.into(),
        events: vec![
            local_event("e1", origin, 1.0),
            local_event("e2", origin, 2.0),
        ],
    };
    for _ in 0..2 {
        let rx = transport
            .request(Topic::BatchSend, protocol::encode(&batch).unwrap())
            .unwrap();
        let bytes = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        let ack: BatchAck = protocol::decode(&bytes).unwrap();
        assert!(ack.is_ok());
        assert_eq!(ack.count, 2);
    }

    let stored = server.board_events(BOARD).await;
    assert_eq!(stored.len(), 2);
    let stamps: Vec<f64> = stored.iter().map(|e| e.server_timestamp.unwrap()).collect();
    assert!(stamps[0] < stamps[1]);

    let stats = server.stats().await;
    assert_eq!(stats.batches_accepted, 2);
    assert_eq!(stats.events_accepted, 2);
    assert_eq!(stats.duplicate_events, 2);
}

#[tokio::test]
async fn test_batch_for_other_board_is_rejected() {
    let (server, url) = start_relay().await;
    let transport = raw_session(&url).await;

    let batch = Batch {
        batch_id: "batch_x".into(),
        channel_id: "elsewhere".into(),
        events: vec![local_event("e1", transport.session_id(), 1.0)],
    };
    let rx = transport
        .request(Topic::BatchSend, protocol::encode(&batch).unwrap())
        .unwrap();
    let bytes = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    let ack: BatchAck = protocol::decode(&bytes).unwrap();
    assert!(!ack.is_ok());
    assert!(server.board_events("elsewhere").await.is_empty());
}

#[tokio::test]
async fn test_missing_range_served_from_board_log() {
    let (_server, url) = start_relay().await;
    let transport = raw_session(&url).await;
    let origin = transport.session_id();

    let batch = Batch {
        batch_id: "batch_1".into(),
        channel_id: BOARD.into(),
        events: (0..4)
            .map(|i| local_event(&format!("e{i}"), origin, i as f64))
            .collect(),
    };
    let rx = transport
        .request(Topic::BatchSend, protocol::encode(&batch).unwrap())
        .unwrap();
    timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

    let request = MissingRangeRequest {
        channel_id: BOARD.into(),
        since: 0.0,
        until: None,
    };
    let rx = transport
        .request(Topic::MissingRange, protocol::encode(&request).unwrap())
        .unwrap();
    let bytes = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    let range: MissingRange = protocol::decode(&bytes).unwrap();
    let ids: Vec<&str> = range.events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["e0", "e1", "e2", "e3"]);
}

// ───────────────────────────────────────────────────────────────────
// Engines on a shared board
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_strokes_reach_other_session_in_order() {
    let (server, url) = start_relay().await;
    let mut alice = join(&url).await;
    let bob = join(&url).await;

    let recorded: Vec<String> = (0..5)
        .map(|i| alice.engine.record_event(vec![i]).unwrap().id)
        .collect();
    assert_eq!(alice.sink.render_count(), 5);

    alice.engine.flush();
    wait_for(&mut alice.events, |e| matches!(e, EngineEvent::BatchAccepted { count: 5, .. })).await;

    eventually("bob to render alice's strokes", || bob.sink.render_count() == 5).await;
    assert_eq!(bob.sink.rendered_ids(), recorded);
    assert_eq!(server.board_events(BOARD).await.len(), 5);

    // Alice's own echo confirms but does not redraw
    eventually("alice to adopt server timestamps", || {
        alice.engine.history().iter().all(Event::is_confirmed)
    })
    .await;
    assert_eq!(alice.sink.render_count(), 5);
}

#[tokio::test]
async fn test_late_joiner_gets_history_snapshot() {
    let (_server, url) = start_relay().await;
    let mut alice = join(&url).await;

    for i in 0..3 {
        alice.engine.record_event(vec![i]).unwrap();
    }
    alice.engine.flush();
    wait_for(&mut alice.events, |e| matches!(e, EngineEvent::BatchAccepted { .. })).await;

    let carol = join(&url).await;
    eventually("carol to render the snapshot", || carol.sink.render_count() == 3).await;
    assert_eq!(carol.engine.history().len(), 3);
    assert!(carol.engine.watermark() > 0.0);
}

#[tokio::test]
async fn test_element_ops_reach_other_sessions_only() {
    let (_server, url) = start_relay().await;
    let alice = join(&url).await;
    let bob = join(&url).await;

    let op = ElementOp::Add {
        element_id: "shape_1".into(),
        data: vec![9],
    };
    alice.engine.send_element_op(op.clone()).unwrap();

    eventually("bob to apply the element", || bob.sink.elements() == vec![op.clone()]).await;
    assert!(alice.sink.elements().is_empty());
}

#[tokio::test]
async fn test_clear_all_wipes_every_board() {
    let (server, url) = start_relay().await;
    let mut alice = join(&url).await;
    let mut bob = join(&url).await;

    alice.engine.record_event(vec![1]).unwrap();
    alice.engine.flush();
    wait_for(&mut alice.events, |e| matches!(e, EngineEvent::BatchAccepted { .. })).await;
    eventually("bob to render", || bob.sink.render_count() == 1).await;

    alice.engine.send_element_op(ElementOp::ClearAll).unwrap();
    assert_eq!(alice.sink.clear_count(), 1);

    wait_for(&mut bob.events, |e| *e == EngineEvent::BoardCleared).await;
    assert_eq!(bob.sink.render_count(), 0);
    assert!(bob.engine.history().is_empty());
    assert_eq!(stored_events(&server, 0).await, 0);
}

#[tokio::test]
async fn test_stop_sends_final_batch() {
    let (server, url) = start_relay().await;
    let alice = join(&url).await;

    for i in 0..3 {
        alice.engine.record_event(vec![i]).unwrap();
    }
    assert_eq!(alice.engine.stop(), 3);

    assert_eq!(stored_events(&server, 3).await, 3);
}
