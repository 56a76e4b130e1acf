//! Reference relay: the authoritative side of the wire contract.
//!
//! Architecture:
//! ```text
//! Session A ──┐                         ┌──► historySnapshot + watermark (on join)
//!             ├── Board (channel_id) ───┤
//! Session B ──┘     │                   └──► confirmedBatch / element ops (fan-out)
//!                   ├── BoardLog: id-deduplicated, server-timestamped events
//!                   └── BroadcastGroup
//! ```
//!
//! Each board keeps an append-only log in memory. `batchSend` is idempotent
//! per event id: an event already in the log is acknowledged but neither
//! re-stamped nor re-broadcast. Server timestamps are strictly increasing per
//! board.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 11

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager, RoomMessage};
use crate::identity::{Clock, SystemClock};
use crate::protocol::{
    self, Batch, BatchAck, ConfirmedBatch, Event, Frame, MissingRange, MissingRangeRequest,
    PingAck, PingRequest, ProtocolError, Topic, Watermark,
};
use crate::reconcile::LocalHistory;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per board
    pub broadcast_capacity: usize,
    /// Period of the watermark push; `None` disables it
    pub watermark_interval: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            broadcast_capacity: 256,
            watermark_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl RelayConfig {
    /// Ephemeral port and a fast watermark.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            watermark_interval: Some(Duration::from_millis(200)),
            ..Self::default()
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub batches_accepted: u64,
    pub events_accepted: u64,
    pub duplicate_events: u64,
    pub active_boards: usize,
}

/// Authoritative event log for one board.
#[derive(Debug, Default)]
pub struct BoardLog {
    history: LocalHistory,
    last_timestamp: f64,
}

impl BoardLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp and append the events not seen before, in batch order.
    ///
    /// Returns the newly confirmed events and the number of duplicates.
    pub fn append(&mut self, events: Vec<Event>, now: f64) -> (Vec<Event>, usize) {
        let mut confirmed = Vec::with_capacity(events.len());
        let mut duplicates = 0;
        for mut event in events {
            if self.history.contains(&event.id) {
                duplicates += 1;
                continue;
            }
            event.server_timestamp = Some(self.next_timestamp(now));
            self.history.insert(event.clone());
            confirmed.push(event);
        }
        (confirmed, duplicates)
    }

    fn next_timestamp(&mut self, now: f64) -> f64 {
        let timestamp = if now > self.last_timestamp {
            now
        } else {
            self.last_timestamp + 1e-6
        };
        self.last_timestamp = timestamp;
        timestamp
    }

    pub fn events(&self) -> Vec<Event> {
        self.history.events()
    }

    pub fn range(&self, since: f64, until: Option<f64>) -> Vec<Event> {
        self.history.range(since, until)
    }

    /// Newest server timestamp (0.0 for an empty board).
    pub fn watermark(&self) -> f64 {
        self.history.latest_confirmed().unwrap_or(0.0)
    }

    /// Drop all events. Timestamps keep increasing afterwards.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

struct RelayShared {
    config: RelayConfig,
    boards: RwLock<HashMap<String, BoardLog>>,
    rooms: RoomManager,
    stats: RwLock<RelayStats>,
    clock: Arc<dyn Clock>,
}

/// Session bound to a connection after its `Join` frame.
struct Joined {
    channel_id: String,
    session_id: Uuid,
    room: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<RoomMessage>,
}

/// The relay server.
pub struct RelayServer {
    shared: Arc<RelayShared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(RelayShared {
                config,
                boards: RwLock::new(HashMap::new()),
                rooms,
                stats: RwLock::new(RelayStats::default()),
                clock: Arc::new(SystemClock::new()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let ticker = self.shared.config.watermark_interval.map(|period| {
            let shared = self.shared.clone();
            tokio::spawn(async move { shared.push_watermarks(period).await })
        });

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Snapshot of a board's log.
    pub async fn board_events(&self, channel_id: &str) -> Vec<Event> {
        self.shared
            .boards
            .read()
            .await
            .get(channel_id)
            .map(BoardLog::events)
            .unwrap_or_default()
    }

    pub fn room_manager(&self) -> &RoomManager {
        &self.shared.rooms
    }
}

impl RelayShared {
    async fn push_watermarks(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let watermarks: Vec<(String, f64)> = self
                .boards
                .read()
                .await
                .iter()
                .filter(|(_, log)| !log.is_empty())
                .map(|(channel, log)| (channel.clone(), log.watermark()))
                .collect();

            for (channel_id, latest_timestamp) in watermarks {
                if let Some(room) = self.rooms.get(&channel_id).await {
                    let _ = room.broadcast(
                        Uuid::nil(),
                        true,
                        Topic::Watermark,
                        &Watermark { latest_timestamp },
                    );
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<Joined> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let frame = match Frame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                continue;
                            }
                        };
                        let reply = match frame {
                            Frame::Join { channel_id, session_id } => {
                                if let Some(previous) = joined.take() {
                                    previous.room.remove_peer(&previous.session_id).await;
                                }
                                let (session, greeting) = self.join(channel_id, session_id).await?;
                                joined = Some(session);
                                greeting
                            }
                            Frame::Request { id, topic, payload } => {
                                match self.answer(joined.as_ref(), topic, &payload).await {
                                    Ok(Some(ack)) => vec![Frame::Ack { id, payload: ack }],
                                    Ok(None) => Vec::new(),
                                    Err(e) => {
                                        log::warn!("Bad {topic} request from {addr}: {e}");
                                        Vec::new()
                                    }
                                }
                            }
                            Frame::Notify { topic, payload } => {
                                self.forward(joined.as_ref(), topic, payload).await;
                                Vec::new()
                            }
                            other => {
                                log::debug!("Ignoring {other:?} from {addr}");
                                Vec::new()
                            }
                        };
                        for frame in reply {
                            ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },

                msg = async {
                    match joined.as_mut() {
                        Some(session) => session.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match msg {
                    Ok(message) => {
                        let deliver = joined
                            .as_ref()
                            .is_some_and(|session| message.delivers_to(&session.session_id));
                        if deliver {
                            ws_sender
                                .send(Message::Binary(message.frame.to_vec().into()))
                                .await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Session lagged by {n} messages on {addr}");
                        if let Some(session) = joined.as_ref() {
                            session.room.record_dropped(n);
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        if let Some(session) = joined {
            session.room.remove_peer(&session.session_id).await;
            if self.rooms.remove_if_empty(&session.channel_id).await {
                log::info!("Board {} has no sessions left", session.channel_id);
            }
        }
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_boards = self.rooms.room_count().await;

        Ok(())
    }

    /// Register a session and build its greeting: history snapshot, then watermark.
    async fn join(
        &self,
        channel_id: String,
        session_id: Uuid,
    ) -> Result<(Joined, Vec<Frame>), ProtocolError> {
        let room = self.rooms.get_or_create(&channel_id).await;
        let rx = room.add_peer(session_id).await;

        let (events, latest_timestamp) = {
            let mut boards = self.boards.write().await;
            let log = boards.entry(channel_id.clone()).or_default();
            (log.events(), log.watermark())
        };
        let greeting = vec![
            Frame::Push {
                topic: Topic::HistorySnapshot,
                payload: protocol::encode(&events)?,
            },
            Frame::Push {
                topic: Topic::Watermark,
                payload: protocol::encode(&Watermark { latest_timestamp })?,
            },
        ];

        self.stats.write().await.active_boards = self.rooms.room_count().await;
        log::info!(
            "Session {session_id} joined board {channel_id} ({} events)",
            events.len()
        );

        Ok((
            Joined {
                channel_id,
                session_id,
                room,
                rx,
            },
            greeting,
        ))
    }

    /// Build the ack body for a request; `None` sends no ack.
    async fn answer(
        &self,
        joined: Option<&Joined>,
        topic: Topic,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        match topic {
            Topic::Ping => {
                let ping: PingRequest = protocol::decode(payload)?;
                let latency = (self.clock.now() - ping.client_time).max(0.0);
                protocol::encode(&PingAck { latency }).map(Some)
            }
            Topic::BatchSend => {
                let batch: Batch = protocol::decode(payload)?;
                let ack = match joined {
                    Some(session) if session.channel_id == batch.channel_id => {
                        self.accept_batch(session, batch).await?
                    }
                    _ => BatchAck::error(format!("not joined to board {}", batch.channel_id)),
                };
                protocol::encode(&ack).map(Some)
            }
            Topic::MissingRange => {
                let request: MissingRangeRequest = protocol::decode(payload)?;
                let events = self
                    .boards
                    .read()
                    .await
                    .get(&request.channel_id)
                    .map(|log| log.range(request.since, request.until))
                    .unwrap_or_default();
                protocol::encode(&MissingRange { events }).map(Some)
            }
            other => {
                log::debug!("No acknowledgment defined for {other}");
                Ok(None)
            }
        }
    }

    async fn accept_batch(&self, session: &Joined, batch: Batch) -> Result<BatchAck, ProtocolError> {
        let count = batch.len();
        let (confirmed, duplicates) = {
            let mut boards = self.boards.write().await;
            let log = boards.entry(batch.channel_id.clone()).or_default();
            log.append(batch.events, self.clock.now())
        };

        if !confirmed.is_empty() {
            session.room.broadcast(
                session.session_id,
                true,
                Topic::ConfirmedBatch,
                &ConfirmedBatch {
                    events: confirmed.clone(),
                },
            )?;
        }

        {
            let mut s = self.stats.write().await;
            s.batches_accepted += 1;
            s.events_accepted += confirmed.len() as u64;
            s.duplicate_events += duplicates as u64;
        }
        log::debug!(
            "Batch {} on board {}: {} new, {duplicates} duplicate",
            batch.batch_id,
            batch.channel_id,
            confirmed.len()
        );
        Ok(BatchAck::ok(count))
    }

    /// Fan out a fire-and-forget element operation to the other sessions.
    async fn forward(&self, joined: Option<&Joined>, topic: Topic, payload: Vec<u8>) {
        let Some(session) = joined else {
            log::debug!("Dropping {topic} before join");
            return;
        };
        match topic {
            Topic::ClearAll => {
                if let Some(log) = self.boards.write().await.get_mut(&session.channel_id) {
                    log.clear();
                }
                log::info!("Board {} cleared by {}", session.channel_id, session.session_id);
            }
            Topic::AddElement | Topic::UpdateElement | Topic::RemoveElement => {}
            other => {
                log::debug!("Ignoring {other} notification");
                return;
            }
        }

        let frame = match (Frame::Push { topic, payload }).encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to encode {topic} push: {e}");
                return;
            }
        };
        session.room.broadcast_raw(RoomMessage {
            origin: session.session_id,
            echo: false,
            frame: Arc::new(frame),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, client: f64) -> Event {
        Event {
            id: id.to_string(),
            client_timestamp: client,
            server_timestamp: None,
            origin_session_id: Uuid::from_u128(1),
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9091");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.watermark_interval, Some(Duration::from_secs(5)));
        assert_eq!(RelayConfig::for_testing().bind_addr, "127.0.0.1:0");
    }

    #[test]
    fn test_board_log_stamps_in_batch_order() {
        let mut log = BoardLog::new();
        let (confirmed, duplicates) =
            log.append(vec![event("a", 9.0), event("b", 1.0)], 100.0);
        assert_eq!(duplicates, 0);
        assert_eq!(confirmed[0].server_timestamp, Some(100.0));
        // Same relay clock reading: strictly increasing anyway
        assert!(confirmed[1].server_timestamp.unwrap() > 100.0);

        let ids: Vec<String> = log.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(log.watermark(), confirmed[1].server_timestamp.unwrap());
    }

    #[test]
    fn test_board_log_is_idempotent_per_event() {
        let mut log = BoardLog::new();
        log.append(vec![event("a", 1.0)], 10.0);
        let (confirmed, duplicates) = log.append(vec![event("a", 1.0), event("b", 2.0)], 11.0);

        assert_eq!(duplicates, 1);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].id, "b");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_board_log_range_and_clear() {
        let mut log = BoardLog::new();
        log.append(vec![event("a", 0.0)], 10.0);
        log.append(vec![event("b", 0.0)], 20.0);
        log.append(vec![event("c", 0.0)], 30.0);

        let ids: Vec<String> = log.range(10.0, Some(20.0)).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(log.range(0.0, None).len(), 3);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.watermark(), 0.0);
        let (confirmed, _) = log.append(vec![event("d", 0.0)], 5.0);
        assert!(confirmed[0].server_timestamp.unwrap() > 30.0);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.batches_accepted, 0);
        assert_eq!(relay.bind_addr(), "127.0.0.1:9091");
        assert!(relay.board_events("board").await.is_empty());
        assert_eq!(relay.room_manager().room_count().await, 0);
    }
}
