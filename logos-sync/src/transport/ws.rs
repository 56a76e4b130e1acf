//! WebSocket transport for the sync engine.
//!
//! Provides:
//! - Connection lifecycle (connect, automatic reconnect, shutdown)
//! - Request/ack correlation over [`Frame::Request`] / [`Frame::Ack`]
//! - Server pushes forwarded as [`TransportEvent::Message`]
//!
//! ```text
//!            ┌──────────── supervisor task ────────────┐
//!  request ─►│ outgoing ──► writer ──► ws ──► reader ──┼─► Ack  → pending[id]
//!            │  (unbounded)                            │   Push → events
//!            └── on close: offline, drop acks, retry ──┘
//! ```
//!
//! Every connection starts with a [`Frame::Join`] for the configured board.
//! Outstanding acks are dropped when a connection ends, so callers observe
//! a closed channel instead of waiting forever.
//!
//! Reference: Kleppmann, Chapter 8 — The Trouble with Distributed Systems

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::{AckReceiver, Transport, TransportError, TransportEvent};
use crate::protocol::{Frame, Topic};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9091`
    pub url: String,
    /// Board joined on every connection
    pub channel_id: String,
    pub session_id: Uuid,
    /// Pause between reconnection attempts
    pub reconnect_delay: Duration,
    /// Capacity of the inbound event channel
    pub event_capacity: usize,
}

impl WsConfig {
    pub fn new(url: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel_id: channel_id.into(),
            session_id: Uuid::new_v4(),
            reconnect_delay: Duration::from_secs(1),
            event_capacity: 256,
        }
    }

    /// Fast reconnects for tests.
    pub fn for_testing(url: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(50),
            ..Self::new(url, channel_id)
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }
}

struct Shared {
    config: WsConfig,
    connected: AtomicBool,
    next_id: AtomicU64,
    /// Present only while a connection is live.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl Shared {
    async fn set_online(&self, outgoing: mpsc::UnboundedSender<Frame>) {
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = Some(outgoing);
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Connected).await;
    }

    fn go_offline(&self) -> bool {
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = None;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        self.connected.swap(false, Ordering::SeqCst)
    }

    async fn route(&self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(Frame::Ack { id, payload }) => {
                let responder = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
                match responder {
                    Some(responder) => {
                        let _ = responder.send(payload);
                    }
                    None => log::debug!("Ack for unknown request {id}"),
                }
            }
            Ok(Frame::Push { topic, payload }) => {
                let _ = self
                    .events_tx
                    .send(TransportEvent::Message { topic, payload })
                    .await;
            }
            Ok(other) => log::warn!("Unexpected frame from relay: {other:?}"),
            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
        }
    }

    /// Drive one connection until it closes.
    async fn run_session(&self, ws: WsStream) {
        let (mut writer, mut reader) = ws.split();

        let join = Frame::Join {
            channel_id: self.config.channel_id.clone(),
            session_id: self.config.session_id,
        };
        let joined = match join.encode() {
            Ok(bytes) => writer.send(Message::Binary(bytes.into())).await.is_ok(),
            Err(e) => {
                log::error!("Failed to encode join frame: {e}");
                false
            }
        };
        if !joined {
            return;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        self.set_online(out_tx).await;
        log::info!(
            "Connected to {} (board {})",
            self.config.url,
            self.config.channel_id
        );

        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let bytes = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if writer.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => self.route(&data).await,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                },
            }
        }

        if self.go_offline() {
            log::info!("Disconnected from {}", self.config.url);
            let _ = self.events_tx.send(TransportEvent::Disconnected).await;
        }
    }

    async fn supervise(self: Arc<Self>, first: WsStream) {
        let mut stream = Some(first);
        loop {
            if let Some(ws) = stream.take() {
                self.run_session(ws).await;
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
            match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => stream = Some(ws),
                Err(e) => log::debug!("Reconnect to {} failed: {e}", self.config.url),
            }
        }
    }
}

/// WebSocket client implementing [`Transport`].
pub struct WsTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Connect to the relay and keep the connection alive in the background.
    ///
    /// Fails only if the first connection attempt fails.
    pub async fn connect(config: WsConfig) -> Result<Arc<Self>, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        let supervisor = tokio::spawn(shared.clone().supervise(ws));

        Ok(Arc::new(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        }))
    }

    /// Stop reconnecting and close the current connection.
    pub fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
        self.shared.go_offline();
    }

    pub fn config(&self) -> &WsConfig {
        &self.shared.config
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.config.session_id
    }

    fn outgoing(&self) -> Result<mpsc::UnboundedSender<Frame>, TransportError> {
        self.shared
            .outgoing
            .lock()
            .map_err(|_| TransportError::Closed)?
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

impl Transport for WsTransport {
    fn send(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError> {
        self.outgoing()?
            .send(Frame::Notify { topic, payload })
            .map_err(|_| TransportError::Closed)
    }

    fn request(&self, topic: Topic, payload: Vec<u8>) -> Result<AckReceiver, TransportError> {
        let outgoing = self.outgoing()?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .map_err(|_| TransportError::Closed)?
            .insert(id, tx);

        if outgoing.send(Frame::Request { id, topic, payload }).is_err() {
            if let Ok(mut pending) = self.shared.pending.lock() {
                pending.remove(&id);
            }
            return Err(TransportError::Closed);
        }
        Ok(rx)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.shared.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
