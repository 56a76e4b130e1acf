//! Transport seam.
//!
//! The engine needs only three things from a transport:
//! - `send` / `request`: named message send, optionally acknowledged
//! - `take_events`: connect/disconnect signals and server pushes
//! - `is_connected`
//!
//! Acknowledgments are one-shot channels carrying the encoded ack body.
//! A dropped sender means the ack will never arrive (disconnect, reject).
//!
//! Implementations:
//! - [`memory::MemoryTransport`] — in-process, scriptable acks
//! - [`ws::WsTransport`] — WebSocket client with automatic reconnection

pub mod memory;
pub mod ws;

use tokio::sync::{mpsc, oneshot};

use crate::protocol::Topic;

/// Receiver for the encoded acknowledgment of one request.
pub type AckReceiver = oneshot::Receiver<Vec<u8>>;

/// Inbound transport signal.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Server-initiated message.
    Message { topic: Topic, payload: Vec<u8> },
}

/// A bidirectional messaging channel.
///
/// `send` and `request` must not block and must not call back into the
/// engine synchronously; the engine may hold its state lock while calling
/// them so that send order matches flush order.
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget send.
    fn send(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Send expecting an acknowledgment.
    fn request(&self, topic: Topic, payload: Vec<u8>) -> Result<AckReceiver, TransportError>;

    /// Take the inbound event stream (can only be taken once).
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    fn is_connected(&self) -> bool;
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    NotConnected,
    Closed,
    ConnectFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Transport not connected"),
            Self::Closed => write!(f, "Transport closed"),
            Self::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}
