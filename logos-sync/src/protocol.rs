//! Wire protocol for board event synchronization.
//!
//! Every payload is a serde type encoded with bincode (standard config).
//! Over a WebSocket each message travels inside a [`Frame`]:
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────┬──────────────────────┐
//! │ frame kind   │ request id   │ topic     │ payload              │
//! │ Join/Request │ u64 (Request │ 1 byte    │ bincode-encoded body │
//! │ Notify/Ack/  │  and Ack)    │           │ (Batch, Watermark…)  │
//! │ Push         │              │           │                      │
//! └──────────────┴──────────────┴───────────┴──────────────────────┘
//! ```
//!
//! `Request`/`Ack` pairs carry the per-call acknowledgment; `Notify` is
//! fire-and-forget; `Push` is server-initiated.
//!
//! Reference: Kleppmann, Chapter 4 — Encoding and Evolution

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named message topics exchanged with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Topic {
    /// Latency probe (engine → transport, acked with [`PingAck`])
    Ping = 1,
    /// Batched events (engine → transport, acked with [`BatchAck`])
    BatchSend = 2,
    /// Element operations (fire-and-forget, both directions)
    AddElement = 3,
    UpdateElement = 4,
    RemoveElement = 5,
    ClearAll = 6,
    /// Full event history for a board (transport → engine)
    HistorySnapshot = 7,
    /// Events confirmed by the authoritative side (transport → engine)
    ConfirmedBatch = 8,
    /// Newest server timestamp (transport → engine)
    Watermark = 9,
    /// Missing-range request (engine → transport) and its response
    MissingRange = 10,
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Ping => "ping",
            Topic::BatchSend => "batchSend",
            Topic::AddElement => "addElement",
            Topic::UpdateElement => "updateElement",
            Topic::RemoveElement => "removeElement",
            Topic::ClearAll => "clearAll",
            Topic::HistorySnapshot => "historySnapshot",
            Topic::ConfirmedBatch => "confirmedBatch",
            Topic::Watermark => "watermark",
            Topic::MissingRange => "missingRange",
        }
    }

    /// Look up a topic by its wire name.
    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        let topic = match name {
            "ping" => Topic::Ping,
            "batchSend" => Topic::BatchSend,
            "addElement" => Topic::AddElement,
            "updateElement" => Topic::UpdateElement,
            "removeElement" => Topic::RemoveElement,
            "clearAll" => Topic::ClearAll,
            "historySnapshot" => Topic::HistorySnapshot,
            "confirmedBatch" => Topic::ConfirmedBatch,
            "watermark" => Topic::Watermark,
            "missingRange" => Topic::MissingRange,
            other => return Err(ProtocolError::UnknownTopic(other.to_string())),
        };
        Ok(topic)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic, immutable board event (e.g. one drawn segment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Clock reading plus random suffix; never verified by the server.
    pub id: String,
    /// Seconds, monotonic per originating session only.
    pub client_timestamp: f64,
    /// Assigned by the authoritative side on ingestion.
    pub server_timestamp: Option<f64>,
    /// Producing participant.
    pub origin_session_id: Uuid,
    /// Opaque to the engine.
    pub payload: Vec<u8>,
}

impl Event {
    /// Timestamp used for ordering: server time once confirmed, client time before.
    pub fn order_timestamp(&self) -> f64 {
        self.server_timestamp.unwrap_or(self.client_timestamp)
    }

    pub fn is_confirmed(&self) -> bool {
        self.server_timestamp.is_some()
    }
}

/// `batchSend` payload: events swapped out of the queue at flush time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub channel_id: String,
    pub events: Vec<Event>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Acknowledgment status for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AckStatus {
    Ok,
    Error(String),
}

/// `batchSend` acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAck {
    pub status: AckStatus,
    pub count: u32,
}

impl BatchAck {
    pub fn ok(count: usize) -> Self {
        Self {
            status: AckStatus::Ok,
            count: count as u32,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error(reason.into()),
            count: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// `ping` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub client_time: f64,
}

/// `ping` acknowledgment. The engine measures latency locally; the
/// server-reported value is informational.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingAck {
    pub latency: f64,
}

/// `confirmedBatch` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedBatch {
    pub events: Vec<Event>,
}

/// `watermark` push.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub latest_timestamp: f64,
}

/// `missingRange` request: events with server time in `(since, until]`.
/// `until == None` means "everything newer than `since`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingRangeRequest {
    pub channel_id: String,
    pub since: f64,
    pub until: Option<f64>,
}

impl MissingRangeRequest {
    /// Whether a server timestamp falls inside the requested range.
    pub fn contains(&self, timestamp: f64) -> bool {
        timestamp > self.since && self.until.map_or(true, |until| timestamp <= until)
    }
}

/// `missingRange` response (as an ack or a push).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingRange {
    pub events: Vec<Event>,
}

/// Fire-and-forget element operations (shapes, text, images…).
///
/// Element bodies are opaque; only the element id is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementOp {
    Add { element_id: String, data: Vec<u8> },
    Update { element_id: String, data: Vec<u8> },
    Remove { element_id: String },
    ClearAll,
}

impl ElementOp {
    /// Topic this operation travels on.
    pub fn topic(&self) -> Topic {
        match self {
            ElementOp::Add { .. } => Topic::AddElement,
            ElementOp::Update { .. } => Topic::UpdateElement,
            ElementOp::Remove { .. } => Topic::RemoveElement,
            ElementOp::ClearAll => Topic::ClearAll,
        }
    }

    pub fn element_id(&self) -> Option<&str> {
        match self {
            ElementOp::Add { element_id, .. }
            | ElementOp::Update { element_id, .. }
            | ElementOp::Remove { element_id } => Some(element_id),
            ElementOp::ClearAll => None,
        }
    }
}

/// Typed payload for one freehand stroke segment.
///
/// Convenience for callers; the engine carries payloads as opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrokeSegment {
    pub from: [f32; 2],
    pub to: [f32; 2],
    /// RGBA
    pub color: [f32; 4],
    pub width: f32,
    pub eraser: bool,
}

impl StrokeSegment {
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// WebSocket envelope used by the `ws` transport and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on a connection: join a board.
    Join { channel_id: String, session_id: Uuid },
    /// Message expecting an [`Frame::Ack`] with the same id.
    Request { id: u64, topic: Topic, payload: Vec<u8> },
    /// Fire-and-forget message.
    Notify { topic: Topic, payload: Vec<u8> },
    /// Acknowledgment for a request.
    Ack { id: u64, payload: Vec<u8> },
    /// Server-initiated message.
    Push { topic: Topic, payload: Vec<u8> },
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Encode any wire type with bincode.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// Decode any wire type with bincode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnknownTopic(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownTopic(name) => write!(f, "Unknown topic: {name}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, server: Option<f64>) -> Event {
        Event {
            id: id.to_string(),
            client_timestamp: 1.0,
            server_timestamp: server,
            origin_session_id: Uuid::new_v4(),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_batch_roundtrip_keeps_order() {
        let batch = Batch {
            batch_id: "batch_1".into(),
            channel_id: "board".into(),
            events: vec![event("a", None), event("b", None), event("c", None)],
        };
        let decoded: Batch = decode(&encode(&batch).unwrap()).unwrap();

        let ids: Vec<&str> = decoded.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_topic_names() {
        for topic in [
            Topic::Ping,
            Topic::BatchSend,
            Topic::AddElement,
            Topic::UpdateElement,
            Topic::RemoveElement,
            Topic::ClearAll,
            Topic::HistorySnapshot,
            Topic::ConfirmedBatch,
            Topic::Watermark,
            Topic::MissingRange,
        ] {
            assert_eq!(Topic::from_name(topic.as_str()).unwrap(), topic);
        }
        assert_eq!(Topic::BatchSend.to_string(), "batchSend");
        assert!(matches!(
            Topic::from_name("batch_drawing"),
            Err(ProtocolError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_frame_request_ack() {
        let request = Frame::Request {
            id: 7,
            topic: Topic::Ping,
            payload: encode(&PingRequest { client_time: 12.5 }).unwrap(),
        };
        match Frame::decode(&request.encode().unwrap()).unwrap() {
            Frame::Request { id, topic, payload } => {
                assert_eq!(id, 7);
                assert_eq!(topic, Topic::Ping);
                let ping: PingRequest = decode(&payload).unwrap();
                assert_eq!(ping.client_time, 12.5);
            }
            other => panic!("Expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_ack_status() {
        assert!(BatchAck::ok(3).is_ok());
        assert_eq!(BatchAck::ok(3).count, 3);
        let failed = BatchAck::error("board closed");
        assert!(!failed.is_ok());
        assert_eq!(failed.status, AckStatus::Error("board closed".into()));
    }

    #[test]
    fn test_missing_range_bounds() {
        let bounded = MissingRangeRequest {
            channel_id: "board".into(),
            since: 1.0,
            until: Some(2.0),
        };
        assert!(!bounded.contains(1.0));
        assert!(bounded.contains(1.5));
        assert!(bounded.contains(2.0));
        assert!(!bounded.contains(2.1));

        let open = MissingRangeRequest {
            until: None,
            ..bounded
        };
        assert!(open.contains(1_000.0));
        assert!(!open.contains(0.5));
    }

    #[test]
    fn test_order_timestamp_prefers_server_time() {
        assert_eq!(event("a", None).order_timestamp(), 1.0);
        assert_eq!(event("a", Some(9.0)).order_timestamp(), 9.0);
        assert!(event("a", Some(9.0)).is_confirmed());
    }

    #[test]
    fn test_element_op_topics() {
        let add = ElementOp::Add {
            element_id: "shape_1".into(),
            data: vec![1],
        };
        assert_eq!(add.topic(), Topic::AddElement);
        assert_eq!(add.element_id(), Some("shape_1"));
        assert_eq!(ElementOp::ClearAll.topic(), Topic::ClearAll);
        assert_eq!(ElementOp::ClearAll.element_id(), None);
    }

    #[test]
    fn test_stroke_segment_payload() {
        let stroke = StrokeSegment {
            from: [10.0, 20.0],
            to: [12.5, 22.0],
            color: [0.0, 0.0, 0.0, 1.0],
            width: 3.0,
            eraser: false,
        };
        let payload = stroke.to_payload().unwrap();
        assert_eq!(StrokeSegment::from_payload(&payload).unwrap(), stroke);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Frame::decode(&garbage).is_err());
        assert!(decode::<Batch>(&garbage).is_err());
    }
}
