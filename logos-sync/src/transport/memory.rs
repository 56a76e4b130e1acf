//! In-process transport with scriptable acknowledgments.
//!
//! Every send is logged. Requests are either answered on the spot
//! ([`AckPolicy::AcceptAll`] / [`AckPolicy::RejectAll`]) or parked as
//! [`PendingRequest`]s for the caller to answer, drop or ignore
//! ([`AckPolicy::Manual`]). Connection changes and server pushes are
//! injected with [`MemoryTransport::set_connected`] and
//! [`MemoryTransport::push`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::{AckReceiver, Transport, TransportError, TransportEvent};
use crate::protocol::{
    self, Batch, BatchAck, MissingRange, PingAck, ProtocolError, Topic,
};

/// How requests are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Park requests until the caller answers them.
    Manual,
    /// Acknowledge batches with `ok`, pings with zero latency, ranges empty.
    AcceptAll,
    /// Reject batches; drop every other ack.
    RejectAll,
}

/// One logged send.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub acked: bool,
}

/// A request waiting for its acknowledgment.
#[derive(Debug)]
pub struct PendingRequest {
    pub topic: Topic,
    pub payload: Vec<u8>,
    responder: oneshot::Sender<Vec<u8>>,
}

impl PendingRequest {
    /// Answer with an encoded ack body. Returns false if nobody is listening.
    pub fn reply<T: Serialize>(self, ack: &T) -> bool {
        match protocol::encode(ack) {
            Ok(bytes) => self.responder.send(bytes).is_ok(),
            Err(_) => false,
        }
    }

    pub fn reply_raw(self, bytes: Vec<u8>) -> bool {
        self.responder.send(bytes).is_ok()
    }

    /// Decode the request payload.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        protocol::decode(&self.payload)
    }
}

pub struct MemoryTransport {
    connected: AtomicBool,
    policy: Mutex<AckPolicy>,
    sent: Mutex<Vec<SentMessage>>,
    pending: Mutex<Vec<PendingRequest>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl MemoryTransport {
    /// Connected transport with manual acknowledgments.
    pub fn new() -> Arc<Self> {
        Self::with_policy(AckPolicy::Manual)
    }

    pub fn with_policy(policy: AckPolicy) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            policy: Mutex::new(policy),
            sent: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn set_policy(&self, policy: AckPolicy) {
        if let Ok(mut current) = self.policy.lock() {
            *current = policy;
        }
    }

    /// Flip the connection and notify the subscriber.
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was == connected {
            return;
        }
        let event = if connected {
            TransportEvent::Connected
        } else {
            // Outstanding acks can no longer arrive
            if let Ok(mut pending) = self.pending.lock() {
                pending.clear();
            }
            TransportEvent::Disconnected
        };
        let _ = self.events_tx.try_send(event);
    }

    /// Inject a server push.
    pub fn push<T: Serialize>(&self, topic: Topic, body: &T) -> Result<(), ProtocolError> {
        let payload = protocol::encode(body)?;
        let _ = self
            .events_tx
            .try_send(TransportEvent::Message { topic, payload });
        Ok(())
    }

    /// Every message sent so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Payloads sent on one topic.
    pub fn sent_on(&self, topic: Topic) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload)
            .collect()
    }

    /// Decoded `batchSend` payloads in send order.
    pub fn batches(&self) -> Vec<Batch> {
        self.sent_on(Topic::BatchSend)
            .iter()
            .filter_map(|payload| protocol::decode(payload).ok())
            .collect()
    }

    /// Take parked requests for one topic, oldest first.
    pub fn take_pending(&self, topic: Topic) -> Vec<PendingRequest> {
        let Ok(mut pending) = self.pending.lock() else {
            return Vec::new();
        };
        let (matching, rest): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|request| request.topic == topic);
        *pending = rest;
        matching
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn log(&self, topic: Topic, payload: &[u8], acked: bool) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                topic,
                payload: payload.to_vec(),
                acked,
            });
        }
    }

    fn auto_ack(policy: AckPolicy, topic: Topic, payload: &[u8]) -> Option<Vec<u8>> {
        let encoded = match (policy, topic) {
            (AckPolicy::AcceptAll, Topic::BatchSend) => {
                let count = protocol::decode::<Batch>(payload).map_or(0, |b| b.len());
                protocol::encode(&BatchAck::ok(count))
            }
            (AckPolicy::AcceptAll, Topic::Ping) => protocol::encode(&PingAck { latency: 0.0 }),
            (AckPolicy::AcceptAll, Topic::MissingRange) => {
                protocol::encode(&MissingRange { events: Vec::new() })
            }
            (AckPolicy::RejectAll, Topic::BatchSend) => {
                protocol::encode(&BatchAck::error("rejected"))
            }
            _ => return None,
        };
        encoded.ok()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.log(topic, &payload, false);
        Ok(())
    }

    fn request(&self, topic: Topic, payload: Vec<u8>) -> Result<AckReceiver, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.log(topic, &payload, true);

        let (tx, rx) = oneshot::channel();
        let policy = self.policy.lock().map(|p| *p).unwrap_or(AckPolicy::Manual);
        match policy {
            AckPolicy::Manual => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.push(PendingRequest {
                        topic,
                        payload,
                        responder: tx,
                    });
                }
            }
            policy => {
                // No auto-ack for this topic: dropping `tx` tells the caller none is coming
                if let Some(ack) = Self::auto_ack(policy, topic, &payload) {
                    let _ = tx.send(ack);
                }
            }
        }
        Ok(rx)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
