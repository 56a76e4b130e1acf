//! Event identity and client clocks.
//!
//! Event ids combine a microsecond clock reading with a random suffix:
//! `evt_<micros>_<12 hex>`. Uniqueness is probabilistic; nothing is
//! verified by the server before accept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::protocol::Event;

/// Source of wall-clock seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall clock anchored at construction and advanced by `tokio::time::Instant`,
/// so paused-time tests observe the same timeline as the engine timers.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin_secs: f64,
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let origin_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            origin_secs,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin_secs + self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        self.set(self.now() + secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Stamps new events with an id and a client timestamp.
pub struct EventIdentity {
    clock: Arc<dyn Clock>,
    session_id: Uuid,
    /// Last issued client timestamp; timestamps never go backwards.
    last_timestamp: f64,
    issued: u64,
}

impl EventIdentity {
    pub fn new(clock: Arc<dyn Clock>, session_id: Uuid) -> Self {
        Self {
            clock,
            session_id,
            last_timestamp: f64::MIN,
            issued: 0,
        }
    }

    /// Create an event for `payload`, owned by this session.
    pub fn stamp(&mut self, payload: Vec<u8>) -> Event {
        let now = self.clock.now();
        // Wall clocks can step back; keep per-session timestamps monotonic.
        let client_timestamp = now.max(self.last_timestamp);
        self.last_timestamp = client_timestamp;
        self.issued += 1;

        Event {
            id: event_id(client_timestamp),
            client_timestamp,
            server_timestamp: None,
            origin_session_id: self.session_id,
            payload,
        }
    }

    /// Fresh batch identifier.
    pub fn batch_id(&self) -> String {
        format!("batch_{}", Uuid::new_v4().simple())
    }

    /// Current clock reading.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Number of events stamped so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }
}

fn event_id(timestamp: f64) -> String {
    let micros = (timestamp.max(0.0) * 1_000_000.0) as u64;
    let suffix = Uuid::new_v4().simple().to_string();
    format!("evt_{micros}_{}", &suffix[..12])
}
