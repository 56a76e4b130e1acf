//! Round-trip latency probe.
//!
//! The engine sends a `ping` carrying the local send time every probe
//! interval while online. On the acknowledgment the estimate becomes
//! `received_at - sent_at`. Each sample replaces the previous one; a ping
//! that is never acknowledged is counted as skipped and changes nothing.

use crate::protocol::PingRequest;

/// Latest latency estimate plus probe counters.
#[derive(Debug, Clone, Default)]
pub struct LatencyProbe {
    estimate: Option<f64>,
    samples: u64,
    skipped: u64,
}

impl LatencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the ping payload for a probe sent at `now`.
    pub fn ping(&self, now: f64) -> PingRequest {
        PingRequest { client_time: now }
    }

    /// Record an acknowledged probe and return the new estimate in seconds.
    pub fn record(&mut self, sent_at: f64, received_at: f64) -> f64 {
        let latency = (received_at - sent_at).max(0.0);
        self.estimate = Some(latency);
        self.samples += 1;
        latency
    }

    /// A probe went unanswered (offline, dropped or timed out).
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    /// Latest estimate in seconds; None until the first acknowledged probe.
    pub fn estimate(&self) -> Option<f64> {
        self.estimate
    }

    pub fn estimate_ms(&self) -> Option<f64> {
        self.estimate.map(|secs| secs * 1000.0)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
