//! Gap detection and merge of confirmed remote events.
//!
//! State machine (per session):
//!
//! ```text
//!            watermark gap                 missing range merged
//!   SYNCED ─────────────────► RECONCILING ─────────────────────► SYNCED
//!     │                           ▲   │
//!     │ disconnect                │   │ disconnect
//!     ▼                reconnect  │   ▼
//!  SUSPENDED ─────────────────────┘ SUSPENDED
//! ```
//!
//! Remote batches may arrive in any order. History is keyed by
//! `(timestamp, id)`, never by arrival position, and every event is
//! deduplicated by id before it reaches the rendering surface.
//!
//! Reference: Kleppmann, Chapter 5 — Replication Lag

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::protocol::Event;

// ───────────────────────────────────────────────────────────────────
// Local history
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct HistoryKey {
    timestamp: f64,
    id: String,
}

impl HistoryKey {
    fn of(event: &Event) -> Self {
        Self {
            timestamp: event.order_timestamp(),
            id: event.id.clone(),
        }
    }
}

impl PartialEq for HistoryKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HistoryKey {}

impl PartialOrd for HistoryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HistoryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Result of inserting one event into [`LocalHistory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryInsert {
    /// New id.
    Inserted,
    /// Known local event that just received its server timestamp.
    Confirmed,
    /// Already known; nothing changed.
    Duplicate,
}

/// Ordered, id-deduplicated event history for one board.
#[derive(Debug, Default)]
pub struct LocalHistory {
    ordered: BTreeMap<HistoryKey, Event>,
    index: HashMap<String, HistoryKey>,
    latest_confirmed: Option<f64>,
}

impl LocalHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, event: Event) -> HistoryInsert {
        if let Some(ts) = event.server_timestamp {
            self.latest_confirmed = Some(self.latest_confirmed.map_or(ts, |l| l.max(ts)));
        }

        let Some(key) = self.index.get(&event.id).cloned() else {
            let key = HistoryKey::of(&event);
            self.index.insert(event.id.clone(), key.clone());
            self.ordered.insert(key, event);
            return HistoryInsert::Inserted;
        };

        let adopt = event.server_timestamp.is_some()
            && self
                .ordered
                .get(&key)
                .is_some_and(|existing| existing.server_timestamp.is_none());
        if !adopt {
            return HistoryInsert::Duplicate;
        }

        // Re-key the local copy under its server timestamp
        match self.ordered.remove(&key) {
            Some(mut existing) => {
                existing.server_timestamp = event.server_timestamp;
                let new_key = HistoryKey::of(&existing);
                self.index.insert(existing.id.clone(), new_key.clone());
                self.ordered.insert(new_key, existing);
                HistoryInsert::Confirmed
            }
            None => HistoryInsert::Duplicate,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Event> {
        self.index.get(id).and_then(|key| self.ordered.get(key))
    }

    /// All events in `(timestamp, id)` order.
    pub fn events(&self) -> Vec<Event> {
        self.ordered.values().cloned().collect()
    }

    /// Events ordered after `since` and up to `until` (inclusive).
    pub fn range(&self, since: f64, until: Option<f64>) -> Vec<Event> {
        let start = HistoryKey {
            timestamp: since,
            id: String::new(),
        };
        self.ordered
            .range(start..)
            .map(|(_, event)| event)
            .filter(|event| event.order_timestamp() > since)
            .take_while(|event| until.map_or(true, |u| event.order_timestamp() <= u))
            .cloned()
            .collect()
    }

    /// Newest server timestamp seen.
    pub fn latest_confirmed(&self) -> Option<f64> {
        self.latest_confirmed
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.index.clear();
        self.latest_confirmed = None;
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconciliation manager
// ───────────────────────────────────────────────────────────────────

/// Session reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Synced,
    Reconciling,
    Suspended,
}

/// Missing-range request `(since, until]`; `until == None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRequest {
    pub since: f64,
    pub until: Option<f64>,
}

/// What a merge produced.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// New remote events to hand to the rendering surface, in order.
    pub render: Vec<Event>,
    /// New ids added to history (including own-session echoes).
    pub inserted: usize,
    /// Local events that picked up their server timestamp.
    pub confirmed: usize,
    pub duplicates: usize,
}

pub struct ReconciliationManager {
    session_id: Uuid,
    state: ReconcileState,
    /// Newest server timestamp known to be covered locally.
    watermark: f64,
    pending: Option<RangeRequest>,
    requested_at: Option<f64>,
    history: LocalHistory,
}

impl ReconciliationManager {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: ReconcileState::Synced,
            watermark: 0.0,
            pending: None,
            requested_at: None,
            history: LocalHistory::new(),
        }
    }

    /// Server-pushed watermark. Returns a request when it reveals a gap.
    pub fn on_watermark(&mut self, latest: f64, now: f64) -> Option<RangeRequest> {
        if self.state == ReconcileState::Suspended || latest <= self.watermark {
            return None;
        }
        if let Some(pending) = self.pending {
            if pending.until.map_or(true, |until| latest <= until) {
                return None; // already covered by the outstanding request
            }
        }

        let request = RangeRequest {
            since: self.watermark,
            until: Some(latest),
        };
        self.pending = Some(request);
        self.requested_at = Some(now);
        self.state = ReconcileState::Reconciling;
        Some(request)
    }

    /// Connection dropped.
    pub fn on_disconnect(&mut self) {
        self.state = ReconcileState::Suspended;
    }

    /// Connection (re-)established: always re-check everything after the watermark.
    pub fn on_reconnect(&mut self, now: f64) -> RangeRequest {
        let request = RangeRequest {
            since: self.watermark,
            until: None,
        };
        self.pending = Some(request);
        self.requested_at = Some(now);
        self.state = ReconcileState::Reconciling;
        request
    }

    /// Remember a locally recorded event so its confirmed echo is not re-rendered.
    pub fn record_local(&mut self, event: &Event) {
        self.history.insert(event.clone());
    }

    /// Merge confirmed remote events (push, snapshot or range response).
    pub fn merge(&mut self, mut events: Vec<Event>) -> MergeOutcome {
        events.sort_by(|a, b| {
            a.order_timestamp()
                .total_cmp(&b.order_timestamp())
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut outcome = MergeOutcome::default();
        for event in events {
            if let Some(ts) = event.server_timestamp {
                self.watermark = self.watermark.max(ts);
            }
            let render = (event.origin_session_id != self.session_id).then(|| event.clone());
            match self.history.insert(event) {
                HistoryInsert::Inserted => {
                    outcome.inserted += 1;
                    outcome.render.extend(render);
                }
                HistoryInsert::Confirmed => outcome.confirmed += 1,
                HistoryInsert::Duplicate => outcome.duplicates += 1,
            }
        }
        outcome
    }

    /// Merge the response to `answered`.
    ///
    /// Only `answered.until` counts as covered. The outstanding request is
    /// closed only when `answered` is that request; an older, narrower reply
    /// leaves a wider pending request open.
    pub fn complete_range(&mut self, answered: RangeRequest, events: Vec<Event>) -> MergeOutcome {
        let outcome = self.merge(events);
        if let Some(until) = answered.until {
            self.watermark = self.watermark.max(until);
        }
        if self.pending != Some(answered) {
            return outcome;
        }
        self.pending = None;
        self.requested_at = None;
        if self.state == ReconcileState::Reconciling {
            self.state = ReconcileState::Synced;
        }
        outcome
    }

    /// Outstanding request to re-send once `interval` seconds passed unanswered.
    pub fn due_for_rerequest(&mut self, now: f64, interval: f64) -> Option<RangeRequest> {
        if self.state != ReconcileState::Reconciling {
            return None;
        }
        let pending = self.pending?;
        let requested_at = self.requested_at?;
        if now - requested_at < interval {
            return None;
        }
        self.requested_at = Some(now);
        Some(pending)
    }

    /// Board cleared: forget history, keep the watermark.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    pub fn watermark(&self) -> f64 {
        self.watermark
    }

    pub fn pending(&self) -> Option<RangeRequest> {
        self.pending
    }

    pub fn history(&self) -> &LocalHistory {
        &self.history
    }
}
