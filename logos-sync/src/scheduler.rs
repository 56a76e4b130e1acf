//! Flush bookkeeping: swap-out, in-flight tracking, accept/retry.
//!
//! ```text
//! record ──► LocalEventQueue ──flush──► PendingBatch ──send──► transport
//!                 ▲                          │
//!                 │      nack / timeout      │  ack ok
//!                 └──── requeue (by seq) ◄───┤──────────► accepted
//! ```
//!
//! `begin_flush` empties the queue before the network call starts, so the
//! in-flight batch is always disjoint from events recorded afterwards.
//! Each batch carries the clear generation it was taken in; a board clear
//! bumps the generation so batches from before it are never requeued.
//! Timers and transport calls live in the engine; this type is plain state.

use std::collections::HashMap;

use crate::protocol::{Batch, Event};
use crate::queue::{LocalEventQueue, QueuedEvent};

/// A batch swapped out of the queue and awaiting acknowledgment.
#[derive(Debug)]
pub struct PendingBatch {
    batch_id: String,
    entries: Vec<QueuedEvent>,
    generation: u64,
}

impl PendingBatch {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form for `batchSend`.
    pub fn to_batch(&self, channel_id: &str) -> Batch {
        Batch {
            batch_id: self.batch_id.clone(),
            channel_id: channel_id.to_string(),
            events: self.entries.iter().map(|entry| entry.event.clone()).collect(),
        }
    }
}

/// Flush counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub batches_sent: u64,
    pub batches_accepted: u64,
    pub batches_retried: u64,
    pub events_recorded: u64,
    pub events_accepted: u64,
    pub events_evicted: u64,
    /// In-flight events dropped because the board was cleared under them
    pub events_discarded: u64,
}

/// Owns the local queue and the set of in-flight batches.
#[derive(Debug)]
pub struct BatchScheduler {
    queue: LocalEventQueue,
    /// batch_id → event count
    in_flight: HashMap<String, usize>,
    /// Bumped by every board clear.
    generation: u64,
    stats: SchedulerStats,
}

impl BatchScheduler {
    pub fn new(max_queue_len: Option<usize>) -> Self {
        Self {
            queue: LocalEventQueue::new(max_queue_len),
            in_flight: HashMap::new(),
            generation: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Queue a freshly recorded event. Returns the number of evictions.
    pub fn record(&mut self, event: Event) -> usize {
        self.stats.events_recorded += 1;
        let evicted = self.queue.push(event);
        self.stats.events_evicted += evicted as u64;
        evicted
    }

    /// Whether the size-threshold bypass should flush now.
    pub fn over_threshold(&self, threshold: usize) -> bool {
        threshold > 0 && self.queue.len() >= threshold
    }

    /// Swap the queue out into a new in-flight batch.
    ///
    /// No-op (None) when offline or when nothing is queued.
    pub fn begin_flush(&mut self, batch_id: String, online: bool) -> Option<PendingBatch> {
        if !online || self.queue.is_empty() {
            return None;
        }
        let entries = self.queue.take_all();
        self.in_flight.insert(batch_id.clone(), entries.len());
        self.stats.batches_sent += 1;
        Some(PendingBatch {
            batch_id,
            entries,
            generation: self.generation,
        })
    }

    /// Positive acknowledgment: the batch is retired for good.
    pub fn accept(&mut self, batch: PendingBatch) -> usize {
        self.in_flight.remove(&batch.batch_id);
        self.stats.batches_accepted += 1;
        self.stats.events_accepted += batch.entries.len() as u64;
        batch.entries.len()
    }

    /// Whether the board was cleared after `batch` was taken.
    pub fn is_stale(&self, batch: &PendingBatch) -> bool {
        batch.generation != self.generation
    }

    /// Negative acknowledgment, send error or timeout: merge back into the queue.
    ///
    /// A stale batch is dropped instead. Returns the number of evictions
    /// caused by the merge.
    pub fn retry(&mut self, batch: PendingBatch) -> usize {
        self.in_flight.remove(&batch.batch_id);
        if self.is_stale(&batch) {
            self.stats.events_discarded += batch.entries.len() as u64;
            return 0;
        }
        self.stats.batches_retried += 1;
        let evicted = self.queue.requeue(batch.entries);
        self.stats.events_evicted += evicted as u64;
        evicted
    }

    /// Forget an in-flight batch without touching the queue (session ended).
    pub fn abandon(&mut self, batch: PendingBatch) {
        self.in_flight.remove(&batch.batch_id);
    }

    /// Board cleared: drop the queue and orphan every in-flight batch.
    ///
    /// Returns the number of queued events dropped.
    pub fn clear(&mut self) -> usize {
        self.generation += 1;
        self.in_flight.clear();
        self.queue.clear()
    }

    pub fn queued_events(&self) -> Vec<Event> {
        self.queue.events()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_batches(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_events(&self) -> usize {
        self.in_flight.values().sum()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }
}
