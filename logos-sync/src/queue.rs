//! Ordered queue of events not yet acknowledged by the transport.
//!
//! Every entry carries a local sequence number assigned on append. Flushes
//! swap the whole queue out; failed batches are merged back by sequence, so
//! a retry never reorders events relative to one another, even when several
//! batches fail out of order.

use std::collections::VecDeque;

use crate::protocol::Event;

/// An event plus its local append sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub seq: u64,
    pub event: Event,
}

/// Ordered, appendable sequence of pending events.
#[derive(Debug)]
pub struct LocalEventQueue {
    entries: VecDeque<QueuedEvent>,
    next_seq: u64,
    /// Oldest events are evicted past this length (None = unbounded).
    max_len: Option<usize>,
    evicted_total: u64,
}

impl LocalEventQueue {
    /// Create a queue with an optional length cap.
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_len.unwrap_or(1024).min(1024)),
            next_seq: 0,
            max_len,
            evicted_total: 0,
        }
    }

    /// Append an event. Returns the number of old events evicted to make room.
    pub fn push(&mut self, event: Event) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(QueuedEvent { seq, event });
        self.enforce_cap()
    }

    /// Swap out the whole queue, leaving it empty.
    pub fn take_all(&mut self) -> Vec<QueuedEvent> {
        std::mem::take(&mut self.entries).into()
    }

    /// Merge previously taken entries back in sequence order.
    ///
    /// Returns the number of events evicted if the merge overflows the cap.
    pub fn requeue(&mut self, mut returned: Vec<QueuedEvent>) -> usize {
        if returned.is_empty() {
            return 0;
        }
        returned.sort_by_key(|entry| entry.seq);

        let current = std::mem::take(&mut self.entries);
        let mut merged = VecDeque::with_capacity(current.len() + returned.len());
        let mut left = returned.into_iter().peekable();
        let mut right = current.into_iter().peekable();

        loop {
            let take_left = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => l.seq < r.seq,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_left { left.next() } else { right.next() };
            if let Some(entry) = next {
                merged.push_back(entry);
            }
        }

        self.entries = merged;
        self.enforce_cap()
    }

    fn enforce_cap(&mut self) -> usize {
        let Some(max_len) = self.max_len else {
            return 0;
        };
        let mut evicted = 0;
        while self.entries.len() > max_len {
            self.entries.pop_front();
            evicted += 1;
        }
        self.evicted_total += evicted as u64;
        evicted
    }

    /// Snapshot of the pending events in order.
    pub fn events(&self) -> Vec<Event> {
        self.entries.iter().map(|entry| entry.event.clone()).collect()
    }

    /// Drop every pending event. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    /// Total events evicted since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}
