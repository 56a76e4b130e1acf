//! Rendering-surface seam.
//!
//! The engine hands every event to a [`RenderSink`]: local events right
//! after they are recorded, remote events once they pass deduplication.
//! Sinks are called without any engine lock held.

use std::sync::Mutex;

use crate::protocol::{ElementOp, Event};

/// A 2D drawing surface that paints ordered events.
pub trait RenderSink: Send + Sync {
    /// Paint one event.
    fn render(&self, event: &Event);

    /// Wipe the surface (board cleared).
    fn clear(&self) {}

    /// Apply a remote element operation (shape, text, image…).
    fn apply_element(&self, _op: &ElementOp) {}
}

/// Sink that discards everything (headless sessions).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn render(&self, _event: &Event) {}
}

/// Sink that keeps everything it was asked to draw.
#[derive(Debug, Default)]
pub struct RecordingSink {
    rendered: Mutex<Vec<Event>>,
    elements: Mutex<Vec<ElementOp>>,
    clears: Mutex<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendered(&self) -> Vec<Event> {
        self.rendered.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn rendered_ids(&self) -> Vec<String> {
        self.rendered().into_iter().map(|e| e.id).collect()
    }

    pub fn render_count(&self) -> usize {
        self.rendered.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn elements(&self) -> Vec<ElementOp> {
        self.elements.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear_count(&self) -> usize {
        self.clears.lock().map(|c| *c).unwrap_or_default()
    }
}

impl RenderSink for RecordingSink {
    fn render(&self, event: &Event) {
        if let Ok(mut rendered) = self.rendered.lock() {
            rendered.push(event.clone());
        }
    }

    fn clear(&self) {
        if let Ok(mut rendered) = self.rendered.lock() {
            rendered.clear();
        }
        if let Ok(mut clears) = self.clears.lock() {
            *clears += 1;
        }
    }

    fn apply_element(&self, op: &ElementOp) {
        if let Ok(mut elements) = self.elements.lock() {
            elements.push(op.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        let event = Event {
            id: "evt_1".into(),
            client_timestamp: 1.0,
            server_timestamp: None,
            origin_session_id: Uuid::nil(),
            payload: Vec::new(),
        };
        sink.render(&event);
        sink.apply_element(&ElementOp::Remove {
            element_id: "img_1".into(),
        });
        assert_eq!(sink.rendered_ids(), vec!["evt_1"]);
        assert_eq!(sink.elements().len(), 1);

        sink.clear();
        assert_eq!(sink.render_count(), 0);
        assert_eq!(sink.clear_count(), 1);
    }
}
