//! # logos-sync — Real-time event synchronization for collaborative boards
//!
//! Renders local events immediately, ships them to a shared transport in
//! latency-tuned batches and fills gaps left by disconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  record_event   ┌──────────────┐   batchSend/ping   ┌─────────────┐
//! │ UI / surface │ ──────────────► │  SyncEngine  │ ─────────────────► │  Transport  │
//! │ (RenderSink) │ ◄────────────── │ (per board)  │ ◄───────────────── │ (ws/memory) │
//! └──────────────┘  render/clear   └──────┬───────┘  pushes, acks      └──────┬──────┘
//!                                         │                                   │
//!                      ┌──────────────────┼──────────────────┐         ┌──────┴──────┐
//!                      ▼                  ▼                  ▼         │ RelayServer │
//!               BatchScheduler     LatencyProbe →     Reconciliation   │ (reference) │
//!               (queue, retry)     AdaptivePolicy     Manager          └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire types and bincode codec
//! - [`identity`] — Event ids, client timestamps, clocks
//! - [`queue`] / [`scheduler`] — Ordered local queue, swap-out flush, retry
//! - [`probe`] / [`policy`] — Latency measurement and batching tiers
//! - [`reconcile`] — Watermark gap detection, dedup, local history
//! - [`render`] — Rendering-surface seam
//! - [`transport`] — Transport seam, in-memory and WebSocket implementations
//! - [`engine`] — The session façade
//! - [`broadcast`] / [`relay`] — Reference relay with per-board fan-out
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | Flush interval | 100 ms (re-tuned to 150/200 ms by latency) |
//! | Size-triggered flush | 50 queued events |
//! | Latency probe | every 5 s |
//! | Ack timeout | 10 s |
//! | Queue cap | 10 000 events, oldest evicted |

pub mod protocol;
pub mod identity;
pub mod queue;
pub mod scheduler;
pub mod probe;
pub mod policy;
pub mod reconcile;
pub mod render;
pub mod transport;
pub mod engine;
pub mod broadcast;
pub mod relay;

// Re-exports for convenience
pub use protocol::{
    AckStatus, Batch, BatchAck, ElementOp, Event, Frame, ProtocolError, StrokeSegment, Topic,
};
pub use identity::{Clock, EventIdentity, ManualClock, SystemClock};
pub use policy::{AdaptivePolicy, BatchingParams};
pub use reconcile::{LocalHistory, ReconcileState, ReconciliationManager};
pub use render::{NullSink, RecordingSink, RenderSink};
pub use scheduler::SchedulerStats;
pub use transport::memory::{AckPolicy, MemoryTransport};
pub use transport::ws::{WsConfig, WsTransport};
pub use transport::{Transport, TransportError, TransportEvent};
pub use engine::{
    EngineConfig, EngineEvent, RetryReason, SessionContext, SyncEngine, SyncError,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use relay::{BoardLog, RelayConfig, RelayServer, RelayStats};
