//! Session engine: the façade UI code and rendering surfaces talk to.
//!
//! ```text
//!  record_event ──► render ──► BatchScheduler ──(timer | threshold)──► batchSend
//!                                   ▲                                     │
//!                                   └──────── requeue on nack/timeout ◄───┘
//!
//!  transport events ──► driver task ──► ReconciliationManager ──► render
//!  ping interval ────►      │      ──► LatencyProbe ──► AdaptivePolicy ──► retune flush timer
//! ```
//!
//! One driver task per session runs the flush timer, the ping timer and the
//! transport event stream. Session state lives behind a plain mutex that is
//! never held across an `.await`, so `record_event` and `flush` return
//! synchronously. Acknowledgments are awaited on spawned tasks and ignored
//! once the session has stopped.
//!
//! Reference: Kleppmann, Chapter 11 — Stream Processing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::identity::{Clock, EventIdentity, SystemClock};
use crate::policy::{AdaptivePolicy, BatchingParams};
use crate::probe::LatencyProbe;
use crate::protocol::{
    self, AckStatus, BatchAck, ConfirmedBatch, ElementOp, Event, MissingRange,
    MissingRangeRequest, ProtocolError, Topic, Watermark,
};
use crate::reconcile::{RangeRequest, ReconcileState, ReconciliationManager};
use crate::render::RenderSink;
use crate::scheduler::{BatchScheduler, PendingBatch, SchedulerStats};
use crate::transport::{AckReceiver, Transport, TransportError, TransportEvent};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Initial flush timer period (re-tuned by the latency probe)
    pub flush_interval: Duration,
    /// Queue length that triggers an immediate flush from `record_event`
    pub flush_threshold: usize,
    /// Latency probe period
    pub ping_interval: Duration,
    /// How long to wait for an acknowledgment; `None` waits forever
    pub ack_timeout: Option<Duration>,
    /// Queue cap with oldest-event eviction; `None` is unbounded
    pub max_queue_len: Option<usize>,
    /// Re-send an unanswered missing-range request after this long
    pub rerequest_interval: Option<Duration>,
    pub policy: AdaptivePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            flush_threshold: 50,
            ping_interval: Duration::from_secs(5),
            ack_timeout: Some(Duration::from_secs(10)),
            max_queue_len: Some(10_000),
            rerequest_interval: None,
            policy: AdaptivePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Short ack timeout and a small queue cap for tests.
    pub fn for_testing() -> Self {
        Self {
            ack_timeout: Some(Duration::from_secs(1)),
            max_queue_len: Some(1_000),
            ..Self::default()
        }
    }
}

/// Identity of one collaborative session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Board the session belongs to
    pub channel_id: String,
    /// This participant
    pub session_id: Uuid,
}

impl SessionContext {
    /// New session with a random id.
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            session_id: Uuid::new_v4(),
        }
    }

    pub fn with_session(channel_id: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            channel_id: channel_id.into(),
            session_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Observable signals
// ───────────────────────────────────────────────────────────────────

/// Why a batch went back into the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    /// Negative acknowledgment (or an ack that could not be decoded)
    Rejected(String),
    /// The transport refused the send
    TransportError(String),
    /// The transport dropped the ack (e.g. disconnect)
    AckDropped,
    AckTimeout,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::AckDropped => write!(f, "ack dropped"),
            Self::AckTimeout => write!(f, "ack timed out"),
        }
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    BatchAccepted { batch_id: String, count: usize },
    BatchRetried {
        batch_id: String,
        count: usize,
        reason: RetryReason,
    },
    /// A probe completed; `params` are the re-tuned batching parameters
    LatencyUpdated { latency: f64, params: BatchingParams },
    ConnectionChanged { online: bool },
    ReconcileStateChanged(ReconcileState),
    MissingRangeRequested { since: f64, until: Option<f64> },
    /// Remote events handed to the rendering surface
    RemoteEvents { count: usize },
    /// Oldest queued events dropped by the queue cap
    EventsEvicted { count: usize },
    BoardCleared,
}

/// Engine errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// `start` was called outside a tokio runtime
    NoRuntime,
    /// Another session already owns the transport's event stream
    TransportInUse,
    Stopped,
    Offline,
    Protocol(ProtocolError),
    Transport(TransportError),
    /// `stop_and_drain` gave up waiting; events are back in the queue
    DrainTimeout { queued: usize },
    /// `stop_and_drain` batch was not accepted; events are back in the queue
    DrainRejected { reason: String, queued: usize },
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRuntime => write!(f, "No tokio runtime available"),
            Self::TransportInUse => write!(f, "Transport event stream already taken"),
            Self::Stopped => write!(f, "Engine stopped"),
            Self::Offline => write!(f, "Engine offline"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::DrainTimeout { queued } => {
                write!(f, "Drain timed out ({queued} events left queued)")
            }
            Self::DrainRejected { reason, queued } => {
                write!(f, "Drain rejected: {reason} ({queued} events left queued)")
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Session state
// ───────────────────────────────────────────────────────────────────

struct EngineState {
    identity: EventIdentity,
    scheduler: BatchScheduler,
    probe: LatencyProbe,
    params: BatchingParams,
    reconcile: ReconciliationManager,
    online: bool,
}

enum Command {
    Retune(Duration),
}

enum AckOutcome {
    Received(Vec<u8>),
    Dropped,
    TimedOut,
}

async fn wait_ack(rx: AckReceiver, limit: Option<Duration>) -> AckOutcome {
    let received = match limit {
        Some(limit) => match tokio::time::timeout(limit, rx).await {
            Ok(received) => received,
            Err(_) => return AckOutcome::TimedOut,
        },
        None => rx.await,
    };
    match received {
        Ok(bytes) => AckOutcome::Received(bytes),
        Err(_) => AckOutcome::Dropped,
    }
}

fn batch_verdict(outcome: AckOutcome) -> Result<(), RetryReason> {
    match outcome {
        AckOutcome::Received(bytes) => match protocol::decode::<BatchAck>(&bytes) {
            Ok(ack) => match ack.status {
                AckStatus::Ok => Ok(()),
                AckStatus::Error(reason) => Err(RetryReason::Rejected(reason)),
            },
            Err(e) => Err(RetryReason::Rejected(e.to_string())),
        },
        AckOutcome::Dropped => Err(RetryReason::AckDropped),
        AckOutcome::TimedOut => Err(RetryReason::AckTimeout),
    }
}

struct Inner {
    context: SessionContext,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    render: Arc<dyn RenderSink>,
    state: Mutex<EngineState>,
    /// Only written with `state` locked.
    stopped: AtomicBool,
    runtime: Handle,
    events: mpsc::UnboundedSender<EngineEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn emit_evicted(&self, count: usize) {
        if count > 0 {
            log::warn!(
                "Queue cap reached on board {}: evicted {count} oldest events",
                self.context.channel_id
            );
            self.emit(EngineEvent::EventsEvicted { count });
        }
    }

    fn emit_state_change(&self, before: ReconcileState, after: ReconcileState) {
        if before != after {
            self.emit(EngineEvent::ReconcileStateChanged(after));
        }
    }

    fn render_all(&self, events: &[Event]) {
        for event in events {
            self.render.render(event);
        }
        if !events.is_empty() {
            self.emit(EngineEvent::RemoteEvents {
                count: events.len(),
            });
        }
    }

    // ── Flush ──────────────────────────────────────────────────────

    /// Swap the queue into a batch and send it. Returns the events sent.
    fn flush(self: &Arc<Self>) -> usize {
        let mut state = self.state();
        if self.is_stopped() {
            return 0;
        }
        let Some(pending) = self.begin_flush(&mut state) else {
            return 0;
        };

        let count = pending.len();
        match self.send_batch(&pending) {
            Ok(rx) => {
                drop(state);
                log::debug!("Batch {} sent ({count} events)", pending.batch_id());
                let inner = Arc::clone(self);
                self.runtime
                    .spawn(async move { inner.settle_batch(pending, rx).await });
                count
            }
            Err(reason) => {
                let batch_id = pending.batch_id().to_string();
                let evicted = state.scheduler.retry(pending);
                drop(state);
                log::warn!("Batch {batch_id} not sent, requeued {count} events: {reason}");
                self.emit(EngineEvent::BatchRetried {
                    batch_id,
                    count,
                    reason,
                });
                self.emit_evicted(evicted);
                0
            }
        }
    }

    fn begin_flush(&self, state: &mut EngineState) -> Option<PendingBatch> {
        let batch_id = state.identity.batch_id();
        let online = state.online;
        state.scheduler.begin_flush(batch_id, online)
    }

    fn send_batch(&self, pending: &PendingBatch) -> Result<AckReceiver, RetryReason> {
        let batch = pending.to_batch(&self.context.channel_id);
        let payload =
            protocol::encode(&batch).map_err(|e| RetryReason::TransportError(e.to_string()))?;
        self.transport
            .request(Topic::BatchSend, payload)
            .map_err(|e| RetryReason::TransportError(e.to_string()))
    }

    async fn settle_batch(self: Arc<Self>, pending: PendingBatch, rx: AckReceiver) {
        let verdict = batch_verdict(wait_ack(rx, self.config.ack_timeout).await);

        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        let batch_id = pending.batch_id().to_string();
        match verdict {
            Ok(()) => {
                let count = state.scheduler.accept(pending);
                drop(state);
                log::debug!("Batch {batch_id} accepted ({count} events)");
                self.emit(EngineEvent::BatchAccepted { batch_id, count });
            }
            Err(reason) if state.scheduler.is_stale(&pending) => {
                let count = pending.len();
                state.scheduler.retry(pending);
                drop(state);
                log::debug!("Batch {batch_id} dropped ({count} events cleared): {reason}");
            }
            Err(reason) => {
                let count = pending.len();
                let evicted = state.scheduler.retry(pending);
                drop(state);
                log::warn!("Batch {batch_id} retried ({count} events): {reason}");
                self.emit(EngineEvent::BatchRetried {
                    batch_id,
                    count,
                    reason,
                });
                self.emit_evicted(evicted);
            }
        }
    }

    // ── Latency probe ──────────────────────────────────────────────

    fn ping(self: &Arc<Self>) {
        let mut state = self.state();
        if self.is_stopped() || !state.online {
            return;
        }
        let sent_at = state.identity.now();
        let request = state.probe.ping(sent_at);
        let rx = match protocol::encode(&request)
            .map_err(SyncError::from)
            .and_then(|payload| {
                self.transport
                    .request(Topic::Ping, payload)
                    .map_err(SyncError::from)
            })
        {
            Ok(rx) => rx,
            Err(e) => {
                state.probe.skip();
                log::debug!("Ping skipped: {e}");
                return;
            }
        };
        drop(state);

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let outcome = wait_ack(rx, inner.config.ack_timeout).await;
            inner.settle_ping(sent_at, outcome);
        });
    }

    fn settle_ping(&self, sent_at: f64, outcome: AckOutcome) {
        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        if !matches!(outcome, AckOutcome::Received(_)) {
            state.probe.skip();
            log::debug!("Ping unanswered, keeping current batching parameters");
            return;
        }

        let received_at = state.identity.now();
        let latency = state.probe.record(sent_at, received_at);
        let params = self.config.policy.tune(latency);
        let changed = params.flush_interval != state.params.flush_interval;
        state.params = params;
        drop(state);

        if changed {
            log::debug!(
                "Latency {:.0}ms: flush every {}ms",
                latency * 1000.0,
                params.flush_interval_ms()
            );
        }
        // Every completed ping restarts the flush timer, even within a tier
        let _ = self.commands.send(Command::Retune(params.flush_interval));
        self.emit(EngineEvent::LatencyUpdated { latency, params });
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Send a missing-range request. Called with the state lock held.
    fn request_range(self: &Arc<Self>, request: RangeRequest) {
        let body = MissingRangeRequest {
            channel_id: self.context.channel_id.clone(),
            since: request.since,
            until: request.until,
        };
        let sent = protocol::encode(&body)
            .map_err(SyncError::from)
            .and_then(|payload| {
                self.transport
                    .request(Topic::MissingRange, payload)
                    .map_err(SyncError::from)
            });
        let rx = match sent {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("Missing-range request not sent: {e}");
                return;
            }
        };
        self.emit(EngineEvent::MissingRangeRequested {
            since: request.since,
            until: request.until,
        });

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            match wait_ack(rx, inner.config.ack_timeout).await {
                AckOutcome::Received(bytes) => match protocol::decode::<MissingRange>(&bytes) {
                    Ok(range) => inner.complete_range(request, range.events),
                    Err(e) => log::warn!("Undecodable missing-range response: {e}"),
                },
                _ => log::debug!(
                    "Missing-range request ({}, {:?}] unanswered",
                    request.since,
                    request.until
                ),
            }
        });
    }

    /// Merge the reply to `answered`.
    fn complete_range(&self, answered: RangeRequest, events: Vec<Event>) {
        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        let before = state.reconcile.state();
        let outcome = state.reconcile.complete_range(answered, events);
        let after = state.reconcile.state();
        drop(state);

        self.render_all(&outcome.render);
        self.emit_state_change(before, after);
    }

    fn merge_remote(&self, events: Vec<Event>) {
        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        let outcome = state.reconcile.merge(events);
        drop(state);

        if outcome.duplicates > 0 {
            log::debug!("Skipped {} already-known events", outcome.duplicates);
        }
        self.render_all(&outcome.render);
    }

    fn on_watermark(self: &Arc<Self>, latest: f64) {
        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        let before = state.reconcile.state();
        let now = state.identity.now();
        if let Some(request) = state.reconcile.on_watermark(latest, now) {
            log::info!(
                "Watermark {latest} ahead of {}: requesting missing range",
                request.since
            );
            self.request_range(request);
        }
        let after = state.reconcile.state();
        drop(state);
        self.emit_state_change(before, after);
    }

    fn check_rerequest(self: &Arc<Self>) {
        let Some(interval) = self.config.rerequest_interval else {
            return;
        };
        let mut state = self.state();
        if self.is_stopped() || !state.online {
            return;
        }
        let now = state.identity.now();
        if let Some(request) = state.reconcile.due_for_rerequest(now, interval.as_secs_f64()) {
            log::info!("Re-requesting missing range after {}", request.since);
            self.request_range(request);
        }
    }

    // ── Connection & pushes ────────────────────────────────────────

    fn on_connected(self: &Arc<Self>) {
        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        let was_online = state.online;
        let before = state.reconcile.state();
        state.online = true;
        let now = state.identity.now();
        let request = state.reconcile.on_reconnect(now);
        self.request_range(request);
        drop(state);

        if !was_online {
            log::info!("Board {} back online", self.context.channel_id);
            self.emit(EngineEvent::ConnectionChanged { online: true });
        }
        self.emit_state_change(before, ReconcileState::Reconciling);
        self.flush();
    }

    fn on_disconnected(&self) {
        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        let was_online = state.online;
        let before = state.reconcile.state();
        state.online = false;
        state.reconcile.on_disconnect();
        let queued = state.scheduler.queue_len();
        drop(state);

        if was_online {
            log::warn!(
                "Board {} offline, {queued} events queued",
                self.context.channel_id
            );
            self.emit(EngineEvent::ConnectionChanged { online: false });
        }
        self.emit_state_change(before, ReconcileState::Suspended);
    }

    fn clear_board(&self) {
        let mut state = self.state();
        if self.is_stopped() {
            return;
        }
        let dropped = state.scheduler.clear();
        state.reconcile.clear_history();
        drop(state);

        log::info!(
            "Board {} cleared ({dropped} queued events dropped)",
            self.context.channel_id
        );
        self.render.clear();
        self.emit(EngineEvent::BoardCleared);
    }

    fn on_message(self: &Arc<Self>, topic: Topic, payload: Vec<u8>) {
        let handled = match topic {
            Topic::HistorySnapshot => {
                protocol::decode::<Vec<Event>>(&payload).map(|events| self.merge_remote(events))
            }
            Topic::ConfirmedBatch => protocol::decode::<ConfirmedBatch>(&payload)
                .map(|batch| self.merge_remote(batch.events)),
            Topic::Watermark => protocol::decode::<Watermark>(&payload)
                .map(|watermark| self.on_watermark(watermark.latest_timestamp)),
            // Unsolicited: answers no request, so it covers nothing beyond its events
            Topic::MissingRange => protocol::decode::<MissingRange>(&payload)
                .map(|range| self.merge_remote(range.events)),
            Topic::ClearAll => {
                self.clear_board();
                Ok(())
            }
            Topic::AddElement | Topic::UpdateElement | Topic::RemoveElement => {
                protocol::decode::<ElementOp>(&payload).map(|op| {
                    if !self.is_stopped() {
                        self.render.apply_element(&op);
                    }
                })
            }
            Topic::Ping | Topic::BatchSend => {
                log::warn!("Ignoring unexpected {topic} push");
                Ok(())
            }
        };
        if let Err(e) = handled {
            log::warn!("Dropping {topic} push: {e}");
        }
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Message { topic, payload } => self.on_message(topic, payload),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver task
// ───────────────────────────────────────────────────────────────────

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_transport_event(
    events: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drive(
    inner: Arc<Inner>,
    events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut flush = periodic(inner.config.flush_interval);
    let mut ping = periodic(inner.config.ping_interval);
    let mut events = Some(events);

    loop {
        tokio::select! {
            _ = flush.tick() => {
                inner.flush();
                inner.check_rerequest();
            }
            _ = ping.tick() => inner.ping(),
            event = next_transport_event(&mut events) => match event {
                Some(event) => inner.on_transport_event(event),
                None => {
                    log::warn!("Transport event stream closed");
                    events = None;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Retune(period)) => flush = periodic(period),
                None => break,
            },
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Façade
// ───────────────────────────────────────────────────────────────────

/// One collaborative session.
///
/// Dropping the engine stops it (see [`SyncEngine::stop`]).
pub struct SyncEngine {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
    event_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

impl SyncEngine {
    /// Start a session on the current tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        context: SessionContext,
        render: Arc<dyn RenderSink>,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        Self::start_with_clock(transport, context, render, config, Arc::new(SystemClock::new()))
    }

    /// Start a session reading timestamps from `clock`.
    pub fn start_with_clock(
        transport: Arc<dyn Transport>,
        context: SessionContext,
        render: Arc<dyn RenderSink>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let transport_events = transport.take_events().ok_or(SyncError::TransportInUse)?;

        let online = transport.is_connected();
        let mut reconcile = ReconciliationManager::new(context.session_id);
        if !online {
            reconcile.on_disconnect();
        }
        let state = EngineState {
            identity: EventIdentity::new(clock, context.session_id),
            scheduler: BatchScheduler::new(config.max_queue_len),
            probe: LatencyProbe::new(),
            params: BatchingParams {
                flush_interval: config.flush_interval,
                ..config.policy.baseline()
            },
            reconcile,
            online,
        };

        let (events_tx, event_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            context,
            config,
            transport,
            render,
            state: Mutex::new(state),
            stopped: AtomicBool::new(false),
            runtime: runtime.clone(),
            events: events_tx,
            commands: commands_tx,
        });
        let driver = runtime.spawn(drive(inner.clone(), transport_events, commands_rx));

        log::info!(
            "Sync engine started for board {} (session {}, {})",
            inner.context.channel_id,
            inner.context.session_id,
            if online { "online" } else { "offline" }
        );

        Ok(Self {
            inner,
            driver: Mutex::new(Some(driver)),
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.event_rx.take()
    }

    /// Stamp, render and queue a local event.
    ///
    /// Never waits on the network. Flushes immediately once the queue
    /// reaches `flush_threshold`.
    pub fn record_event(&self, payload: Vec<u8>) -> Result<Event, SyncError> {
        let inner = &self.inner;
        let (event, evicted, over_threshold) = {
            let mut state = inner.state();
            if inner.is_stopped() {
                return Err(SyncError::Stopped);
            }
            let event = state.identity.stamp(payload);
            state.reconcile.record_local(&event);
            let evicted = state.scheduler.record(event.clone());
            let over = state.scheduler.over_threshold(inner.config.flush_threshold);
            (event, evicted, over)
        };

        inner.render.render(&event);
        inner.emit_evicted(evicted);
        if over_threshold {
            inner.flush();
        }
        Ok(event)
    }

    /// Flush now. No-op (returns 0) when offline or when nothing is queued.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Send a fire-and-forget element operation.
    ///
    /// `ClearAll` also clears this session's board.
    pub fn send_element_op(&self, op: ElementOp) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(SyncError::Stopped);
        }
        let payload = protocol::encode(&op)?;
        let sent = inner.transport.send(op.topic(), payload);
        if op == ElementOp::ClearAll {
            inner.clear_board();
        }
        match sent {
            Ok(()) => Ok(()),
            Err(TransportError::NotConnected) => Err(SyncError::Offline),
            Err(e) => Err(e.into()),
        }
    }

    /// End the session: one final flush whose ack is not awaited, then all
    /// timers stop. Returns the number of events handed to the transport.
    ///
    /// Events still queued (offline) or in flight are not retried.
    pub fn stop(&self) -> usize {
        let Some(pending) = self.halt() else {
            return 0;
        };
        let inner = &self.inner;
        let count = pending.len();
        match inner.send_batch(&pending) {
            Ok(_ack) => log::info!(
                "Sync engine stopped for board {}: final batch {} ({count} events) sent",
                inner.context.channel_id,
                pending.batch_id()
            ),
            Err(reason) => log::warn!(
                "Sync engine stopped for board {}: final batch of {count} events lost: {reason}",
                inner.context.channel_id
            ),
        }
        inner.state().scheduler.abandon(pending);
        count
    }

    /// End the session and wait up to `wait` for the final batch to be
    /// acknowledged. On failure the events are back in the queue, readable
    /// through [`SyncEngine::queued_events`].
    pub async fn stop_and_drain(&self, wait: Duration) -> Result<usize, SyncError> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(SyncError::Stopped);
        }
        let Some(pending) = self.halt() else {
            // Nothing queued, or offline with events left behind
            return match self.queue_len() {
                0 => Ok(0),
                _ => Err(SyncError::Offline),
            };
        };

        let verdict = match inner.send_batch(&pending) {
            Ok(rx) => batch_verdict(wait_ack(rx, Some(wait)).await),
            Err(reason) => Err(reason),
        };

        let mut state = inner.state();
        match verdict {
            Ok(()) => {
                let count = state.scheduler.accept(pending);
                log::info!(
                    "Sync engine drained for board {} ({count} events accepted)",
                    inner.context.channel_id
                );
                Ok(count)
            }
            Err(reason) => {
                state.scheduler.retry(pending);
                let queued = state.scheduler.queue_len();
                log::warn!("Drain failed: {reason}");
                match reason {
                    RetryReason::AckTimeout => Err(SyncError::DrainTimeout { queued }),
                    other => Err(SyncError::DrainRejected {
                        reason: other.to_string(),
                        queued,
                    }),
                }
            }
        }
    }

    /// Mark stopped, cancel the driver and swap out the final batch.
    fn halt(&self) -> Option<PendingBatch> {
        let inner = &self.inner;
        let pending = {
            let mut state = inner.state();
            if inner.stopped.swap(true, Ordering::SeqCst) {
                return None;
            }
            let pending = inner.begin_flush(&mut state);
            if pending.is_none() && state.scheduler.queue_len() > 0 {
                log::warn!(
                    "Sync engine stopped offline with {} events queued",
                    state.scheduler.queue_len()
                );
            }
            pending
        };
        if let Some(driver) = self.driver.lock().ok().and_then(|mut d| d.take()) {
            driver.abort();
        }
        pending
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state().scheduler.queue_len()
    }

    /// Queued events in send order.
    pub fn queued_events(&self) -> Vec<Event> {
        self.inner.state().scheduler.queued_events()
    }

    pub fn in_flight_batches(&self) -> usize {
        self.inner.state().scheduler.in_flight_batches()
    }

    /// Current batching parameters.
    pub fn params(&self) -> BatchingParams {
        self.inner.state().params
    }

    /// Latest latency estimate in seconds.
    pub fn latency(&self) -> Option<f64> {
        self.inner.state().probe.estimate()
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.inner.state().probe.estimate_ms()
    }

    pub fn is_online(&self) -> bool {
        self.inner.state().online
    }

    pub fn reconcile_state(&self) -> ReconcileState {
        self.inner.state().reconcile.state()
    }

    /// Newest server timestamp covered locally.
    pub fn watermark(&self) -> f64 {
        self.inner.state().reconcile.watermark()
    }

    /// Local history in order.
    pub fn history(&self) -> Vec<Event> {
        self.inner.state().reconcile.history().events()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.state().scheduler.stats()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{NullSink, RecordingSink};
    use crate::transport::memory::{AckPolicy, MemoryTransport};

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.flush_threshold, 50);
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.ack_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.max_queue_len, Some(10_000));
        assert!(config.rerequest_interval.is_none());

        let testing = EngineConfig::for_testing();
        assert_eq!(testing.ack_timeout, Some(Duration::from_secs(1)));
        assert_eq!(testing.flush_threshold, 50);
    }

    #[test]
    fn test_start_outside_runtime() {
        let result = SyncEngine::start(
            MemoryTransport::new(),
            SessionContext::new("board"),
            Arc::new(NullSink),
            EngineConfig::default(),
        );
        assert!(matches!(result, Err(SyncError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_transport_in_use() {
        let transport = MemoryTransport::new();
        let _first = SyncEngine::start(
            transport.clone(),
            SessionContext::new("board"),
            Arc::new(NullSink),
            EngineConfig::default(),
        )
        .unwrap();
        let second = SyncEngine::start(
            transport,
            SessionContext::new("board"),
            Arc::new(NullSink),
            EngineConfig::default(),
        );
        assert!(matches!(second, Err(SyncError::TransportInUse)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_renders_immediately() {
        let transport = MemoryTransport::with_policy(AckPolicy::AcceptAll);
        let sink = Arc::new(RecordingSink::new());
        let engine = SyncEngine::start(
            transport.clone(),
            SessionContext::new("board"),
            sink.clone(),
            EngineConfig::default(),
        )
        .unwrap();

        let event = engine.record_event(vec![1]).unwrap();
        assert_eq!(sink.rendered_ids(), vec![event.id.clone()]);
        assert_eq!(engine.queue_len(), 1);
        assert!(transport.batches().is_empty());
        assert_eq!(engine.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_after_stop() {
        let engine = SyncEngine::start(
            MemoryTransport::new(),
            SessionContext::new("board"),
            Arc::new(NullSink),
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(engine.stop(), 0);
        assert!(engine.is_stopped());
        assert_eq!(engine.record_event(vec![1]), Err(SyncError::Stopped));
        assert_eq!(engine.stop(), 0);
    }

    #[test]
    fn test_batch_verdict() {
        let ok = protocol::encode(&BatchAck::ok(2)).unwrap();
        assert_eq!(batch_verdict(AckOutcome::Received(ok)), Ok(()));

        let rejected = protocol::encode(&BatchAck::error("full")).unwrap();
        assert_eq!(
            batch_verdict(AckOutcome::Received(rejected)),
            Err(RetryReason::Rejected("full".into()))
        );
        assert!(matches!(
            batch_verdict(AckOutcome::Received(vec![0xFF])),
            Err(RetryReason::Rejected(_))
        ));
        assert_eq!(batch_verdict(AckOutcome::Dropped), Err(RetryReason::AckDropped));
        assert_eq!(batch_verdict(AckOutcome::TimedOut), Err(RetryReason::AckTimeout));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(SyncError::Stopped.to_string(), "Engine stopped");
        assert_eq!(
            SyncError::from(TransportError::NotConnected).to_string(),
            "Transport error: Transport not connected"
        );
        assert_eq!(
            SyncError::DrainTimeout { queued: 3 }.to_string(),
            "Drain timed out (3 events left queued)"
        );
    }
}
