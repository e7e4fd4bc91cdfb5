//! Voice session lifecycle and inbound event dispatch.
//!
//! [`SessionController`] is the single authority for one voice-mode
//! activation. It acquires the devices, opens the transport, wires the
//! capture path, and then serializes every inbound event through one
//! dispatch task into the scheduler and the transcript aggregator.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ─start()─▸ Requesting ─transport ready─▸ Open ─stop()/Closed/Error─▸ Closing ─▸ Idle
//!                     │
//!                     └─ acquisition or open failure ─▸ Failed ─▸ Idle
//! ```
//!
//! All per-session state sits behind one mutex and is only touched
//! synchronously. A generation counter tags background tasks so a task
//! left over from a torn-down session can never mutate a newer one.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::capture::{run_outbound_pump, CaptureLoop};
use super::codec::FrameCodec;
use super::device::{InputDevice, InputHandle, OutputDevice, OutputHandle};
use super::error::VoiceError;
use super::scheduler::PlaybackScheduler;
use super::transcript::{LiveCaption, TranscriptAggregator, TurnTranscript};
use super::transport::{TransportConnector, TransportSession};
use super::InboundEvent;
use crate::config::VoiceConfig;

/// Capacity of the finalized-turn broadcast channel.
const TURN_BROADCAST_CAPACITY: usize = 64;

// ── State and status ─────────────────────────────────────────────

/// Lifecycle state of the voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No voice session.
    Idle,
    /// Acquiring devices and opening the transport.
    Requesting,
    /// Streaming in both directions.
    Open,
    /// Tearing down.
    Closing,
    /// A start attempt failed; immediately followed by `Idle`.
    Failed,
}

/// The two flags the UI cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoiceStatus {
    pub voice_mode_active: bool,
    pub connected: bool,
}

/// Mic-button indicator derived from [`VoiceStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusIndicator {
    Idle,
    Connecting,
    Listening,
}

impl VoiceStatus {
    pub fn indicator(self) -> StatusIndicator {
        match (self.voice_mode_active, self.connected) {
            (true, true) => StatusIndicator::Listening,
            (true, false) => StatusIndicator::Connecting,
            (false, _) => StatusIndicator::Idle,
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────

/// Live counters shared with the capture path.
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub packets_queued: AtomicU64,
    pub packets_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub chunks_scheduled: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub catch_ups: AtomicU64,
    pub turns: AtomicU64,
    pub interruptions: AtomicU64,
}

/// Counters for the current (or most recent) session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub packets_queued: u64,
    pub packets_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub catch_ups: u64,
    pub turns: u64,
    pub interruptions: u64,
}

impl StatsCounters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            packets_queued: self.packets_queued.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            catch_ups: self.catch_ups.load(Ordering::Relaxed),
            turns: self.turns.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

// ── Options ──────────────────────────────────────────────────────

/// Session tunables, usually taken from the `[voice]` config section.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound of the ordered outbound packet queue.
    pub outbound_queue_capacity: usize,
    /// Stop already-scheduled agent audio when the agent is interrupted.
    pub interrupt_cancels_playback: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&VoiceConfig::default())
    }
}

impl From<&VoiceConfig> for SessionOptions {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            outbound_queue_capacity: config.outbound_queue_capacity.max(1),
            interrupt_cancels_playback: config.interrupt_cancels_playback,
        }
    }
}

// ── Resources ────────────────────────────────────────────────────

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownReason {
    UserStop,
    RemoteClosed,
    TransportError,
}

/// Resources gathered during `Requesting`, released as a unit on failure.
#[derive(Default)]
struct Acquired {
    input: Option<Box<dyn InputHandle>>,
    output: Option<Arc<dyn OutputHandle>>,
    transport: Option<Box<dyn TransportSession>>,
}

impl Acquired {
    fn release(self, session_id: &str) {
        if let Some(input) = self.input {
            release_input(input.as_ref(), session_id);
        }
        if let Some(output) = self.output {
            release_output(output.as_ref(), session_id);
        }
        if let Some(transport) = self.transport {
            transport.close();
        }
    }
}

fn release_input(input: &dyn InputHandle, session_id: &str) {
    input.disconnect();
    if let Err(e) = input.release() {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to release input device");
    }
}

fn release_output(output: &dyn OutputHandle, session_id: &str) {
    if let Err(e) = output.release() {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to release output device");
    }
}

/// Resources of a start in progress.
///
/// Dropping it while armed (the `start()` future was abandoned mid-await)
/// releases what was acquired and fails the start if it is still current.
struct PendingStart {
    shared: Arc<Shared>,
    generation: u64,
    session_id: String,
    acquired: Acquired,
    armed: bool,
}

impl PendingStart {
    /// Release everything and settle the controller after a failed step.
    fn fail(mut self, err: VoiceError) -> VoiceError {
        self.armed = false;
        std::mem::take(&mut self.acquired).release(&self.session_id);

        let mut inner = self.shared.inner.lock();
        if inner.generation != self.generation {
            // A stop() already returned the controller to Idle.
            return VoiceError::Cancelled;
        }
        tracing::warn!(session_id = %self.session_id, error = %err, "Voice session failed to start");
        self.shared.fail_locked(&mut inner);
        err
    }

    /// Hand the resources over to the open session.
    fn disarm(mut self) -> Acquired {
        self.armed = false;
        std::mem::take(&mut self.acquired)
    }
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        std::mem::take(&mut self.acquired).release(&self.session_id);

        let mut inner = self.shared.inner.lock();
        if inner.generation == self.generation && inner.state == SessionState::Requesting {
            tracing::warn!(session_id = %self.session_id, "Voice session start abandoned");
            self.shared.fail_locked(&mut inner);
        }
    }
}

/// Everything owned by an `Open` session.
struct ActiveSession {
    session_id: String,
    input: Box<dyn InputHandle>,
    output: Arc<dyn OutputHandle>,
    transport: Arc<dyn TransportSession>,
    capture: CaptureLoop,
    scheduler: PlaybackScheduler,
    transcripts: TranscriptAggregator,
    pump: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl ActiveSession {
    /// Release every resource. Each step runs regardless of the others.
    fn shutdown(self, reason: TeardownReason) {
        let session_id = self.session_id;

        self.capture.stop();
        release_input(self.input.as_ref(), &session_id);
        release_output(self.output.as_ref(), &session_id);

        if reason == TeardownReason::UserStop {
            self.transport.end_audio_stream();
        }
        self.transport.close();
        self.pump.abort();
        self.dispatch.abort();

        tracing::info!(
            session_id = %session_id,
            reason = ?reason,
            "Voice session resources released"
        );
    }
}

struct Inner {
    state: SessionState,
    generation: u64,
    active: Option<ActiveSession>,
    counters: Arc<StatsCounters>,
    last_session_id: Option<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<VoiceStatus>,
    caption_tx: watch::Sender<LiveCaption>,
    turn_tx: broadcast::Sender<TurnTranscript>,
}

impl Shared {
    fn publish_status(&self, voice_mode_active: bool, connected: bool) {
        self.status_tx.send_replace(VoiceStatus {
            voice_mode_active,
            connected,
        });
    }

    fn publish_caption(&self, caption: LiveCaption) {
        self.caption_tx.send_replace(caption);
    }

    /// Tear down whatever session exists. No-op when already idle.
    fn teardown_locked(&self, inner: &mut Inner, reason: TeardownReason) {
        if matches!(inner.state, SessionState::Idle | SessionState::Closing) {
            tracing::debug!(reason = ?reason, "Teardown requested while idle, ignoring");
            return;
        }

        let previous = inner.state;
        inner.state = SessionState::Closing;
        inner.generation += 1;
        self.publish_status(false, false);

        if let Some(active) = inner.active.take() {
            active.shutdown(reason);
        } else {
            tracing::info!(previous = ?previous, "Voice session start cancelled");
        }

        inner.state = SessionState::Idle;
        self.publish_caption(LiveCaption::default());
    }

    /// Record a failed start and return to `Idle`.
    fn fail_locked(&self, inner: &mut Inner) {
        inner.state = SessionState::Failed;
        inner.generation += 1;
        self.publish_status(false, false);
        inner.state = SessionState::Idle;
    }

    /// Handle one inbound event. Returns `false` when the dispatch loop
    /// should end.
    fn dispatch(&self, generation: u64, event: InboundEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != SessionState::Open {
            return false;
        }
        let counters = Arc::clone(&inner.counters);
        let Some(active) = inner.active.as_mut() else {
            return false;
        };

        match event {
            InboundEvent::AudioChunk {
                samples,
                duration_secs,
            } => match active.scheduler.schedule(samples, duration_secs) {
                Ok(start) => {
                    counters.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
                    counters
                        .catch_ups
                        .store(active.scheduler.catch_ups(), Ordering::Relaxed);
                    tracing::trace!(
                        session_id = %active.session_id,
                        start,
                        duration_secs,
                        "Scheduled agent audio"
                    );
                }
                Err(e) => {
                    counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        session_id = %active.session_id,
                        error = %e,
                        "Dropping audio chunk the output device rejected"
                    );
                }
            },
            InboundEvent::TranscriptDelta { speaker, text } => {
                active.transcripts.on_delta(speaker, &text);
                self.publish_caption(active.transcripts.caption());
            }
            InboundEvent::TurnComplete => {
                let turn = active.transcripts.on_turn_complete();
                let n = counters.turns.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(
                    session_id = %active.session_id,
                    turn = n,
                    caller = %turn.caller,
                    agent = %turn.agent,
                    "Turn complete"
                );
                let _ = self.turn_tx.send(turn);
                self.publish_caption(active.transcripts.caption());
            }
            InboundEvent::Interrupted => {
                active.scheduler.interrupt();
                active.transcripts.on_interrupted();
                counters.interruptions.fetch_add(1, Ordering::Relaxed);
                tracing::info!(session_id = %active.session_id, "Agent interrupted");
                self.publish_caption(active.transcripts.caption());
            }
            InboundEvent::Closed => {
                tracing::info!(session_id = %active.session_id, "Transport closed by remote");
                self.teardown_locked(&mut inner, TeardownReason::RemoteClosed);
                return false;
            }
            InboundEvent::Error { reason } => {
                tracing::warn!(
                    session_id = %active.session_id,
                    reason = %reason,
                    "Transport error, ending voice session"
                );
                self.teardown_locked(&mut inner, TeardownReason::TransportError);
                return false;
            }
        }
        true
    }
}

/// Consume the inbound stream in order until it ends or the session changes.
async fn dispatch_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<InboundEvent>,
    generation: u64,
    session_id: String,
) {
    while let Some(event) = events.recv().await {
        if !shared.dispatch(generation, event) {
            tracing::debug!(session_id = %session_id, "Dispatch loop terminated");
            return;
        }
    }

    tracing::info!(session_id = %session_id, "Inbound event stream ended");
    let mut inner = shared.inner.lock();
    if inner.generation == generation {
        shared.teardown_locked(&mut inner, TeardownReason::RemoteClosed);
    }
}

// ── Controller ───────────────────────────────────────────────────

/// Owns the voice session lifecycle.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
    input: Arc<dyn InputDevice>,
    output: Arc<dyn OutputDevice>,
    connector: Arc<dyn TransportConnector>,
    codec: Arc<dyn FrameCodec>,
    options: SessionOptions,
}

impl SessionController {
    pub fn new(
        input: Arc<dyn InputDevice>,
        output: Arc<dyn OutputDevice>,
        connector: Arc<dyn TransportConnector>,
        codec: Arc<dyn FrameCodec>,
        options: SessionOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(VoiceStatus::default());
        let (caption_tx, _) = watch::channel(LiveCaption::default());
        let (turn_tx, _) = broadcast::channel(TURN_BROADCAST_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    generation: 0,
                    active: None,
                    counters: Arc::new(StatsCounters::default()),
                    last_session_id: None,
                }),
                status_tx,
                caption_tx,
                turn_tx,
            }),
            input,
            output,
            connector,
            codec,
            options,
        }
    }

    /// Start voice mode. Returns the new session id once streaming.
    ///
    /// On any failure every partially acquired resource is released and the
    /// controller is back to `Idle` before this returns.
    pub async fn start(&self) -> Result<String, VoiceError> {
        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(VoiceError::AlreadyActive(inner.state));
            }
            inner.generation += 1;
            inner.state = SessionState::Requesting;
            inner.generation
        };
        self.shared.publish_status(true, false);

        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session_id = %session_id, "Starting voice session");

        let mut pending = PendingStart {
            shared: Arc::clone(&self.shared),
            generation,
            session_id: session_id.clone(),
            acquired: Acquired::default(),
            armed: true,
        };

        match self.input.acquire().await {
            Ok(handle) => pending.acquired.input = Some(handle),
            Err(e) => {
                let err = VoiceError::Acquisition(format!("input device: {e}"));
                return Err(pending.fail(err));
            }
        }

        match self.output.acquire().await {
            Ok(handle) => pending.acquired.output = Some(handle),
            Err(e) => {
                let err = VoiceError::Acquisition(format!("output device: {e}"));
                return Err(pending.fail(err));
            }
        }

        let transport = match self.connector.open(&session_id).await {
            Ok(transport) => transport,
            Err(e) => {
                let err = VoiceError::Transport(e.to_string());
                return Err(pending.fail(err));
            }
        };

        self.open_session(generation, session_id, pending.disarm(), transport)
    }

    /// Stop voice mode. Idempotent; the controller is `Idle` on return.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        self.shared
            .teardown_locked(&mut inner, TeardownReason::UserStop);
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn status(&self) -> VoiceStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<VoiceStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Current live caption text.
    pub fn caption(&self) -> LiveCaption {
        self.shared.caption_tx.borrow().clone()
    }

    /// Live caption updates, one per transcript change.
    pub fn captions(&self) -> watch::Receiver<LiveCaption> {
        self.shared.caption_tx.subscribe()
    }

    /// Finalized turns as they complete.
    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnTranscript> {
        self.shared.turn_tx.subscribe()
    }

    /// Scheduling cursor of the open session, `0.0` when idle.
    pub fn next_start_time(&self) -> f64 {
        self.shared
            .inner
            .lock()
            .active
            .as_ref()
            .map_or(0.0, |a| a.scheduler.next_start_time())
    }

    /// Id of the open session, or of the last one.
    pub fn session_id(&self) -> Option<String> {
        self.shared.inner.lock().last_session_id.clone()
    }

    /// Counters of the open session, or of the last one.
    pub fn stats(&self) -> SessionStats {
        self.shared.inner.lock().counters.snapshot()
    }

    // ── Internal ──────────────────────────────────────────────────

    fn open_session(
        &self,
        generation: u64,
        session_id: String,
        acquired: Acquired,
        mut transport: Box<dyn TransportSession>,
    ) -> Result<String, VoiceError> {
        let mut inner = self.shared.inner.lock();
        let current = inner.generation == generation && inner.state == SessionState::Requesting;
        let (input, output) = match (acquired.input, acquired.output) {
            (Some(input), Some(output)) if current => (input, output),
            (input, output) => {
                if current {
                    self.shared.fail_locked(&mut inner);
                }
                drop(inner);
                Acquired {
                    input,
                    output,
                    transport: Some(transport),
                }
                .release(&session_id);
                return Err(VoiceError::Cancelled);
            }
        };

        let Some(events) = transport.take_events() else {
            Acquired {
                input: Some(input),
                output: Some(output),
                transport: Some(transport),
            }
            .release(&session_id);
            tracing::warn!(session_id = %session_id, "Transport session has no event stream");
            self.shared.fail_locked(&mut inner);
            return Err(VoiceError::Transport(
                "transport session has no event stream".into(),
            ));
        };
        let transport: Arc<dyn TransportSession> = Arc::from(transport);

        let counters = Arc::new(StatsCounters::default());
        let (queue_tx, queue_rx) = mpsc::channel(self.options.outbound_queue_capacity);

        let capture = match CaptureLoop::start(
            input.as_ref(),
            Arc::clone(&self.codec),
            queue_tx,
            Arc::clone(&counters),
            session_id.clone(),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                release_input(input.as_ref(), &session_id);
                release_output(output.as_ref(), &session_id);
                transport.close();
                tracing::warn!(session_id = %session_id, error = %e, "Failed to start capture");
                self.shared.fail_locked(&mut inner);
                return Err(VoiceError::Acquisition(format!("input device: {e}")));
            }
        };

        let pump = tokio::spawn(run_outbound_pump(
            queue_rx,
            Arc::clone(&transport),
            Arc::clone(&counters),
            session_id.clone(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            events,
            generation,
            session_id.clone(),
        ));

        inner.active = Some(ActiveSession {
            session_id: session_id.clone(),
            scheduler: PlaybackScheduler::new(
                Arc::clone(&output),
                self.options.interrupt_cancels_playback,
            ),
            transcripts: TranscriptAggregator::new(),
            input,
            output,
            transport,
            capture,
            pump,
            dispatch,
        });
        inner.counters = counters;
        inner.last_session_id = Some(session_id.clone());
        inner.state = SessionState::Open;

        self.shared.publish_caption(LiveCaption::default());
        self.shared.publish_status(true, true);
        tracing::info!(session_id = %session_id, "Voice session open");

        Ok(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::Pcm16Codec;
    use crate::voice::testing::{wait_until, MockInput, MockOutput, MockTransport};
    use crate::voice::{AudioFrame, Speaker};

    struct Rig {
        input: MockInput,
        output: MockOutput,
        transport: MockTransport,
        controller: SessionController,
    }

    fn rig_with(options: SessionOptions) -> Rig {
        let input = MockInput::new();
        let output = MockOutput::new();
        let transport = MockTransport::new();
        let controller = SessionController::new(
            Arc::new(input.clone()),
            Arc::new(output.clone()),
            Arc::new(transport.clone()),
            Arc::new(Pcm16Codec::default()),
            options,
        );
        Rig {
            input,
            output,
            transport,
            controller,
        }
    }

    fn rig() -> Rig {
        rig_with(SessionOptions::default())
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn chunk(duration_secs: f64) -> InboundEvent {
        InboundEvent::AudioChunk {
            samples: vec![0.0; 16],
            duration_secs,
        }
    }

    fn delta(speaker: Speaker, text: &str) -> InboundEvent {
        InboundEvent::TranscriptDelta {
            speaker,
            text: text.to_string(),
        }
    }

    #[test]
    fn status_indicator_mapping() {
        let idle = VoiceStatus::default();
        assert_eq!(idle.indicator(), StatusIndicator::Idle);
        let connecting = VoiceStatus {
            voice_mode_active: true,
            connected: false,
        };
        assert_eq!(connecting.indicator(), StatusIndicator::Connecting);
        let listening = VoiceStatus {
            voice_mode_active: true,
            connected: true,
        };
        assert_eq!(listening.indicator(), StatusIndicator::Listening);
    }

    #[tokio::test]
    async fn start_opens_session() {
        let rig = rig();
        let id = rig.controller.start().await.unwrap();

        assert_eq!(rig.controller.state(), SessionState::Open);
        assert_eq!(rig.controller.session_id().as_deref(), Some(id.as_str()));
        assert_eq!(
            rig.controller.status().indicator(),
            StatusIndicator::Listening
        );
        assert_eq!(rig.input.acquires(), 1);
        assert_eq!(rig.output.handle().acquires(), 1);
        assert_eq!(rig.transport.opens(), 1);
        assert!(rig.input.is_connected());
        assert!(approx(rig.controller.next_start_time(), 0.0));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let rig = rig();
        rig.controller.start().await.unwrap();
        let err = rig.controller.start().await.unwrap_err();
        assert!(matches!(err, VoiceError::AlreadyActive(SessionState::Open)));
        assert_eq!(rig.transport.opens(), 1);
    }

    #[tokio::test]
    async fn captured_frames_reach_transport_in_order() {
        let rig = rig();
        rig.controller.start().await.unwrap();

        for i in 0..10 {
            rig.input.push_frame(AudioFrame::new(vec![i as f32 / 20.0; 32]));
        }
        wait_until(|| rig.transport.sent().len() == 10).await;

        let seqs: Vec<u64> = rig.transport.sent().iter().map(|p| p.seq).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
        assert!(rig.transport.sent().iter().all(|p| p.data.len() == 64));
        assert_eq!(rig.controller.stats().packets_sent, 10);
    }

    #[tokio::test]
    async fn audio_chunks_follow_catch_up_schedule() {
        let rig = rig();
        let out = rig.output.handle();
        rig.controller.start().await.unwrap();

        out.set_now(0.00);
        rig.transport.emit(chunk(0.50)).await;
        wait_until(|| out.scheduled_starts().len() == 1).await;

        out.set_now(0.30);
        rig.transport.emit(chunk(0.50)).await;
        wait_until(|| out.scheduled_starts().len() == 2).await;

        out.set_now(1.30);
        rig.transport.emit(chunk(0.40)).await;
        wait_until(|| out.scheduled_starts().len() == 3).await;

        let starts = out.scheduled_starts();
        assert!(approx(starts[0], 0.00));
        assert!(approx(starts[1], 0.50));
        assert!(approx(starts[2], 1.30));
        assert!(approx(rig.controller.next_start_time(), 1.70));
        assert_eq!(rig.controller.stats().chunks_scheduled, 3);
        assert_eq!(rig.controller.stats().catch_ups, 1);
    }

    #[tokio::test]
    async fn turn_complete_finalizes_transcript() {
        let rig = rig();
        let mut turns = rig.controller.subscribe_turns();
        rig.controller.start().await.unwrap();

        rig.transport.emit(delta(Speaker::Caller, "Any open quotes?")).await;
        rig.transport.emit(delta(Speaker::Agent, "Hel")).await;
        rig.transport
            .emit(delta(Speaker::Agent, "lo, how can I help you"))
            .await;
        wait_until(|| rig.controller.caption().agent == "Hello, how can I help you").await;
        assert_eq!(rig.controller.caption().caller, "Any open quotes?");

        rig.transport.emit(InboundEvent::TurnComplete).await;
        let turn = turns.recv().await.unwrap();
        assert_eq!(turn.agent, "Hello, how can I help you");
        assert_eq!(turn.caller, "Any open quotes?");

        wait_until(|| rig.controller.caption() == LiveCaption::default()).await;
        assert_eq!(rig.controller.stats().turns, 1);
    }

    #[tokio::test]
    async fn interruption_resets_cursor_and_agent_caption() {
        let rig = rig();
        let out = rig.output.handle();
        rig.controller.start().await.unwrap();

        rig.transport.emit(chunk(1.0)).await;
        rig.transport.emit(chunk(0.7)).await;
        rig.transport.emit(delta(Speaker::Caller, "Actually, wait")).await;
        rig.transport.emit(delta(Speaker::Agent, "Sure, I can...")).await;
        wait_until(|| rig.controller.caption().agent == "Sure, I can...").await;
        assert!(approx(rig.controller.next_start_time(), 1.70));

        rig.transport.emit(InboundEvent::Interrupted).await;
        wait_until(|| rig.controller.caption().agent.is_empty()).await;

        assert!(approx(rig.controller.next_start_time(), 0.0));
        assert_eq!(rig.controller.caption().caller, "Actually, wait");
        // Already scheduled audio is left alone by default.
        assert_eq!(out.stopped_count(), 0);
        assert_eq!(rig.controller.stats().interruptions, 1);
    }

    #[tokio::test]
    async fn interruption_can_cancel_in_flight_playback() {
        let rig = rig_with(SessionOptions {
            interrupt_cancels_playback: true,
            ..SessionOptions::default()
        });
        let out = rig.output.handle();
        rig.controller.start().await.unwrap();

        rig.transport.emit(chunk(0.5)).await;
        rig.transport.emit(chunk(0.5)).await;
        wait_until(|| out.scheduled_starts().len() == 2).await;

        rig.transport.emit(InboundEvent::Interrupted).await;
        wait_until(|| out.stopped_count() == 2).await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let rig = rig();
        rig.controller.start().await.unwrap();

        rig.controller.stop();
        rig.controller.stop();

        assert_eq!(rig.controller.state(), SessionState::Idle);
        assert_eq!(rig.input.releases(), 1);
        assert_eq!(rig.input.disconnects(), 1);
        assert_eq!(rig.output.handle().releases(), 1);
        assert_eq!(rig.transport.closes(), 1);
        assert_eq!(rig.transport.stream_ends(), 1);
        assert!(!rig.input.is_connected());
        assert_eq!(rig.controller.status(), VoiceStatus::default());
    }

    #[tokio::test]
    async fn stop_while_idle_is_a_no_op() {
        let rig = rig();
        rig.controller.stop();
        assert_eq!(rig.controller.state(), SessionState::Idle);
        assert_eq!(rig.input.releases(), 0);
        assert_eq!(rig.transport.closes(), 0);
    }

    #[tokio::test]
    async fn failed_transport_open_leaves_no_residue() {
        let rig = rig();
        rig.transport.fail_open(true);
        let mut status = rig.controller.subscribe_status();

        let err = rig.controller.start().await.unwrap_err();
        assert!(matches!(err, VoiceError::Transport(_)));
        assert_eq!(rig.controller.state(), SessionState::Idle);
        assert_eq!(rig.input.held(), 0);
        assert_eq!(rig.output.handle().held(), 0);
        assert!(!rig.input.is_connected());
        assert_eq!(*status.borrow_and_update(), VoiceStatus::default());
    }

    #[tokio::test]
    async fn failed_output_acquisition_releases_input() {
        let rig = rig();
        rig.output.fail_acquire(true);

        let err = rig.controller.start().await.unwrap_err();
        assert!(matches!(err, VoiceError::Acquisition(_)));
        assert_eq!(rig.input.acquires(), 1);
        assert_eq!(rig.input.held(), 0);
        assert_eq!(rig.transport.opens(), 0);
        assert_eq!(rig.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_input_acquisition_returns_to_idle() {
        let rig = rig();
        rig.input.fail_acquire(true);

        let err = rig.controller.start().await.unwrap_err();
        assert!(matches!(err, VoiceError::Acquisition(_)));
        assert_eq!(rig.output.handle().acquires(), 0);
        assert_eq!(rig.controller.state(), SessionState::Idle);

        // The controller can start again once the device is available.
        rig.input.fail_acquire(false);
        rig.controller.start().await.unwrap();
        assert_eq!(rig.controller.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn stop_during_requesting_cancels_start() {
        let rig = rig();
        rig.transport.hold_open();

        let controller = rig.controller.clone();
        let pending = tokio::spawn(async move { controller.start().await });
        wait_until(|| rig.output.handle().acquires() == 1).await;
        assert_eq!(rig.controller.state(), SessionState::Requesting);
        assert_eq!(
            rig.controller.status().indicator(),
            StatusIndicator::Connecting
        );

        rig.controller.stop();
        assert_eq!(rig.controller.state(), SessionState::Idle);

        rig.transport.release_open();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(VoiceError::Cancelled)));
        assert_eq!(rig.input.held(), 0);
        assert_eq!(rig.output.handle().held(), 0);
        assert_eq!(rig.transport.closes(), 1);
        assert_eq!(rig.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn abandoned_start_releases_devices() {
        let rig = rig();
        rig.transport.hold_open();

        let controller = rig.controller.clone();
        let pending = tokio::spawn(async move { controller.start().await });
        wait_until(|| rig.output.handle().acquires() == 1).await;
        assert_eq!(rig.controller.state(), SessionState::Requesting);

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        assert_eq!(rig.controller.state(), SessionState::Idle);
        assert_eq!(rig.input.held(), 0);
        assert_eq!(rig.output.handle().held(), 0);
        assert!(!rig.input.is_connected());
        assert_eq!(rig.controller.status(), VoiceStatus::default());

        rig.transport.release_open();
        rig.controller.start().await.unwrap();
        assert_eq!(rig.controller.state(), SessionState::Open);
        assert_eq!(rig.input.held(), 1);
    }

    #[tokio::test]
    async fn remote_close_tears_down() {
        let rig = rig();
        rig.controller.start().await.unwrap();

        rig.transport.emit(InboundEvent::Closed).await;
        wait_until(|| rig.controller.state() == SessionState::Idle).await;

        assert_eq!(rig.input.releases(), 1);
        assert_eq!(rig.output.handle().releases(), 1);
        assert_eq!(rig.transport.closes(), 1);
        // Remote close does not announce end of audio stream.
        assert_eq!(rig.transport.stream_ends(), 0);

        // A later user stop is harmless.
        rig.controller.stop();
        assert_eq!(rig.input.releases(), 1);
    }

    #[tokio::test]
    async fn transport_error_tears_down() {
        let rig = rig();
        rig.controller.start().await.unwrap();

        rig.transport
            .emit(InboundEvent::Error {
                reason: "socket reset".into(),
            })
            .await;
        wait_until(|| rig.controller.state() == SessionState::Idle).await;
        assert_eq!(rig.input.held(), 0);
        assert_eq!(rig.output.handle().held(), 0);
    }

    #[tokio::test]
    async fn event_stream_end_tears_down() {
        let rig = rig();
        rig.controller.start().await.unwrap();

        rig.transport.hang_up();
        wait_until(|| rig.controller.state() == SessionState::Idle).await;
        assert_eq!(rig.transport.closes(), 1);
    }

    #[tokio::test]
    async fn release_failure_does_not_block_other_releases() {
        let rig = rig();
        rig.output.handle().fail_release(true);
        rig.controller.start().await.unwrap();

        rig.controller.stop();
        assert_eq!(rig.input.releases(), 1);
        assert_eq!(rig.output.handle().releases(), 1);
        assert_eq!(rig.transport.closes(), 1);
        assert_eq!(rig.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn restart_does_not_leak_state() {
        let rig = rig();
        rig.controller.start().await.unwrap();

        rig.transport.emit(chunk(1.0)).await;
        rig.transport.emit(delta(Speaker::Agent, "stale")).await;
        wait_until(|| rig.controller.caption().agent == "stale").await;
        rig.controller.stop();
        assert_eq!(rig.controller.caption(), LiveCaption::default());

        rig.controller.start().await.unwrap();
        assert!(approx(rig.controller.next_start_time(), 0.0));
        assert_eq!(rig.controller.caption(), LiveCaption::default());
        assert_eq!(rig.controller.stats(), SessionStats::default());

        rig.transport.emit(delta(Speaker::Agent, "fresh")).await;
        wait_until(|| rig.controller.caption().agent == "fresh").await;
    }

    #[tokio::test]
    async fn events_after_stop_are_ignored() {
        let rig = rig();
        let out = rig.output.handle();
        rig.controller.start().await.unwrap();
        rig.controller.stop();

        rig.transport.emit(chunk(0.5)).await;
        tokio::task::yield_now().await;
        assert!(out.scheduled_starts().is_empty());
        assert_eq!(rig.controller.state(), SessionState::Idle);
    }
}
