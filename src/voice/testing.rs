//! In-memory devices and transport used by the voice tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use super::device::{FrameCallback, InputDevice, InputHandle, OutputDevice, OutputHandle, PlaybackHandle};
use super::transport::{TransportConnector, TransportSession};
use super::{AudioFrame, EncodedAudioPacket, InboundEvent};

/// Poll `cond` until it holds or a second passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached within 1s");
}

// ── Input ────────────────────────────────────────────────────────

#[derive(Default)]
struct MockInputState {
    callback: Mutex<Option<FrameCallback>>,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    disconnects: AtomicUsize,
    fail_acquire: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MockInput {
    state: Arc<MockInputState>,
}

impl MockInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.state.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Deliver a frame as the device would. No-op when nothing is connected.
    pub fn push_frame(&self, frame: AudioFrame) {
        if let Some(cb) = self.state.callback.lock().as_ref() {
            cb(frame);
        }
    }

    pub fn clear_callback(&self) {
        self.state.callback.lock().take();
    }

    pub fn is_connected(&self) -> bool {
        self.state.callback.lock().is_some()
    }

    pub fn acquires(&self) -> usize {
        self.state.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Handles acquired and not yet released.
    pub fn held(&self) -> usize {
        self.acquires() - self.releases()
    }
}

struct MockInputHandle {
    state: Arc<MockInputState>,
}

#[async_trait]
impl InputDevice for MockInput {
    async fn acquire(&self) -> anyhow::Result<Box<dyn InputHandle>> {
        if self.state.fail_acquire.load(Ordering::SeqCst) {
            anyhow::bail!("microphone permission denied");
        }
        self.state.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockInputHandle {
            state: Arc::clone(&self.state),
        }))
    }
}

impl InputHandle for MockInputHandle {
    fn on_frame(&self, callback: FrameCallback) -> anyhow::Result<()> {
        *self.state.callback.lock() = Some(callback);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.callback.lock().take();
    }

    fn release(&self) -> anyhow::Result<()> {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Output ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockOutputHandle {
    now: Mutex<f64>,
    scheduled: Mutex<Vec<(f64, usize)>>,
    stopped: Arc<AtomicUsize>,
    fail_schedules: AtomicBool,
    fail_release: AtomicBool,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    fail_acquire: AtomicBool,
}

impl MockOutputHandle {
    pub fn set_now(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn scheduled_starts(&self) -> Vec<f64> {
        self.scheduled.lock().iter().map(|(start, _)| *start).collect()
    }

    pub fn stopped_count(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn fail_schedules(&self, fail: bool) {
        self.fail_schedules.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.acquires() - self.releases()
    }
}

struct MockPlayback {
    stopped: Arc<AtomicUsize>,
}

impl PlaybackHandle for MockPlayback {
    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

impl OutputHandle for MockOutputHandle {
    fn now(&self) -> f64 {
        *self.now.lock()
    }

    fn schedule(
        &self,
        samples: Vec<f32>,
        start_time: f64,
    ) -> anyhow::Result<Box<dyn PlaybackHandle>> {
        if self.fail_schedules.load(Ordering::SeqCst) {
            anyhow::bail!("output device rejected buffer");
        }
        self.scheduled.lock().push((start_time, samples.len()));
        Ok(Box::new(MockPlayback {
            stopped: Arc::clone(&self.stopped),
        }))
    }

    fn release(&self) -> anyhow::Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.load(Ordering::SeqCst) {
            anyhow::bail!("output device busy");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockOutput {
    handle: Arc<MockOutputHandle>,
}

impl MockOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<MockOutputHandle> {
        Arc::clone(&self.handle)
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.handle.fail_acquire.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutputDevice for MockOutput {
    async fn acquire(&self) -> anyhow::Result<Arc<dyn OutputHandle>> {
        if self.handle.fail_acquire.load(Ordering::SeqCst) {
            anyhow::bail!("no output device");
        }
        self.handle.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle.clone())
    }
}

// ── Transport ────────────────────────────────────────────────────

#[derive(Default)]
struct MockTransportState {
    sent: Mutex<Vec<EncodedAudioPacket>>,
    event_tx: Mutex<Option<mpsc::Sender<InboundEvent>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    stream_ends: AtomicUsize,
    fail_open: AtomicBool,
    hold_open: AtomicBool,
    gate: Notify,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockTransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session directly, bypassing the connector.
    pub fn session(&self) -> MockTransportSession {
        let (tx, rx) = mpsc::channel(64);
        *self.state.event_tx.lock() = Some(tx);
        MockTransportSession {
            state: Arc::clone(&self.state),
            events: Some(rx),
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make `open` wait until [`Self::release_open`] is called.
    pub fn hold_open(&self) {
        self.state.hold_open.store(true, Ordering::SeqCst);
    }

    pub fn release_open(&self) {
        self.state.hold_open.store(false, Ordering::SeqCst);
        self.state.gate.notify_one();
    }

    /// Deliver an inbound event, as the remote agent would.
    pub async fn emit(&self, event: InboundEvent) {
        let tx = self.state.event_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Drop the inbound sender so the event stream ends.
    pub fn hang_up(&self) {
        self.state.event_tx.lock().take();
    }

    pub fn sent(&self) -> Vec<EncodedAudioPacket> {
        self.state.sent.lock().clone()
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn stream_ends(&self) -> usize {
        self.state.stream_ends.load(Ordering::SeqCst)
    }
}

pub struct MockTransportSession {
    state: Arc<MockTransportState>,
    events: Option<mpsc::Receiver<InboundEvent>>,
}

#[async_trait]
impl TransportConnector for MockTransport {
    async fn open(&self, _session_id: &str) -> anyhow::Result<Box<dyn TransportSession>> {
        if self.state.hold_open.load(Ordering::SeqCst) {
            self.state.gate.notified().await;
        }
        if self.state.fail_open.load(Ordering::SeqCst) {
            anyhow::bail!("agent endpoint refused connection");
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.session()))
    }
}

#[async_trait]
impl TransportSession for MockTransportSession {
    async fn send(&self, packet: EncodedAudioPacket) -> anyhow::Result<()> {
        self.state.sent.lock().push(packet);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.events.take()
    }

    fn end_audio_stream(&self) {
        self.state.stream_ends.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
