//! File-backed capture and playback devices.
//!
//! Both sides use raw 16-bit little-endian mono PCM with no header. The
//! input replays a recording at real-time cadence; the output mixes every
//! scheduled buffer into a timeline and writes it out on release. The write
//! runs on the blocking pool; [`FileOutputDevice::flush`] waits for it.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::codec::{f32_to_i16, i16_to_f32};
use super::device::{FrameCallback, InputDevice, InputHandle, OutputDevice, OutputHandle, PlaybackHandle};
use super::AudioFrame;

fn read_pcm16(bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        anyhow::bail!("PCM16 file has odd length ({} bytes)", bytes.len());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16_to_f32(i16::from_le_bytes([b[0], b[1]])))
        .collect())
}

fn write_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    out
}

// ── Input ────────────────────────────────────────────────────────

/// Replays a PCM16 recording as if it were a microphone.
///
/// After the recording ends, silent frames keep flowing so the remote
/// agent's voice activity detection can close the caller's turn.
#[derive(Debug, Clone)]
pub struct FileInputDevice {
    path: PathBuf,
    frame_len: usize,
    sample_rate: u32,
}

impl FileInputDevice {
    pub fn new(path: impl Into<PathBuf>, frame_len: usize, sample_rate: u32) -> Self {
        Self {
            path: path.into(),
            frame_len: frame_len.max(1),
            sample_rate: sample_rate.max(1),
        }
    }
}

#[async_trait]
impl InputDevice for FileInputDevice {
    async fn acquire(&self) -> anyhow::Result<Box<dyn InputHandle>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to open input {}", self.path.display()))?;
        let samples = read_pcm16(&bytes)?;
        tracing::debug!(
            path = %self.path.display(),
            samples = samples.len(),
            "File input acquired"
        );
        Ok(Box::new(FileInputHandle {
            samples: Arc::new(samples),
            frame_len: self.frame_len,
            frame_period: Duration::from_secs_f64(self.frame_len as f64 / self.sample_rate as f64),
            callback: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }))
    }
}

struct FileInputHandle {
    samples: Arc<Vec<f32>>,
    frame_len: usize,
    frame_period: Duration,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InputHandle for FileInputHandle {
    fn on_frame(&self, callback: FrameCallback) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("File input needs a tokio runtime: {e}"))?;
        *self.callback.lock() = Some(callback);

        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let samples = Arc::clone(&self.samples);
        let callback = Arc::clone(&self.callback);
        let frame_len = self.frame_len;
        let period = self.frame_period;
        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut offset = 0usize;
            loop {
                ticker.tick().await;
                let mut frame = vec![0.0f32; frame_len];
                if offset < samples.len() {
                    let end = (offset + frame_len).min(samples.len());
                    frame[..end - offset].copy_from_slice(&samples[offset..end]);
                    offset = end;
                }
                match callback.lock().as_ref() {
                    Some(cb) => cb(AudioFrame::new(frame)),
                    None => break,
                }
            }
        }));
        Ok(())
    }

    fn disconnect(&self) {
        self.callback.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn release(&self) -> anyhow::Result<()> {
        self.disconnect();
        Ok(())
    }
}

// ── Output ───────────────────────────────────────────────────────

type PendingWrites = Arc<Mutex<Vec<JoinHandle<anyhow::Result<()>>>>>;

/// Collects scheduled agent audio and writes it to a PCM16 file.
#[derive(Debug, Clone)]
pub struct FileOutputDevice {
    path: PathBuf,
    sample_rate: u32,
    writes: PendingWrites,
}

impl FileOutputDevice {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            path: path.into(),
            sample_rate: sample_rate.max(1),
            writes: Arc::default(),
        }
    }

    /// Wait for every file write started by a handle release.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let pending = std::mem::take(&mut *self.writes.lock());
        for write in pending {
            write.await.context("Output writer task failed")??;
        }
        Ok(())
    }
}

#[async_trait]
impl OutputDevice for FileOutputDevice {
    async fn acquire(&self) -> anyhow::Result<Arc<dyn OutputHandle>> {
        Ok(Arc::new(FileOutputHandle {
            path: self.path.clone(),
            sample_rate: self.sample_rate,
            started: Instant::now(),
            timeline: Arc::new(Mutex::new(Vec::new())),
            released: AtomicBool::new(false),
            writes: Arc::clone(&self.writes),
        }))
    }
}

struct FileOutputHandle {
    path: PathBuf,
    sample_rate: u32,
    started: Instant,
    timeline: Arc<Mutex<Vec<f32>>>,
    released: AtomicBool,
    writes: PendingWrites,
}

impl FileOutputHandle {
    fn index_at(&self, time: f64) -> usize {
        (time.max(0.0) * self.sample_rate as f64).round() as usize
    }
}

impl OutputHandle for FileOutputHandle {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn schedule(
        &self,
        samples: Vec<f32>,
        start_time: f64,
    ) -> anyhow::Result<Box<dyn PlaybackHandle>> {
        let start = self.index_at(start_time);
        {
            let mut timeline = self.timeline.lock();
            if self.released.load(Ordering::Acquire) {
                anyhow::bail!("Output {} already released", self.path.display());
            }
            let end = start + samples.len();
            if timeline.len() < end {
                timeline.resize(end, 0.0);
            }
            for (slot, s) in timeline[start..end].iter_mut().zip(&samples) {
                *slot += s;
            }
        }
        Ok(Box::new(FilePlayback {
            timeline: Arc::clone(&self.timeline),
            samples,
            start,
            started: self.started,
            sample_rate: self.sample_rate,
            stopped: AtomicBool::new(false),
        }))
    }

    fn release(&self) -> anyhow::Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let samples = std::mem::take(&mut *self.timeline.lock());
        let path = self.path.clone();
        let write = move || -> anyhow::Result<()> {
            let bytes = write_pcm16(&samples);
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write output {}", path.display()))?;
            tracing::debug!(path = %path.display(), bytes = bytes.len(), "File output written");
            Ok(())
        };

        // Release is called under the session lock; keep file I/O off it.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.writes.lock().push(runtime.spawn_blocking(write));
                Ok(())
            }
            Err(_) => write(),
        }
    }
}

struct FilePlayback {
    timeline: Arc<Mutex<Vec<f32>>>,
    samples: Vec<f32>,
    start: usize,
    started: Instant,
    sample_rate: u32,
    stopped: AtomicBool,
}

impl PlaybackHandle for FilePlayback {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let played = (self.started.elapsed().as_secs_f64() * self.sample_rate as f64) as usize;
        let skip = played.saturating_sub(self.start).min(self.samples.len());
        let mut timeline = self.timeline.lock();
        let end = self.start + self.samples.len();
        // Empty once the output was released and written.
        if timeline.len() < end {
            return;
        }
        let from = self.start + skip;
        for (slot, s) in timeline[from..end]
            .iter_mut()
            .zip(&self.samples[skip..])
        {
            *slot -= s;
        }
    }
}
