//! Capture and playback device seams.
//!
//! Hardware access lives behind these traits. The session only ever sees a
//! handle that delivers fixed-size frames and a handle that accepts
//! scheduled buffers against its own clock.

use async_trait::async_trait;
use std::sync::Arc;

use super::AudioFrame;

/// Called once per captured frame, on whatever context the device uses.
///
/// Must return promptly; it runs on the real-time capture path.
pub type FrameCallback = Box<dyn Fn(AudioFrame) + Send + Sync>;

/// A microphone-like source.
#[async_trait]
pub trait InputDevice: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Box<dyn InputHandle>>;
}

/// An acquired input device.
pub trait InputHandle: Send + Sync {
    /// Start delivering frames to `callback`. Replaces any earlier callback.
    fn on_frame(&self, callback: FrameCallback) -> anyhow::Result<()>;

    /// Stop delivering frames. Safe to call more than once.
    fn disconnect(&self);

    /// Give the device back.
    fn release(&self) -> anyhow::Result<()>;
}

/// A speaker-like sink with its own monotonic clock.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Arc<dyn OutputHandle>>;
}

/// An acquired output device.
pub trait OutputHandle: Send + Sync {
    /// Current device clock in seconds.
    fn now(&self) -> f64;

    /// Queue `samples` to start playing at `start_time` (device clock).
    fn schedule(&self, samples: Vec<f32>, start_time: f64)
        -> anyhow::Result<Box<dyn PlaybackHandle>>;

    fn release(&self) -> anyhow::Result<()>;
}

/// One buffer already handed to the output device.
pub trait PlaybackHandle: Send + Sync {
    /// Silence whatever part of the buffer has not played yet.
    fn stop(&self);
}
