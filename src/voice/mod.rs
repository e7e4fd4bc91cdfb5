//! Real-time duplex voice assistant session.
//!
//! Captures microphone frames, streams them to a remote conversational
//! agent, and plays the agent's synthesized speech back gaplessly while
//! aggregating incremental transcripts for live captioning.
//!
//! ## Design
//! - Trait seams for hardware (`InputDevice` / `OutputDevice`) and for the
//!   agent endpoint (`TransportConnector` / `TransportSession`)
//! - One ordered outbound queue, drained only once the transport is ready
//! - One ordered inbound event stream, dispatched by a single task
//! - `SessionController` owns every per-session resource; teardown is
//!   idempotent and releases each resource independently
//!
//! ```text
//! InputHandle ─▸ CaptureLoop ─▸ FrameCodec ─▸ queue ─▸ pump ─▸ TransportSession
//!                                                                   │
//!                      PlaybackScheduler ◂─┬─ dispatch ◂── events ◂─┘
//!                   TranscriptAggregator ◂─┘
//! ```

pub mod capture;
pub mod codec;
pub mod device;
pub mod error;
pub mod file_device;
pub mod gemini_live;
pub mod scheduler;
pub mod session;
pub mod transcript;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

// ── Shared inbound event type ────────────────────────────────────

/// Which side of the conversation a transcript fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The local user speaking into the microphone.
    Caller,
    /// The remote conversational agent.
    Agent,
}

/// Event delivered by a [`transport::TransportSession`], in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Decoded, playback-ready audio at the output sample rate.
    AudioChunk { samples: Vec<f32>, duration_secs: f64 },
    /// Incremental transcript fragment for one speaker.
    TranscriptDelta { speaker: Speaker, text: String },
    /// The active turn (both speakers) has finished.
    TurnComplete,
    /// Agent speech was cut off by new caller input.
    Interrupted,
    /// The remote side closed the channel.
    Closed,
    /// The channel failed.
    Error { reason: String },
}

impl InboundEvent {
    /// `Closed` and `Error` end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error { .. })
    }
}

/// One fixed-size buffer of raw samples from the input device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }
}

/// Wire-ready form of exactly one [`AudioFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioPacket {
    /// Capture index of the source frame, starting at 0 for each session.
    pub seq: u64,
    /// Codec output.
    pub data: Vec<u8>,
}

#[allow(unused_imports)]
pub use capture::CaptureLoop;
#[allow(unused_imports)]
pub use codec::{CodecError, FrameCodec, Pcm16Codec};
#[allow(unused_imports)]
pub use device::{InputDevice, InputHandle, OutputDevice, OutputHandle, PlaybackHandle};
#[allow(unused_imports)]
pub use error::VoiceError;
#[allow(unused_imports)]
pub use file_device::{FileInputDevice, FileOutputDevice};
#[allow(unused_imports)]
pub use gemini_live::{GeminiLiveConnector, GeminiLiveSession};
#[allow(unused_imports)]
pub use scheduler::PlaybackScheduler;
#[allow(unused_imports)]
pub use session::{
    SessionController, SessionState, SessionStats, StatusIndicator, VoiceStatus,
};
#[allow(unused_imports)]
pub use transcript::{LiveCaption, TranscriptAggregator, TurnTranscript};
#[allow(unused_imports)]
pub use transport::{TransportConnector, TransportSession};
