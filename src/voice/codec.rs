//! Frame codec: raw samples ⇄ transport payload.
//!
//! The wire encoding is 16-bit little-endian mono PCM, which is what
//! Gemini Live accepts as `audio/pcm;rate=16000` input and emits as
//! `audio/pcm;rate=24000` output. Encoding is pure and strictly per-frame.

use thiserror::Error;

/// Input sample rate expected by the agent endpoint.
pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16_000;

/// Output sample rate of the agent's synthesized speech.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("empty audio frame")]
    EmptyFrame,

    #[error("non-finite sample at index {0}")]
    NonFiniteSample(usize),

    #[error("odd PCM16 payload length: {0} bytes")]
    OddPayload(usize),
}

/// Decoded playback-ready audio.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub duration_secs: f64,
}

/// Pure, order-preserving transform between sample buffers and payloads.
///
/// Implementations must not buffer across calls: frame *i* always yields
/// payload *i*.
pub trait FrameCodec: Send + Sync {
    /// Encode one captured frame.
    fn encode(&self, samples: &[f32]) -> Result<Vec<u8>, CodecError>;

    /// Decode one inbound payload into samples at the output rate.
    fn decode(&self, payload: &[u8]) -> Result<DecodedAudio, CodecError>;

    /// MIME type announced for encoded input audio.
    fn input_mime(&self) -> String;
}

/// 16-bit little-endian PCM codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pcm16Codec {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl Default for Pcm16Codec {
    fn default() -> Self {
        Self {
            input_sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
        }
    }
}

impl Pcm16Codec {
    pub fn new(input_sample_rate: u32, output_sample_rate: u32) -> Self {
        Self {
            input_sample_rate,
            output_sample_rate,
        }
    }
}

impl FrameCodec for Pcm16Codec {
    fn encode(&self, samples: &[f32]) -> Result<Vec<u8>, CodecError> {
        if samples.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let mut out = Vec::with_capacity(samples.len() * 2);
        for (i, &s) in samples.iter().enumerate() {
            if !s.is_finite() {
                return Err(CodecError::NonFiniteSample(i));
            }
            out.extend_from_slice(&f32_to_i16(s).to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedAudio, CodecError> {
        if payload.len() % 2 != 0 {
            return Err(CodecError::OddPayload(payload.len()));
        }
        let samples: Vec<f32> = payload
            .chunks_exact(2)
            .map(|b| i16_to_f32(i16::from_le_bytes([b[0], b[1]])))
            .collect();
        let duration_secs = samples.len() as f64 / f64::from(self.output_sample_rate.max(1));
        Ok(DecodedAudio {
            samples,
            duration_secs,
        })
    }

    fn input_mime(&self) -> String {
        format!("audio/pcm;rate={}", self.input_sample_rate)
    }
}

/// Clamp to [-1, 1] and scale to the asymmetric i16 range.
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        f32::from(sample) / 32768.0
    } else {
        f32::from(sample) / 32767.0
    }
}
