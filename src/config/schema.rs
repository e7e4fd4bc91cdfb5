use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::voice::codec::{DEFAULT_INPUT_SAMPLE_RATE, DEFAULT_OUTPUT_SAMPLE_RATE};

/// Default Gemini Live WebSocket endpoint.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Top-level configuration, read from `~/.voxdesk/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_frame_len() -> usize {
    4096
}

fn default_input_sample_rate() -> u32 {
    DEFAULT_INPUT_SAMPLE_RATE
}

fn default_output_sample_rate() -> u32 {
    DEFAULT_OUTPUT_SAMPLE_RATE
}

fn default_queue_capacity() -> usize {
    256
}

/// `[voice]`: audio pipeline tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Samples per captured frame.
    #[serde(default = "default_frame_len")]
    pub frame_len: usize,
    /// Capture rate in Hz.
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    /// Playback rate of agent audio in Hz.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    /// Bound of the ordered outbound packet queue.
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Bound of the inbound event channel.
    #[serde(default = "default_queue_capacity")]
    pub inbound_queue_capacity: usize,
    /// Stop already-scheduled agent audio on interruption.
    #[serde(default)]
    pub interrupt_cancels_playback: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            frame_len: default_frame_len(),
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            outbound_queue_capacity: default_queue_capacity(),
            inbound_queue_capacity: default_queue_capacity(),
            interrupt_cancels_playback: false,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_LIVE_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_LIVE_MODEL.to_string()
}

fn default_voice_name() -> String {
    "Aoede".to_string()
}

fn default_setup_timeout_secs() -> u64 {
    15
}

/// `[transport]`: agent endpoint.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice_name")]
    pub voice_name: String,
    /// Optional system instruction for the agent.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Seconds to wait for `setupComplete`.
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
    /// Falls back to `GEMINI_API_KEY` / `GOOGLE_API_KEY` when unset.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            voice_name: default_voice_name(),
            system_prompt: None,
            setup_timeout_secs: default_setup_timeout_secs(),
            api_key: None,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("system_prompt", &self.system_prompt)
            .field("setup_timeout_secs", &self.setup_timeout_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl TransportConfig {
    /// Configured key, else the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}
