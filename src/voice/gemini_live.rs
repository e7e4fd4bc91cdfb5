//! Gemini Live WebSocket transport.
//!
//! Implements [`TransportConnector`] / [`TransportSession`] over Google's
//! BidiGenerateContent streaming protocol.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to the Live endpoint
//! 2. **Setup**: send the setup message (model, voice, transcription)
//! 3. **Ready**: wait for `setupComplete`; only then is the session handed
//!    to the controller
//! 4. **Stream**: send audio as `realtimeInput`, receive `serverContent`
//! 5. **Close**: optional `audioStreamEnd`, then a close frame
//!
//! Gemini Live sends JSON control messages in Binary frames as well as Text
//! frames. Both are parsed; a Binary frame that is not JSON is skipped.

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::codec::FrameCodec;
use super::transport::{TransportConnector, TransportSession};
use super::{EncodedAudioPacket, InboundEvent, Speaker};
use crate::config::TransportConfig;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Setup message (JSON sent as first frame) ───────────────────────

/// Top-level setup message for Gemini Live session initialization.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    /// Presence enables caller-speech transcription.
    #[serde(rename = "inputAudioTranscription")]
    pub input_audio_transcription: serde_json::Value,
    /// Presence enables agent-speech transcription.
    #[serde(rename = "outputAudioTranscription")]
    pub output_audio_transcription: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Build the setup message for a voice assistant session.
pub fn build_setup_message(config: &TransportConfig) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", config.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: config
                .system_prompt
                .as_ref()
                .filter(|p| !p.trim().is_empty())
                .map(|text| SystemInstruction {
                    parts: vec![TextPart { text: text.clone() }],
                }),
            input_audio_transcription: serde_json::json!({}),
            output_audio_transcription: serde_json::json!({}),
        },
    }
}

// ── Audio input messages ───────────────────────────────────────────

/// Audio input message sent to Gemini Live.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk>,
}

/// Audio chunk with MIME type and base64-encoded data.
#[derive(Debug, Serialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// Signals that the microphone stopped.
#[derive(Debug, Serialize)]
pub struct AudioStreamEndMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: AudioStreamEndPayload,
}

#[derive(Debug, Serialize)]
pub struct AudioStreamEndPayload {
    #[serde(rename = "audioStreamEnd")]
    pub audio_stream_end: bool,
}

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "...", "data": "<base64>"}]}}`
pub fn build_audio_message(mime_type: &str, payload: &[u8]) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: mime_type.to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(payload),
            }],
        },
    }
}

pub fn build_audio_stream_end_message() -> AudioStreamEndMessage {
    AudioStreamEndMessage {
        realtime_input: AudioStreamEndPayload {
            audio_stream_end: true,
        },
    }
}

// ── Server messages ────────────────────────────────────────────────

/// One logical event carried by a server message, before audio decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// Raw PCM16 agent audio.
    Audio { data: Vec<u8> },
    Transcript { speaker: Speaker, text: String },
    TurnComplete,
    Interrupted,
    Error { message: String },
}

fn transcription_text(value: Option<&serde_json::Value>) -> Option<&str> {
    value
        .and_then(|t| t.get("text"))
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
}

/// Parse one JSON server message into events, in dispatch order.
///
/// A single message can carry several events. They are emitted as:
/// interruption, model-turn parts, caller transcript, agent transcript,
/// turn completion, error. An interruption applies to audio already sent,
/// and a turn only completes after its own content.
///
/// A frame that is not valid JSON is logged and yields no events; only a
/// server-sent `error` object ends the session.
pub fn parse_server_message(json_text: &str) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                error = %e,
                len = json_text.len(),
                "Skipping malformed Gemini Live server message"
            );
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    let content = value.get("serverContent");

    if content
        .and_then(|c| c.get("interrupted"))
        .and_then(|v| v.as_bool())
        == Some(true)
    {
        events.push(ServerEvent::Interrupted);
    }

    if let Some(parts) = content
        .and_then(|c| c.pointer("/modelTurn/parts"))
        .and_then(|v| v.as_array())
    {
        for part in parts {
            if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                match base64::engine::general_purpose::STANDARD.decode(data_b64) {
                    Ok(data) => events.push(ServerEvent::Audio { data }),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping audio part with invalid base64");
                    }
                }
            }
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                events.push(ServerEvent::Transcript {
                    speaker: Speaker::Agent,
                    text: text.to_string(),
                });
            }
        }
    }

    // Transcriptions may sit inside serverContent or at the top level.
    for (key, speaker) in [
        ("inputTranscription", Speaker::Caller),
        ("outputTranscription", Speaker::Agent),
    ] {
        let nested = transcription_text(content.and_then(|c| c.get(key)));
        let top = transcription_text(value.get(key));
        if let Some(text) = nested.or(top) {
            events.push(ServerEvent::Transcript {
                speaker,
                text: text.to_string(),
            });
        }
    }

    if content
        .and_then(|c| c.get("turnComplete"))
        .and_then(|v| v.as_bool())
        == Some(true)
    {
        events.push(ServerEvent::TurnComplete);
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(ServerEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

/// Turn a server event into an inbound session event.
///
/// Audio is decoded here; a chunk that fails to decode is dropped.
pub fn to_inbound(
    event: ServerEvent,
    codec: &dyn FrameCodec,
    session_id: &str,
) -> Option<InboundEvent> {
    match event {
        ServerEvent::SetupComplete => None,
        ServerEvent::Audio { data } => match codec.decode(&data) {
            Ok(decoded) => Some(InboundEvent::AudioChunk {
                samples: decoded.samples,
                duration_secs: decoded.duration_secs,
            }),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    bytes = data.len(),
                    error = %e,
                    "Dropping agent audio that failed to decode"
                );
                None
            }
        },
        ServerEvent::Transcript { speaker, text } => {
            Some(InboundEvent::TranscriptDelta { speaker, text })
        }
        ServerEvent::TurnComplete => Some(InboundEvent::TurnComplete),
        ServerEvent::Interrupted => Some(InboundEvent::Interrupted),
        ServerEvent::Error { message } => Some(InboundEvent::Error { reason: message }),
    }
}

// ── Connector ──────────────────────────────────────────────────────

/// Opens Gemini Live sessions.
pub struct GeminiLiveConnector {
    config: TransportConfig,
    api_key: String,
    codec: Arc<dyn FrameCodec>,
    outbound_capacity: usize,
    inbound_capacity: usize,
}

impl GeminiLiveConnector {
    pub fn new(
        config: TransportConfig,
        api_key: String,
        codec: Arc<dyn FrameCodec>,
        outbound_capacity: usize,
        inbound_capacity: usize,
    ) -> Self {
        Self {
            config,
            api_key,
            codec,
            outbound_capacity: outbound_capacity.max(1),
            inbound_capacity: inbound_capacity.max(1),
        }
    }

    /// Send setup and wait for `setupComplete`.
    async fn handshake(&self, ws_stream: &mut WsStream, session_id: &str) -> anyhow::Result<()> {
        let setup_json = serde_json::to_string(&build_setup_message(&self.config))?;
        tracing::debug!(session_id = %session_id, setup = %setup_json, "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send setup message: {e}"))?;

        let timeout = Duration::from_secs(self.config.setup_timeout_secs);
        let wait = async {
            while let Some(msg_result) = ws_stream.next().await {
                let text = match msg_result {
                    Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                    Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                        String::from_utf8_lossy(&data).into_owned()
                    }
                    Ok(WsMessage::Close(frame)) => {
                        anyhow::bail!("Connection closed before setupComplete: {frame:?}");
                    }
                    Err(e) => anyhow::bail!("WebSocket error before setupComplete: {e}"),
                    Ok(other) => {
                        tracing::debug!(
                            session_id = %session_id,
                            msg = ?other,
                            "Gemini Live setup phase: ignoring frame"
                        );
                        continue;
                    }
                };
                for event in parse_server_message(&text) {
                    match event {
                        ServerEvent::SetupComplete => return Ok(()),
                        ServerEvent::Error { message } => {
                            anyhow::bail!("Gemini Live rejected setup: {message}")
                        }
                        _ => {}
                    }
                }
            }
            anyhow::bail!("Stream ended before setupComplete")
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "Gemini Live setupComplete timeout ({}s)",
                self.config.setup_timeout_secs
            ),
        }
    }
}

#[async_trait]
impl TransportConnector for GeminiLiveConnector {
    async fn open(&self, session_id: &str) -> anyhow::Result<Box<dyn TransportSession>> {
        let url = format!("{}?key={}", self.config.endpoint, self.api_key);

        tracing::info!(
            session_id = %session_id,
            model = %self.config.model,
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Gemini Live: {e}"))?;

        self.handshake(&mut ws_stream, session_id).await?;
        tracing::info!(session_id = %session_id, "Gemini Live setup complete, ready to stream");

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (audio_tx, audio_rx) = mpsc::channel::<EncodedAudioPacket>(self.outbound_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let (event_tx, event_rx) = mpsc::channel::<InboundEvent>(self.inbound_capacity);

        let mime = self.codec.input_mime();
        let sid_out = session_id.to_string();
        tokio::spawn(async move {
            outbound_loop(audio_rx, control_rx, ws_sender, mime, sid_out).await;
        });

        let codec = Arc::clone(&self.codec);
        let sid_in = session_id.to_string();
        tokio::spawn(async move {
            inbound_loop(ws_receiver, event_tx, codec, sid_in).await;
        });

        Ok(Box::new(GeminiLiveSession {
            audio_tx,
            control_tx,
            events: Some(event_rx),
            session_id: session_id.to_string(),
        }))
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Control message to the WebSocket writer task.
///
/// Travels on its own unbounded channel so a full audio queue can never
/// hold back the end-of-stream signal or the close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMessage {
    AudioStreamEnd,
    Close,
}

/// An open Gemini Live session.
pub struct GeminiLiveSession {
    audio_tx: mpsc::Sender<EncodedAudioPacket>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    events: Option<mpsc::Receiver<InboundEvent>>,
    session_id: String,
}

impl GeminiLiveSession {
    fn send_control(&self, msg: ControlMessage) {
        if self.control_tx.send(msg).is_err() {
            tracing::debug!(
                session_id = %self.session_id,
                msg = ?msg,
                "Writer already stopped, dropping control message"
            );
        }
    }
}

#[async_trait]
impl TransportSession for GeminiLiveSession {
    async fn send(&self, packet: EncodedAudioPacket) -> anyhow::Result<()> {
        if packet.data.is_empty() {
            return Ok(());
        }
        self.audio_tx
            .send(packet)
            .await
            .map_err(|_| anyhow::anyhow!("Audio channel closed"))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.events.take()
    }

    fn end_audio_stream(&self) {
        self.send_control(ControlMessage::AudioStreamEnd);
    }

    fn close(&self) {
        self.send_control(ControlMessage::Close);
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        // A second Close after close() is ignored by the stopped writer.
        let _ = self.control_tx.send(ControlMessage::Close);
    }
}

// ── Internal loops ─────────────────────────────────────────────────

async fn send_json<S, T>(ws_sender: &mut S, msg: &T, session_id: &str) -> bool
where
    S: Sink<WsMessage> + Unpin,
    T: Serialize,
{
    match serde_json::to_string(msg) {
        Ok(json) => ws_sender.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Failed to serialize message");
            true
        }
    }
}

async fn send_audio<S>(
    ws_sender: &mut S,
    packet: &EncodedAudioPacket,
    mime_type: &str,
    audio_chunk_count: &mut u64,
    session_id: &str,
) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    *audio_chunk_count += 1;
    if *audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
        tracing::debug!(
            session_id = %session_id,
            chunk = *audio_chunk_count,
            seq = packet.seq,
            bytes = packet.data.len(),
            "Sending audio chunk to Gemini"
        );
    }
    let audio_msg = build_audio_message(mime_type, &packet.data);
    if send_json(ws_sender, &audio_msg, session_id).await {
        true
    } else {
        tracing::warn!(session_id = %session_id, "WebSocket send failed, closing outbound loop");
        false
    }
}

/// Writer task: serialize outbound messages onto the socket.
///
/// Control messages take priority over queued audio. Audio already queued
/// when `AudioStreamEnd` arrives is flushed first so the end marker still
/// follows the last packet; `Close` sends a close frame immediately.
async fn outbound_loop<S>(
    mut audio_rx: mpsc::Receiver<EncodedAudioPacket>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    mut ws_sender: S,
    mime_type: String,
    session_id: String,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut audio_chunk_count: u64 = 0;

    loop {
        tokio::select! {
            biased;
            control = control_rx.recv() => match control {
                Some(ControlMessage::AudioStreamEnd) => {
                    let mut ok = true;
                    while let Ok(packet) = audio_rx.try_recv() {
                        ok = send_audio(&mut ws_sender, &packet, &mime_type, &mut audio_chunk_count, &session_id).await;
                        if !ok {
                            break;
                        }
                    }
                    tracing::info!(session_id = %session_id, "Sending audioStreamEnd to Gemini Live");
                    if !ok || !send_json(&mut ws_sender, &build_audio_stream_end_message(), &session_id).await {
                        break;
                    }
                }
                Some(ControlMessage::Close) | None => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            audio = audio_rx.recv() => match audio {
                Some(packet) => {
                    if !send_audio(&mut ws_sender, &packet, &mime_type, &mut audio_chunk_count, &session_id).await {
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }

    tracing::debug!(session_id = %session_id, "Outbound loop terminated");
}

/// Events carried by one text frame, in dispatch order.
fn inbound_events(text: &str, codec: &dyn FrameCodec, session_id: &str) -> Vec<InboundEvent> {
    parse_server_message(text)
        .into_iter()
        .filter_map(|event| to_inbound(event, codec, session_id))
        .collect()
}

/// Reader task: turn socket frames into one ordered event stream.
async fn inbound_loop(
    mut ws_receiver: SplitStream<WsStream>,
    event_tx: mpsc::Sender<InboundEvent>,
    codec: Arc<dyn FrameCodec>,
    session_id: String,
) {
    let start_time = std::time::Instant::now();
    let mut audio_response_count: u64 = 0;

    let terminal = loop {
        let text = match ws_receiver.next().await {
            Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
            Some(Ok(WsMessage::Binary(data))) => {
                if data.first() != Some(&b'{') {
                    if !data.is_empty() {
                        tracing::warn!(
                            session_id = %session_id,
                            len = data.len(),
                            "Unexpected non-JSON binary frame from Gemini Live, skipping"
                        );
                    }
                    continue;
                }
                match std::str::from_utf8(&data) {
                    Ok(text) => text.to_owned(),
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Non-UTF-8 JSON frame, skipping");
                        continue;
                    }
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
                break InboundEvent::Closed;
            }
            Some(Ok(_)) => continue, // ping/pong handled by tungstenite
            Some(Err(e)) => {
                tracing::error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                break InboundEvent::Error {
                    reason: format!("WebSocket error: {e}"),
                };
            }
            None => break InboundEvent::Closed,
        };

        let elapsed = start_time.elapsed().as_secs_f32();
        for event in inbound_events(&text, codec.as_ref(), &session_id) {
            match &event {
                InboundEvent::AudioChunk { duration_secs, .. } => {
                    audio_response_count += 1;
                    tracing::trace!(
                        session_id = %session_id,
                        t = format!("{elapsed:.1}s"),
                        audio_n = audio_response_count,
                        duration_secs,
                        "⬇ Agent audio"
                    );
                }
                InboundEvent::TurnComplete => {
                    tracing::debug!(
                        session_id = %session_id,
                        t = format!("{elapsed:.1}s"),
                        audio_chunks = audio_response_count,
                        "⬇ Turn complete"
                    );
                }
                InboundEvent::Interrupted => {
                    tracing::debug!(session_id = %session_id, t = format!("{elapsed:.1}s"), "⬇ Interrupted");
                }
                _ => {}
            }
            let terminal = event.is_terminal();
            if event_tx.send(event).await.is_err() {
                tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                return;
            }
            if terminal {
                tracing::debug!(session_id = %session_id, "Inbound loop terminated by server error");
                return;
            }
        }
    };

    let _ = event_tx.send(terminal).await;
    tracing::debug!(session_id = %session_id, "Inbound loop terminated");
}

// ── Tests ──────────────────────────────────────────────────────────
