//! Agent endpoint seam.
//!
//! A transport is an opaque bidirectional channel: packets go out, one
//! ordered stream of [`InboundEvent`]s comes back. The wire format is the
//! implementation's business.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{EncodedAudioPacket, InboundEvent};

/// Opens transport sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a session. Resolves only once the remote side reports ready.
    async fn open(&self, session_id: &str) -> anyhow::Result<Box<dyn TransportSession>>;
}

/// An open, ready transport session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Send one packet. Packets are delivered in call order.
    async fn send(&self, packet: EncodedAudioPacket) -> anyhow::Result<()>;

    /// Take the inbound event stream. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<InboundEvent>>;

    /// Tell the remote side no more audio follows.
    fn end_audio_stream(&self);

    /// Close the channel. Must not block and may be called more than once.
    fn close(&self);
}
