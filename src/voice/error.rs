use super::session::SessionState;
use thiserror::Error;

/// Failures surfaced by [`super::SessionController`].
///
/// The UI only needs a generic failure indication; the variants exist for
/// logging and tests.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice session already active (state: {0:?})")]
    AlreadyActive(SessionState),

    #[error("device acquisition failed: {0}")]
    Acquisition(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("voice session start cancelled by stop request")]
    Cancelled,

    #[error(transparent)]
    Codec(#[from] super::codec::CodecError),
}
