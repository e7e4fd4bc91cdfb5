//! Outbound audio path: frame callback → codec → ordered queue → transport.
//!
//! Every packet goes through a single bounded FIFO. The queue is drained by
//! one pump task that only exists once the transport is ready, so packets
//! reach the transport in capture order. The frame callback never blocks:
//! when the queue is full the newest frame is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::codec::FrameCodec;
use super::device::InputHandle;
use super::session::StatsCounters;
use super::transport::TransportSession;
use super::{AudioFrame, EncodedAudioPacket};

/// Connection between the input device and the outbound queue.
pub struct CaptureLoop {
    running: Arc<AtomicBool>,
}

impl CaptureLoop {
    /// Register the frame callback on `input` and start encoding.
    pub fn start(
        input: &dyn InputHandle,
        codec: Arc<dyn FrameCodec>,
        queue: mpsc::Sender<EncodedAudioPacket>,
        counters: Arc<StatsCounters>,
        session_id: String,
    ) -> anyhow::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let next_seq = AtomicU64::new(0);
        let running_cb = Arc::clone(&running);

        input.on_frame(Box::new(move |frame: AudioFrame| {
            if !running_cb.load(Ordering::Acquire) {
                return;
            }
            let seq = next_seq.fetch_add(1, Ordering::Relaxed);

            let data = match codec.encode(&frame.samples) {
                Ok(data) => data,
                Err(e) => {
                    counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        session_id = %session_id,
                        seq,
                        error = %e,
                        "Dropping frame that failed to encode"
                    );
                    return;
                }
            };

            match queue.try_send(EncodedAudioPacket { seq, data }) {
                Ok(()) => {
                    counters.packets_queued.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        session_id = %session_id,
                        seq,
                        "Outbound queue full, dropping frame"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Session is tearing down.
                }
            }
        }))?;

        Ok(Self { running })
    }

    /// Stop encoding. Frames delivered after this are ignored.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Drain the outbound queue into the transport, in order.
///
/// Ends when the queue closes or the transport refuses a packet.
pub async fn run_outbound_pump(
    mut queue: mpsc::Receiver<EncodedAudioPacket>,
    transport: Arc<dyn TransportSession>,
    counters: Arc<StatsCounters>,
    session_id: String,
) {
    let mut total_bytes: u64 = 0;

    while let Some(packet) = queue.recv().await {
        let seq = packet.seq;
        let len = packet.data.len();
        if let Err(e) = transport.send(packet).await {
            tracing::warn!(
                session_id = %session_id,
                seq,
                error = %e,
                "Transport send failed, closing outbound pump"
            );
            break;
        }
        let sent = counters.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;
        total_bytes += len as u64;
        if sent == 1 || sent.is_multiple_of(50) {
            tracing::info!(
                session_id = %session_id,
                packets = sent,
                total_bytes,
                "Streaming audio to agent"
            );
        }
    }

    tracing::debug!(session_id = %session_id, "Outbound pump terminated");
}
