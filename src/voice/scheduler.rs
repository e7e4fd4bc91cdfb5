//! Gapless playback scheduling for inbound agent audio.
//!
//! Chunks are placed back-to-back on the output device clock. When the
//! scheduler falls behind (a chunk arrives after the cursor has already
//! passed), the cursor catches up to the device clock instead of stacking
//! an ever-growing delay; that one chunk plays after an audible gap.

use std::collections::VecDeque;
use std::sync::Arc;

use super::device::{OutputHandle, PlaybackHandle};

/// A buffer handed to the device, kept so it can be cancelled.
struct ScheduledPlayback {
    end_time: f64,
    handle: Box<dyn PlaybackHandle>,
}

/// Owns the scheduling cursor for one session.
pub struct PlaybackScheduler {
    output: Arc<dyn OutputHandle>,
    next_start_time: f64,
    in_flight: VecDeque<ScheduledPlayback>,
    cancel_on_interrupt: bool,
    catch_ups: u64,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn OutputHandle>, cancel_on_interrupt: bool) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            in_flight: VecDeque::new(),
            cancel_on_interrupt,
            catch_ups: 0,
        }
    }

    /// Next available start time for gapless playback.
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// How many times the cursor jumped forward to the device clock.
    pub fn catch_ups(&self) -> u64 {
        self.catch_ups
    }

    /// Schedule one chunk and return its start time.
    ///
    /// On device failure the chunk is dropped and the cursor is unchanged.
    pub fn schedule(&mut self, samples: Vec<f32>, duration_secs: f64) -> anyhow::Result<f64> {
        let now = self.output.now();
        if self.next_start_time < now {
            // A zero cursor is a fresh start, not a fall-behind.
            if self.next_start_time > 0.0 {
                tracing::debug!(
                    behind_secs = now - self.next_start_time,
                    "Playback fell behind, catching up to device clock"
                );
                self.catch_ups += 1;
            }
            self.next_start_time = now;
        }

        let start = self.next_start_time;
        let handle = self.output.schedule(samples, start)?;
        self.next_start_time += duration_secs;

        self.prune(now);
        self.in_flight.push_back(ScheduledPlayback {
            end_time: self.next_start_time,
            handle,
        });
        Ok(start)
    }

    /// Reset the cursor so the next chunk plays as soon as the device allows.
    ///
    /// Audio already handed to the device keeps playing unless
    /// `cancel_on_interrupt` was set, in which case every buffer that has
    /// not finished is stopped.
    pub fn interrupt(&mut self) {
        self.next_start_time = 0.0;
        if self.cancel_on_interrupt {
            let now = self.output.now();
            let mut cancelled = 0usize;
            for playback in self.in_flight.drain(..) {
                if playback.end_time > now {
                    playback.handle.stop();
                    cancelled += 1;
                }
            }
            tracing::debug!(cancelled, "Cancelled in-flight playback on interruption");
        } else {
            self.in_flight.clear();
        }
    }

    /// Number of buffers that may still be playing.
    pub fn in_flight(&self) -> usize {
        let now = self.output.now();
        self.in_flight.iter().filter(|p| p.end_time > now).count()
    }

    fn prune(&mut self, now: f64) {
        while self
            .in_flight
            .front()
            .is_some_and(|p| p.end_time <= now)
        {
            self.in_flight.pop_front();
        }
    }
}
