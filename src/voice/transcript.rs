//! Per-turn transcript aggregation for live captions.

use serde::Serialize;

use super::Speaker;

/// Snapshot of both in-progress buffers, for a caption display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveCaption {
    pub caller: String,
    pub agent: String,
}

/// Text of one completed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnTranscript {
    pub caller: String,
    pub agent: String,
}

impl TurnTranscript {
    pub fn is_empty(&self) -> bool {
        self.caller.is_empty() && self.agent.is_empty()
    }
}

/// Accumulates transcript deltas for the current turn.
///
/// Each buffer equals the in-order concatenation of every fragment received
/// for that speaker since the last turn boundary.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    caller: String,
    agent: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_delta(&mut self, speaker: Speaker, text: &str) {
        match speaker {
            Speaker::Caller => self.caller.push_str(text),
            Speaker::Agent => self.agent.push_str(text),
        }
    }

    /// Finalize both buffers and start the next turn empty.
    pub fn on_turn_complete(&mut self) -> TurnTranscript {
        TurnTranscript {
            caller: std::mem::take(&mut self.caller),
            agent: std::mem::take(&mut self.agent),
        }
    }

    /// Drop the agent's partial text. The caller was not interrupted.
    pub fn on_interrupted(&mut self) {
        self.agent.clear();
    }

    pub fn text(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::Caller => &self.caller,
            Speaker::Agent => &self.agent,
        }
    }

    pub fn caption(&self) -> LiveCaption {
        LiveCaption {
            caller: self.caller.clone(),
            agent: self.agent.clone(),
        }
    }
}
