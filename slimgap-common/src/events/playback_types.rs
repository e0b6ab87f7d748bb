//! Playback-related type definitions

use crate::protocol::TrackId;
use serde::{Deserialize, Serialize};

/// Session state owned by the playback coordinator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No stream; nothing buffered
    Idle,
    /// Flushed and waiting for the next start directive
    AwaitingStream,
    /// Decoding and/or rendering
    Streaming,
    /// Output held, buffer kept
    Paused,
    /// Output device lost; returns to the prior state when it is back
    Interrupted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::AwaitingStream => write!(f, "awaiting_stream"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Paused => write!(f, "paused"),
            SessionState::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Read-only snapshot handed to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: SessionState,
    /// Track currently audible, if any
    pub track_id: Option<TrackId>,
    /// Position within the audible track
    pub position_ms: u64,
    /// Bytes appended but not yet rendered
    pub buffered_bytes: u64,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            track_id: None,
            position_ms: 0,
            buffered_bytes: 0,
        }
    }
}
