//! Per-track playback position
//!
//! Position is derived, never counted: elapsed = (read_offset - start of
//! the current span) at the fixed output byte rate. A flush moves both the
//! read offset and the next span start to 0, so the position restarts at 0
//! with no extra bookkeeping.

use super::boundary::TrackBoundaryTracker;
use super::buffer::PlaybackBuffer;
use crate::audio::OutputFormat;
use slimgap_common::protocol::TrackId;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PositionReporter {
    buffer: Arc<PlaybackBuffer>,
    tracker: Arc<TrackBoundaryTracker>,
    format: OutputFormat,
}

impl PositionReporter {
    pub fn new(
        buffer: Arc<PlaybackBuffer>,
        tracker: Arc<TrackBoundaryTracker>,
        format: OutputFormat,
    ) -> Self {
        Self {
            buffer,
            tracker,
            format,
        }
    }

    /// Elapsed time within the audible track, zero when nothing is current
    pub fn position_in_current_track(&self) -> Duration {
        self.current()
            .map(|(_, position)| position)
            .unwrap_or(Duration::ZERO)
    }

    /// Audible track and its elapsed time
    pub fn current(&self) -> Option<(TrackId, Duration)> {
        let span = self.tracker.current_span()?;
        let read_offset = self.buffer.current_read_offset();
        let elapsed = read_offset.saturating_sub(span.start_offset);
        Some((span.track_id, self.format.bytes_to_duration(elapsed)))
    }
}
