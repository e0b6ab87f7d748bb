//! Track boundary tracking
//!
//! Tracks sit back to back in the playback buffer. The tracker remembers
//! where each queued track begins (a byte offset on the cumulative write
//! axis) and, as the render path advances `read_offset`, reports the exact
//! moment playback enters the next track.
//!
//! Pending boundaries are kept in a min-heap keyed by offset (ties broken
//! by insertion order), the same marker scheme the mixer used for its
//! position markers. Each render advance pops every boundary at or behind
//! the new read offset, in order, and promotes it to the current span
//! before the event is returned, so position queries made right after a
//! crossing are already relative to the new track.

use slimgap_common::protocol::TrackId;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// A track's extent in the buffer: `[start_offset, next boundary)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSpan {
    pub track_id: TrackId,
    pub start_offset: u64,
}

/// What a render advance revealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryEvent {
    /// First audio of a fresh buffer reached the output
    TrackStarted { track_id: TrackId },

    /// Playback moved from one queued track into the next
    BoundaryCrossed {
        previous: Option<TrackId>,
        track_id: TrackId,
        offset: u64,
    },
}

impl BoundaryEvent {
    pub fn track_id(&self) -> TrackId {
        match self {
            BoundaryEvent::TrackStarted { track_id } => *track_id,
            BoundaryEvent::BoundaryCrossed { track_id, .. } => *track_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingBoundary {
    offset: u64,
    seq: u64,
    track_id: TrackId,
}

impl Ord for PendingBoundary {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for PendingBoundary {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    current: Option<TrackSpan>,
    /// Current span has not been heard yet
    announce_pending: bool,
    pending: BinaryHeap<Reverse<PendingBoundary>>,
    next_seq: u64,
}

/// Ordered pending boundaries plus the currently audible span
#[derive(Debug, Default)]
pub struct TrackBoundaryTracker {
    state: Mutex<TrackerState>,
}

impl TrackBoundaryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `track_id` the current span starting at `start_offset`
    ///
    /// Used for the first track after a fresh buffer (session start or
    /// flush). The track is announced with `TrackStarted` on the first
    /// non-empty render.
    pub fn start_track(&self, track_id: TrackId, start_offset: u64) {
        let mut state = self.lock();
        debug!("Current span: track {} from offset {}", track_id, start_offset);
        state.current = Some(TrackSpan {
            track_id,
            start_offset,
        });
        state.announce_pending = true;
    }

    /// Queue a boundary: `track_id` begins at `at`
    ///
    /// `at` is the write offset before the track's first byte is appended,
    /// so it is never behind anything already queued.
    pub fn mark_boundary(&self, at: u64, track_id: TrackId) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        if let Some(Reverse(last)) = state.pending.iter().max_by_key(|p| p.0) {
            if last.offset > at {
                warn!(
                    "Boundary for {} at {} queued behind pending boundary at {}",
                    track_id, at, last.offset
                );
            }
        }

        debug!("Boundary marked: track {} at offset {}", track_id, at);
        state.pending.push(Reverse(PendingBoundary {
            offset: at,
            seq,
            track_id,
        }));
    }

    /// Process a render advance
    ///
    /// `advanced` is the byte count just rendered and `read_offset` the
    /// cumulative offset after it. A zero-byte advance never fires. Each
    /// pending boundary fires once, in order.
    pub fn on_render_advance(&self, advanced: usize, read_offset: u64) -> Vec<BoundaryEvent> {
        if advanced == 0 {
            return Vec::new();
        }

        let mut state = self.lock();
        let mut events = Vec::new();

        if state.announce_pending {
            state.announce_pending = false;
            if let Some(span) = state.current {
                events.push(BoundaryEvent::TrackStarted {
                    track_id: span.track_id,
                });
            }
        }

        while let Some(Reverse(next)) = state.pending.peek().copied() {
            if next.offset > read_offset {
                break;
            }
            state.pending.pop();

            let previous = state.current.map(|span| span.track_id);
            state.current = Some(TrackSpan {
                track_id: next.track_id,
                start_offset: next.offset,
            });

            debug!(
                "Boundary crossed at {} (read_offset {}): {:?} -> {}",
                next.offset, read_offset, previous, next.track_id
            );
            events.push(BoundaryEvent::BoundaryCrossed {
                previous,
                track_id: next.track_id,
                offset: next.offset,
            });
        }

        events
    }

    /// Drop the pending boundary for `track_id`, if it has not fired
    ///
    /// Used when a gapless successor fails before contributing any audio.
    pub fn withdraw_boundary(&self, track_id: TrackId) -> bool {
        let mut state = self.lock();
        let before = state.pending.len();
        state.pending.retain(|p| p.0.track_id != track_id);
        let withdrawn = state.pending.len() != before;
        if withdrawn {
            debug!("Boundary for track {} withdrawn", track_id);
        }
        withdrawn
    }

    /// Forget every span and pending boundary (after a flush)
    pub fn reset(&self) {
        let mut state = self.lock();
        let dropped = state.pending.len();
        *state = TrackerState::default();
        if dropped > 0 {
            debug!("Tracker reset: dropped {} pending boundaries", dropped);
        }
    }

    /// Currently audible span
    pub fn current_span(&self) -> Option<TrackSpan> {
        self.lock().current
    }

    /// Pending boundary offsets in firing order
    pub fn pending_offsets(&self) -> Vec<u64> {
        let state = self.lock();
        let mut offsets: Vec<_> = state.pending.iter().map(|p| (p.0.offset, p.0.seq)).collect();
        offsets.sort_unstable();
        offsets.into_iter().map(|(offset, _)| offset).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// True if `track_id` is current or queued
    pub fn knows(&self, track_id: TrackId) -> bool {
        let state = self.lock();
        state.current.map(|s| s.track_id) == Some(track_id)
            || state.pending.iter().any(|p| p.0.track_id == track_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_no_event_without_pending_boundary() {
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        tracker.start_track(a, 0);

        // First render announces the track, later renders are silent
        assert_eq!(
            tracker.on_render_advance(8, 8),
            vec![BoundaryEvent::TrackStarted { track_id: a }]
        );
        for offset in (16..4096).step_by(8) {
            assert!(tracker.on_render_advance(8, offset).is_empty());
        }
    }

    #[test]
    fn test_zero_byte_advance_never_fires() {
        let tracker = TrackBoundaryTracker::new();
        tracker.start_track(Uuid::new_v4(), 0);
        tracker.mark_boundary(0, Uuid::new_v4());

        assert!(tracker.on_render_advance(0, 0).is_empty());
        assert!(tracker.on_render_advance(0, 1_000).is_empty());
        assert!(tracker.has_pending());
    }

    #[test]
    fn test_boundary_fires_exactly_once() {
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_track(a, 0);
        tracker.on_render_advance(8, 8);
        tracker.mark_boundary(1_000, b);

        assert!(tracker.on_render_advance(8, 992).is_empty());
        let events = tracker.on_render_advance(8, 1_000);
        assert_eq!(
            events,
            vec![BoundaryEvent::BoundaryCrossed {
                previous: Some(a),
                track_id: b,
                offset: 1_000
            }]
        );

        // Repeated notifications at or past the offset do not refire
        for _ in 0..5 {
            assert!(tracker.on_render_advance(8, 1_000).is_empty());
            assert!(tracker.on_render_advance(8, 2_000).is_empty());
        }
    }

    #[test]
    fn test_current_span_promoted_before_event_returned() {
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_track(a, 0);
        tracker.mark_boundary(800, b);

        tracker.on_render_advance(800, 800);
        let span = tracker.current_span().unwrap();
        assert_eq!(span.track_id, b);
        assert_eq!(span.start_offset, 800);
    }

    #[test]
    fn test_multiple_pending_fire_in_order() {
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        tracker.start_track(a, 0);
        tracker.on_render_advance(8, 8);
        tracker.mark_boundary(100, b);
        tracker.mark_boundary(200, c);
        assert_eq!(tracker.pending_offsets(), vec![100, 200]);

        // One large advance crosses both
        let events = tracker.on_render_advance(300, 308);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].track_id(), b);
        assert_eq!(events[1].track_id(), c);
        match events[1] {
            BoundaryEvent::BoundaryCrossed { previous, .. } => assert_eq!(previous, Some(b)),
            other => panic!("Expected BoundaryCrossed, got {:?}", other),
        }
        assert_eq!(tracker.current_span().unwrap().track_id, c);
    }

    #[test]
    fn test_boundary_at_current_read_offset_fires_on_next_advance() {
        // A track that begins exactly where rendering already is (buffer
        // drained before the gapless directive arrived)
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_track(a, 0);
        tracker.on_render_advance(64, 64);
        tracker.mark_boundary(64, b);

        assert!(tracker.on_render_advance(0, 64).is_empty());
        let events = tracker.on_render_advance(8, 72);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].track_id(), b);
    }

    #[test]
    fn test_withdrawn_boundary_never_fires() {
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_track(a, 0);
        tracker.on_render_advance(8, 8);
        tracker.mark_boundary(64, b);

        assert!(tracker.withdraw_boundary(b));
        assert!(!tracker.withdraw_boundary(b));
        assert!(tracker.on_render_advance(64, 72).is_empty());
        assert_eq!(tracker.current_span().unwrap().track_id, a);
    }

    #[test]
    fn test_reset_clears_everything() {
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        tracker.start_track(a, 0);
        tracker.mark_boundary(100, Uuid::new_v4());

        tracker.reset();
        assert!(tracker.current_span().is_none());
        assert!(!tracker.has_pending());
        assert!(!tracker.knows(a));
        assert!(tracker.on_render_advance(500, 500).is_empty());
    }

    #[test]
    fn test_track_started_then_boundary_in_same_advance() {
        let tracker = TrackBoundaryTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.start_track(a, 0);
        tracker.mark_boundary(16, b);

        let events = tracker.on_render_advance(64, 64);
        assert_eq!(
            events,
            vec![
                BoundaryEvent::TrackStarted { track_id: a },
                BoundaryEvent::BoundaryCrossed {
                    previous: Some(a),
                    track_id: b,
                    offset: 16
                },
            ]
        );
    }
}
