//! Render cursor
//!
//! The output path's handle on the playback buffer. Every call to
//! [`RenderCursor::render`] moves audio out of the buffer, advances
//! `read_offset`, and, in the same critical section, lets the boundary
//! tracker fire any boundary the advance crossed. Track start
//! notifications therefore mark the moment bytes leave the buffer for the
//! device, not the moment they were queued.
//!
//! Controls the coordinator needs (pause, server volume, skip-ahead) live
//! in a shared [`RenderControl`] so the cursor itself can be owned by the
//! output thread.

use super::boundary::{BoundaryEvent, TrackBoundaryTracker};
use super::buffer::PlaybackBuffer;
use super::events::{CoordinatorEvent, EventSender, RenderEvent};
use crate::audio::types::bytes_to_samples;
use crate::audio::{BYTES_PER_FRAME, BYTES_PER_SAMPLE};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Render-time controls shared between the coordinator and the cursor
#[derive(Debug)]
pub struct RenderControl {
    paused: AtomicBool,
    /// f32 gain stored as bits
    gain_bits: AtomicU32,
    /// Bytes to discard before the next render
    skip_bytes: AtomicU64,
}

impl Default for RenderControl {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(true),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            skip_bytes: AtomicU64::new(0),
        }
    }
}

impl RenderControl {
    /// Output starts paused
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Server volume applied at render time
    pub fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    /// Discard `bytes` of buffered audio on the next render
    pub fn request_skip(&self, bytes: u64) {
        self.skip_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Forget a pending skip (after a flush)
    pub fn clear_skip(&self) {
        self.skip_bytes.store(0, Ordering::Release);
    }

    fn take_skip(&self) -> u64 {
        self.skip_bytes.swap(0, Ordering::AcqRel)
    }
}

/// Output-side reader of the playback buffer
pub struct RenderCursor {
    buffer: Arc<PlaybackBuffer>,
    tracker: Arc<TrackBoundaryTracker>,
    control: Arc<RenderControl>,
    events: EventSender,
    scratch: Vec<u8>,
    /// Last render produced audio; a dry render after this reports starvation once
    flowing: bool,
}

impl std::fmt::Debug for RenderCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCursor")
            .field("read_offset", &self.buffer.current_read_offset())
            .field("paused", &self.control.is_paused())
            .field("flowing", &self.flowing)
            .finish()
    }
}

impl RenderCursor {
    pub fn new(
        buffer: Arc<PlaybackBuffer>,
        tracker: Arc<TrackBoundaryTracker>,
        control: Arc<RenderControl>,
        events: EventSender,
    ) -> Self {
        Self {
            buffer,
            tracker,
            control,
            events,
            scratch: Vec::new(),
            flowing: false,
        }
    }

    pub fn control(&self) -> &Arc<RenderControl> {
        &self.control
    }

    /// Fill `out` with interleaved stereo samples
    ///
    /// Returns the number of samples that came from the buffer; the rest of
    /// `out` is silence. While paused nothing is consumed.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        if self.control.is_paused() {
            out.fill(0.0);
            return 0;
        }

        let skip = self.control.take_skip();
        if skip > 0 {
            let tracker = &self.tracker;
            let (skipped, events) = self
                .buffer
                .discard_then(skip as usize, |n, offset| tracker.on_render_advance(n, offset));
            debug!("Skip-ahead discarded {} of {} requested bytes", skipped, skip);
            self.publish(events);
        }

        let wanted = (out.len() * BYTES_PER_SAMPLE) / BYTES_PER_FRAME * BYTES_PER_FRAME;
        if self.scratch.len() < wanted {
            self.scratch.resize(wanted, 0);
        }

        let tracker = &self.tracker;
        let (n, events) = self
            .buffer
            .read_then(&mut self.scratch[..wanted], |n, offset| {
                tracker.on_render_advance(n, offset)
            });

        let samples = bytes_to_samples(&self.scratch[..n], out);
        let gain = self.control.gain();
        if gain != 1.0 {
            for sample in &mut out[..samples] {
                *sample *= gain;
            }
        }
        out[samples..].fill(0.0);

        self.publish(events);

        if n < wanted {
            if self.flowing {
                trace!("Render starved: wanted {} bytes, got {}", wanted, n);
                let _ = self.events.send(CoordinatorEvent::Render(RenderEvent::Starved));
            }
            self.flowing = false;
        } else {
            self.flowing = true;
        }

        samples
    }

    fn publish(&self, events: Vec<BoundaryEvent>) {
        for event in events {
            let _ = self
                .events
                .send(CoordinatorEvent::Render(RenderEvent::Boundary(event)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::samples_to_bytes;
    use crate::playback::events::event_channel;
    use uuid::Uuid;

    struct Fixture {
        buffer: Arc<PlaybackBuffer>,
        tracker: Arc<TrackBoundaryTracker>,
        control: Arc<RenderControl>,
        cursor: RenderCursor,
        rx: crate::playback::events::EventReceiver,
    }

    fn fixture() -> Fixture {
        let buffer = Arc::new(PlaybackBuffer::new(64 * 1024, None));
        let tracker = Arc::new(TrackBoundaryTracker::new());
        let control = Arc::new(RenderControl::new());
        let (tx, rx) = event_channel();
        let cursor = RenderCursor::new(
            Arc::clone(&buffer),
            Arc::clone(&tracker),
            Arc::clone(&control),
            tx,
        );
        Fixture {
            buffer,
            tracker,
            control,
            cursor,
            rx,
        }
    }

    fn append_samples(buffer: &PlaybackBuffer, samples: &[f32]) {
        let mut bytes = Vec::new();
        samples_to_bytes(samples, &mut bytes);
        assert_eq!(buffer.append(&bytes), bytes.len());
    }

    #[test]
    fn test_paused_cursor_renders_silence_without_advancing() {
        let mut f = fixture();
        append_samples(&f.buffer, &[0.5; 64]);

        let mut out = [1.0f32; 16];
        assert_eq!(f.cursor.render(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(f.buffer.current_read_offset(), 0);
    }

    #[test]
    fn test_render_copies_samples_and_applies_gain() {
        let mut f = fixture();
        f.control.resume();
        f.control.set_gain(0.5);
        append_samples(&f.buffer, &[0.5, -0.5, 1.0, -1.0]);

        let mut out = [9.0f32; 8];
        assert_eq!(f.cursor.render(&mut out), 4);
        assert_eq!(out, [0.25, -0.25, 0.5, -0.5, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(f.buffer.current_read_offset(), 16);
    }

    #[test]
    fn test_first_render_announces_track() {
        let mut f = fixture();
        let a = Uuid::new_v4();
        f.tracker.start_track(a, 0);
        f.control.resume();
        append_samples(&f.buffer, &[0.1; 32]);

        let mut out = [0.0f32; 8];
        f.cursor.render(&mut out);
        match f.rx.try_recv().unwrap() {
            CoordinatorEvent::Render(RenderEvent::Boundary(BoundaryEvent::TrackStarted {
                track_id,
            })) => assert_eq!(track_id, a),
            other => panic!("Expected TrackStarted, got {:?}", other),
        }
    }

    #[test]
    fn test_starvation_reported_once_per_dry_spell() {
        let mut f = fixture();
        f.control.resume();
        append_samples(&f.buffer, &[0.1; 8]);

        let mut out = [0.0f32; 8];
        f.cursor.render(&mut out); // full
        f.cursor.render(&mut out); // dry
        f.cursor.render(&mut out); // still dry

        let mut starved = 0;
        while let Ok(event) = f.rx.try_recv() {
            if matches!(event, CoordinatorEvent::Render(RenderEvent::Starved)) {
                starved += 1;
            }
        }
        assert_eq!(starved, 1);
    }

    #[test]
    fn test_never_flowing_buffer_is_not_starvation() {
        let mut f = fixture();
        f.control.resume();
        let mut out = [0.0f32; 8];
        f.cursor.render(&mut out);
        assert!(f.rx.try_recv().is_err());
    }

    #[test]
    fn test_skip_ahead_discards_and_crosses_boundaries() {
        let mut f = fixture();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        f.tracker.start_track(a, 0);
        f.control.resume();
        append_samples(&f.buffer, &[0.1; 256]); // 1024 bytes
        f.tracker.mark_boundary(512, b);

        f.control.request_skip(600);
        let mut out = [0.0f32; 2];
        f.cursor.render(&mut out);

        // 600 rounded down to whole frames, plus one rendered frame
        assert_eq!(f.buffer.current_read_offset(), 600 + 8);
        assert_eq!(f.tracker.current_span().unwrap().track_id, b);
    }
}
