//! Per-track stream decoder
//!
//! One [`StreamDecoder`] exists per track: it fetches the compressed stream,
//! decodes it, resamples to the output rate, applies replay gain and appends
//! the result to the shared playback buffer.
//!
//! **Boundary marking:** a gapless successor records the buffer's
//! `write_offset` as its track boundary right after its source opens and
//! before it appends anything. It only starts once its predecessor has
//! exited, so `write_offset` has exactly one writer at a time and the mark
//! sits exactly at the end of the predecessor's audio.
//!
//! **Termination:** `DecodeComplete` or `DecodeError` is reported exactly
//! once. A cancelled decoder reports neither.

use super::boundary::TrackBoundaryTracker;
use super::buffer::PlaybackBuffer;
use super::events::{CoordinatorEvent, DecoderEvent, EventSender};
use super::source::{SourceFetcher, SourceObserver, SourceReader};
use crate::audio::decoder::{AudioStreamDecoder, SymphoniaStreamDecoder};
use crate::audio::pcm::{RawPcmDecoder, RawPcmLayout};
use crate::audio::types::samples_to_bytes;
use crate::audio::{OutputFormat, StreamResampler, BYTES_PER_SAMPLE};
use crate::error::{Error, Result};
use slimgap_common::protocol::{Codec, TrackDirective, TrackId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Sleep while the buffer is above its high-water mark
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(10);

/// Everything a decoder needs from the engine
#[derive(Clone)]
pub struct DecoderContext {
    pub buffer: Arc<PlaybackBuffer>,
    pub tracker: Arc<TrackBoundaryTracker>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub events: EventSender,
    pub format: OutputFormat,
}

/// How a decode run ended
#[derive(Debug)]
enum Outcome {
    Complete,
    Cancelled,
}

/// Handle on a running per-track decoder
pub struct StreamDecoder {
    track_id: TrackId,
    cancel: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    exited: watch::Receiver<bool>,
    bytes_received: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("track_id", &self.track_id)
            .field("cancelled", &self.is_cancelled())
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Signals exit when the decoder task ends, however it ends
struct ExitGuard(watch::Sender<bool>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

impl StreamDecoder {
    /// Start decoding `directive`
    ///
    /// With `predecessor_exit`, nothing happens (not even opening the
    /// source) until that decoder has exited. With `mark_boundary`, the
    /// track's boundary is recorded at the current `write_offset` as soon as
    /// the source opens.
    ///
    /// Must be called within a tokio runtime.
    pub fn begin(
        directive: TrackDirective,
        mark_boundary: bool,
        predecessor_exit: Option<watch::Receiver<bool>>,
        ctx: DecoderContext,
    ) -> Self {
        let track_id = directive.track_id;
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let bytes_received = Arc::new(AtomicU64::new(0));
        let (exit_tx, exited) = watch::channel(false);

        info!(
            "Starting decoder for track {} ({}, mark_boundary={})",
            track_id, directive.codec, mark_boundary
        );

        let task_cancel = Arc::clone(&cancel);
        let task_notify = Arc::clone(&cancel_notify);
        let task_received = Arc::clone(&bytes_received);
        let handle = tokio::spawn(async move {
            let _guard = ExitGuard(exit_tx);

            let predecessor_done = async move {
                if let Some(mut predecessor) = predecessor_exit {
                    // Err means the predecessor's handle is gone, which is an exit too
                    let _ = predecessor.wait_for(|exited| *exited).await;
                }
            };
            tokio::select! {
                _ = predecessor_done => {}
                _ = task_notify.notified() => {
                    debug!("Decoder for {} cancelled before it began", track_id);
                    return;
                }
            }
            if task_cancel.load(Ordering::Acquire) {
                return;
            }

            let events = ctx.events.clone();
            let blocking_cancel = Arc::clone(&task_cancel);
            let result = tokio::task::spawn_blocking(move || {
                let mut run = DecodeRun::new(directive, mark_boundary, ctx, blocking_cancel, task_received);
                run.execute()
            })
            .await;

            let terminal = match result {
                Ok(Ok(Outcome::Complete)) => Some(DecoderEvent::DecodeComplete),
                Ok(Ok(Outcome::Cancelled)) => None,
                Ok(Err(e)) => Some(DecoderEvent::DecodeError(e.to_string())),
                Err(e) => {
                    error!("Decoder thread for track {} panicked: {}", track_id, e);
                    Some(DecoderEvent::DecodeError("decoder thread panicked".to_string()))
                }
            };

            if let Some(event) = terminal {
                if task_cancel.load(Ordering::Acquire) {
                    debug!("Decoder for {} cancelled, dropping {:?}", track_id, event);
                    return;
                }
                let _ = events.send(CoordinatorEvent::Decoder { track_id, event });
            }
        });

        Self {
            track_id,
            cancel,
            cancel_notify,
            exited,
            bytes_received,
            handle: Some(handle),
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    /// Ask the decoder to stop at its next safe point. Idempotent.
    pub fn cancel(&self) {
        if !self.cancel.swap(true, Ordering::AcqRel) {
            debug!("Cancelling decoder for track {}", self.track_id);
            self.cancel_notify.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Wait for the decoder to retire
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Decoder task for {} ended abnormally: {}", self.track_id, e);
            }
        }
    }

    /// Receiver that turns `true` once the decoder has exited
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Compressed bytes received from the stream server so far
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        if self.handle.is_some() && !self.has_exited() {
            self.cancel();
        }
    }
}

/// State of one decode on the blocking thread
struct DecodeRun {
    directive: TrackDirective,
    mark_boundary: bool,
    ctx: DecoderContext,
    cancel: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
    resampler: Option<StreamResampler>,
    /// Output bytes still to drop for the seek offset
    skip_remaining: u64,
    appended: u64,
    resampled: Vec<f32>,
    bytes: Vec<u8>,
}

impl DecodeRun {
    fn new(
        directive: TrackDirective,
        mark_boundary: bool,
        ctx: DecoderContext,
        cancel: Arc<AtomicBool>,
        received: Arc<AtomicU64>,
    ) -> Self {
        let skip_remaining = ctx.format.duration_to_bytes(directive.seek_offset);
        Self {
            directive,
            mark_boundary,
            ctx,
            cancel,
            received,
            resampler: None,
            skip_remaining,
            appended: 0,
            resampled: Vec::new(),
            bytes: Vec::new(),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn execute(&mut self) -> Result<Outcome> {
        let result = self.decode();
        match result {
            Err(_) if self.cancelled() => Ok(Outcome::Cancelled),
            Err(e) => {
                warn!("Decode of track {} failed: {}", self.directive.track_id, e);
                if self.mark_boundary && self.appended == 0 {
                    self.ctx.tracker.withdraw_boundary(self.directive.track_id);
                }
                Err(e)
            }
            ok => ok,
        }
    }

    fn decode(&mut self) -> Result<Outcome> {
        let track_id = self.directive.track_id;
        let codec = self.directive.codec.clone();
        if !codec.is_supported() {
            return Err(Error::UnsupportedCodec(codec.to_string()));
        }

        let observer = SourceObserver::new(track_id, self.ctx.events.clone());
        let source = self
            .ctx
            .fetcher
            .open(&self.directive.locator, observer.clone())?;

        if self.mark_boundary {
            let at = self.ctx.buffer.write_offset();
            self.ctx.tracker.mark_boundary(at, track_id);
        }

        let threshold = self.directive.threshold_kib as u64 * 1024;
        let reader = SourceReader::new(
            source,
            observer,
            threshold,
            Arc::clone(&self.received),
            Arc::clone(&self.cancel),
        );

        let mut decoder: Box<dyn AudioStreamDecoder> = match &codec {
            Codec::Pcm(format) => match RawPcmLayout::from_format(format) {
                Some(layout) => Box::new(RawPcmDecoder::new(reader, layout)?),
                None => Box::new(SymphoniaStreamDecoder::open(reader, &codec)?),
            },
            _ => Box::new(SymphoniaStreamDecoder::open(reader, &codec)?),
        };

        let mut decoded = Vec::new();
        loop {
            if self.cancelled() {
                return Ok(Outcome::Cancelled);
            }

            decoded.clear();
            let rate = match decoder.decode_next(&mut decoded)? {
                None => break,
                Some(0) => continue,
                Some(rate) => rate,
            };

            if self.resampler.as_ref().map(|r| r.input_rate()) != Some(rate) {
                if self.resampler.is_some() {
                    debug!("Source rate changed to {}Hz mid-stream", rate);
                }
                self.finish_resampler()?;
                self.resampler = Some(StreamResampler::new(rate, self.ctx.format.sample_rate)?);
            }

            self.resampled.clear();
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.process(&decoded, &mut self.resampled)?;
            }
            if !self.emit()? {
                return Ok(Outcome::Cancelled);
            }
        }

        self.finish_resampler()?;
        if self.cancelled() {
            return Ok(Outcome::Cancelled);
        }

        info!(
            "Decode complete for track {}: {} bytes appended, {} bytes received",
            track_id,
            self.appended,
            self.received.load(Ordering::Relaxed)
        );
        Ok(Outcome::Complete)
    }

    /// Push the current resampler's tail through and drop it
    fn finish_resampler(&mut self) -> Result<()> {
        if let Some(mut resampler) = self.resampler.take() {
            self.resampled.clear();
            resampler.finish(&mut self.resampled)?;
            self.emit()?;
        }
        Ok(())
    }

    /// Gain, seek skip and append `self.resampled`; false if cancelled
    fn emit(&mut self) -> Result<bool> {
        if self.resampled.is_empty() {
            return Ok(true);
        }

        let gain = self.directive.replay_gain;
        if gain != 1.0 {
            for sample in &mut self.resampled {
                *sample *= gain;
            }
        }

        let mut samples = self.resampled.as_slice();
        if self.skip_remaining > 0 {
            let skip = (self.skip_remaining as usize / BYTES_PER_SAMPLE).min(samples.len());
            samples = &samples[skip..];
            self.skip_remaining -= (skip * BYTES_PER_SAMPLE) as u64;
            trace!("Seek skipped {} samples, {} bytes still to skip", skip, self.skip_remaining);
        }

        self.bytes.clear();
        samples_to_bytes(samples, &mut self.bytes);
        self.append_with_backpressure()
    }

    fn append_with_backpressure(&mut self) -> Result<bool> {
        let mut offset = 0;
        while offset < self.bytes.len() {
            if self.cancelled() {
                return Ok(false);
            }
            if self.ctx.buffer.above_high_water() {
                trace!("Buffer above high water, decoder waiting");
                std::thread::sleep(BACKPRESSURE_SLEEP);
                continue;
            }

            let n = self.ctx.buffer.append(&self.bytes[offset..]);
            offset += n;
            self.appended += n as u64;
            if n == 0 {
                std::thread::sleep(BACKPRESSURE_SLEEP);
            }
        }
        Ok(true)
    }
}
