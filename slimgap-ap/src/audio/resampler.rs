//! Streaming resampling using rubato
//!
//! Every track is converted to the output rate before it reaches the
//! playback buffer, so consecutive tracks always share one format and can
//! be joined without reopening the output.
//!
//! Decoders deliver packets of arbitrary length while rubato's fixed-input
//! resamplers want fixed chunks, so input is staged in planar form until a
//! full chunk is available. [`StreamResampler::finish`] pushes the tail
//! through at end of stream.
//!
//! The filter's lead-in (`output_delay` frames) is dropped from the start of
//! every track, so a resampled track begins with its first real frame.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Input frames per resampler call
const CHUNK_FRAMES: usize = 1024;

const CHANNELS: usize = 2;

/// Stereo resampler that accepts input in arbitrary-size pieces
pub struct StreamResampler {
    input_rate: u32,
    output_rate: u32,
    /// `None` when rates match (passthrough)
    resampler: Option<FastFixedIn<f32>>,
    staged: Vec<Vec<f32>>,
    /// Lead-in frames still to drop
    delay_remaining: usize,
}

impl std::fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResampler")
            .field("input_rate", &self.input_rate)
            .field("output_rate", &self.output_rate)
            .field("active", &self.resampler.is_some())
            .field("staged_frames", &self.staged[0].len())
            .field("delay_remaining", &self.delay_remaining)
            .finish()
    }
}

impl StreamResampler {
    /// Create a resampler from `input_rate` to `output_rate`
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(Error::Resample(format!(
                "Invalid sample rates: {} -> {}",
                input_rate, output_rate
            )));
        }

        let resampler = if input_rate == output_rate {
            debug!("Sample rate already at {}Hz, resampler bypassed", output_rate);
            None
        } else {
            debug!("Resampling from {}Hz to {}Hz", input_rate, output_rate);
            Some(
                FastFixedIn::<f32>::new(
                    output_rate as f64 / input_rate as f64,
                    1.0,
                    PolynomialDegree::Septic,
                    CHUNK_FRAMES,
                    CHANNELS,
                )
                .map_err(|e| Error::Resample(format!("Failed to create resampler: {}", e)))?,
            )
        };

        let delay_remaining = resampler.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            input_rate,
            output_rate,
            resampler,
            delay_remaining,
            staged: vec![Vec::with_capacity(CHUNK_FRAMES * 2); CHANNELS],
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feed interleaved stereo samples, appending any output to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        for frame in input.chunks_exact(CHANNELS) {
            self.staged[0].push(frame[0]);
            self.staged[1].push(frame[1]);
        }

        loop {
            let needed = resampler.input_frames_next();
            if self.staged[0].len() < needed {
                break;
            }

            let chunk: Vec<Vec<f32>> = self
                .staged
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();

            let planar = resampler
                .process(&chunk, None)
                .map_err(|e| Error::Resample(format!("Resampling failed: {}", e)))?;
            self.delay_remaining -= interleave(&planar, self.delay_remaining, out);
        }

        Ok(())
    }

    /// Flush staged input and the filter's last `output_delay` frames
    pub fn finish(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };

        let tail: Vec<Vec<f32>> = self.staged.iter_mut().map(std::mem::take).collect();
        let tail_frames = tail[0].len();
        let mut planar = resampler
            .process_partial(Some(tail.as_slice()), None)
            .map_err(|e| Error::Resample(format!("Resampling tail failed: {}", e)))?;

        // The partial chunk is zero padded; keep only what the tail covers
        let ratio = self.output_rate as f64 / self.input_rate as f64;
        let keep = (tail_frames as f64 * ratio).ceil() as usize + resampler.output_delay();
        for channel in planar.iter_mut() {
            channel.truncate(keep);
        }
        self.delay_remaining -= interleave(&planar, self.delay_remaining, out);
        Ok(())
    }
}

/// Convert planar samples to interleaved format, dropping the first `skip`
/// frames. Returns how many frames were dropped.
///
/// Input:  [[L, L, L, ...], [R, R, R, ...]]
/// Output: [L, R, L, R, L, R, ...]
fn interleave(planar: &[Vec<f32>], skip: usize, out: &mut Vec<f32>) -> usize {
    if planar.is_empty() {
        return 0;
    }

    let frames = planar[0].len();
    let skipped = skip.min(frames);
    out.reserve((frames - skipped) * planar.len());
    for frame_idx in skipped..frames {
        for channel in planar {
            out.push(channel[frame_idx]);
        }
    }
    skipped
}
