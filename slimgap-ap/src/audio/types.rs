//! Core audio data types
//!
//! The playback buffer holds raw bytes. Each frame is two little-endian f32
//! samples (left, right), so a frame is [`BYTES_PER_FRAME`] bytes and every
//! offset the buffer reports is a multiple of it unless a test reads odd
//! sizes directly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Output is always stereo
pub const OUTPUT_CHANNELS: usize = 2;

/// f32 little-endian
pub const BYTES_PER_SAMPLE: usize = 4;

/// One stereo frame
pub const BYTES_PER_FRAME: usize = OUTPUT_CHANNELS * BYTES_PER_SAMPLE;

/// Default output sample rate
pub const DEFAULT_OUTPUT_RATE: u32 = 44_100;

/// Fixed format of the playback buffer and output path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    pub sample_rate: u32,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_OUTPUT_RATE,
        }
    }
}

impl OutputFormat {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Bytes of buffer consumed per second of playback
    pub fn bytes_per_sec(&self) -> u64 {
        self.sample_rate as u64 * BYTES_PER_FRAME as u64
    }

    /// Playback time of `bytes`
    pub fn bytes_to_duration(&self, bytes: u64) -> Duration {
        slimgap_common::time::bytes_to_duration(bytes, self.bytes_per_sec())
    }

    /// Frame-aligned byte count covering `duration`
    pub fn duration_to_bytes(&self, duration: Duration) -> u64 {
        slimgap_common::time::duration_to_bytes(
            duration,
            self.bytes_per_sec(),
            BYTES_PER_FRAME as u64,
        )
    }

    /// Frame-aligned byte count covering `millis` milliseconds
    pub fn millis_to_bytes(&self, millis: u64) -> u64 {
        self.duration_to_bytes(Duration::from_millis(millis))
    }
}

/// Serialize interleaved f32 samples into buffer bytes
pub fn samples_to_bytes(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Deserialize buffer bytes into interleaved f32 samples
///
/// Trailing bytes that do not form a whole sample are ignored. Returns the
/// number of samples written.
pub fn bytes_to_samples(bytes: &[u8], out: &mut [f32]) -> usize {
    let mut written = 0;
    for (chunk, slot) in bytes.chunks_exact(BYTES_PER_SAMPLE).zip(out.iter_mut()) {
        *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_byte_rate() {
        let format = OutputFormat::default();
        assert_eq!(format.bytes_per_sec(), 352_800);
        assert_eq!(format.bytes_to_duration(352_800), Duration::from_secs(1));
    }

    #[test]
    fn test_duration_to_bytes_frame_aligned() {
        let format = OutputFormat::new(48_000);
        assert_eq!(format.millis_to_bytes(1000), 384_000);
        assert_eq!(format.millis_to_bytes(1) % BYTES_PER_FRAME as u64, 0);
    }

    #[test]
    fn test_sample_byte_conversion() {
        let samples = [0.0f32, 1.0, -0.5, 0.25];
        let mut bytes = Vec::new();
        samples_to_bytes(&samples, &mut bytes);
        assert_eq!(bytes.len(), 16);

        let mut decoded = [0.0f32; 4];
        assert_eq!(bytes_to_samples(&bytes, &mut decoded), 4);
        assert_eq!(decoded, samples);
    }
}
