//! Headerless PCM decoding
//!
//! `strm` start frames for raw PCM carry the layout explicitly (sample
//! size, rate, channels, endianness). The stream is plain interleaved
//! integer samples with no container, so it is converted here directly
//! rather than going through a probe.

use super::decoder::AudioStreamDecoder;
use crate::error::{Error, Result};
use slimgap_common::protocol::{Endianness, PcmFormat};
use std::io::Read;

/// Bytes read per `decode_next` call (before alignment)
const READ_CHUNK: usize = 16 * 1024;

/// Fully specified raw PCM layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPcmLayout {
    pub bits_per_sample: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub endianness: Endianness,
}

impl RawPcmLayout {
    /// Layout from a directive's PCM format, `None` if any field is `'?'`
    pub fn from_format(format: &PcmFormat) -> Option<Self> {
        Some(Self {
            bits_per_sample: format.bits_per_sample?,
            sample_rate: format.sample_rate?,
            channels: format.channels?,
            endianness: format.endianness?,
        })
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }
}

/// Decoder for headerless interleaved integer PCM
pub struct RawPcmDecoder<R> {
    source: R,
    layout: RawPcmLayout,
    /// Bytes carried over when a read ends mid-frame
    carry: Vec<u8>,
    scratch: Vec<u8>,
}

impl<R: Read + Send> RawPcmDecoder<R> {
    pub fn new(source: R, layout: RawPcmLayout) -> Result<Self> {
        if !matches!(layout.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(Error::Decode(format!(
                "Unsupported PCM sample size: {} bits",
                layout.bits_per_sample
            )));
        }
        if layout.channels == 0 || layout.channels > 2 {
            return Err(Error::Decode(format!(
                "Unsupported PCM channel count: {}",
                layout.channels
            )));
        }

        Ok(Self {
            source,
            layout,
            carry: Vec::new(),
            scratch: vec![0u8; READ_CHUNK],
        })
    }
}

impl<R: Read + Send> AudioStreamDecoder for RawPcmDecoder<R> {
    fn decode_next(&mut self, out: &mut Vec<f32>) -> Result<Option<u32>> {
        let n = self.source.read(&mut self.scratch)?;
        if n == 0 {
            // A trailing partial frame is dropped
            return Ok(None);
        }

        self.carry.extend_from_slice(&self.scratch[..n]);
        let frame_bytes = self.layout.bytes_per_frame();
        let whole = self.carry.len() - self.carry.len() % frame_bytes;

        convert_interleaved(&self.carry[..whole], &self.layout, out);
        self.carry.drain(..whole);

        Ok(Some(self.layout.sample_rate))
    }
}

/// Convert whole frames of integer PCM to interleaved stereo f32
pub fn convert_interleaved(bytes: &[u8], layout: &RawPcmLayout, out: &mut Vec<f32>) {
    let bps = layout.bytes_per_sample();
    let frame_bytes = layout.bytes_per_frame();
    out.reserve(bytes.len() / frame_bytes * 2);

    for frame in bytes.chunks_exact(frame_bytes) {
        let left = decode_sample(&frame[..bps], layout);
        let right = if layout.channels == 2 {
            decode_sample(&frame[bps..2 * bps], layout)
        } else {
            left
        };
        out.push(left);
        out.push(right);
    }
}

fn decode_sample(bytes: &[u8], layout: &RawPcmLayout) -> f32 {
    match (layout.bits_per_sample, layout.endianness) {
        // 8-bit PCM is unsigned
        (8, _) => (bytes[0] as i32 - 128) as f32 / 128.0,
        (16, Endianness::Little) => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
        (16, Endianness::Big) => i16::from_be_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
        (24, Endianness::Little) => {
            i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) as f32 / 2_147_483_648.0
        }
        (24, Endianness::Big) => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) as f32 / 2_147_483_648.0
        }
        (32, Endianness::Little) => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        (32, Endianness::Big) => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn layout(bits: u16, channels: u16, endianness: Endianness) -> RawPcmLayout {
        RawPcmLayout {
            bits_per_sample: bits,
            sample_rate: 44_100,
            channels,
            endianness,
        }
    }

    #[test]
    fn test_layout_requires_every_field() {
        let partial = PcmFormat {
            bits_per_sample: Some(16),
            sample_rate: None,
            channels: Some(2),
            endianness: Some(Endianness::Little),
        };
        assert!(RawPcmLayout::from_format(&partial).is_none());
    }

    #[test]
    fn test_s16_le_stereo() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16_384i16.to_le_bytes());
        bytes.extend_from_slice(&(-16_384i16).to_le_bytes());

        let mut out = Vec::new();
        convert_interleaved(&bytes, &layout(16, 2, Endianness::Little), &mut out);
        assert_eq!(out, vec![0.5, -0.5]);
    }

    #[test]
    fn test_s24_be_mono_duplicates() {
        // 0x400000 = half scale
        let bytes = [0x40, 0x00, 0x00];
        let mut out = Vec::new();
        convert_interleaved(&bytes, &layout(24, 1, Endianness::Big), &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn test_u8_is_offset_binary() {
        let mut out = Vec::new();
        convert_interleaved(&[128, 0], &layout(8, 2, Endianness::Little), &mut out);
        assert_eq!(out, vec![0.0, -1.0]);
    }

    #[test]
    fn test_decoder_carries_partial_frames() {
        // 3 stereo s16 frames = 12 bytes, delivered by a reader that returns
        // 5 bytes at a time
        struct Dribble(Cursor<Vec<u8>>);
        impl Read for Dribble {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = buf.len().min(5);
                self.0.read(&mut buf[..n])
            }
        }

        let data: Vec<u8> = (0..6i16).flat_map(|s| (s * 1000).to_le_bytes()).collect();
        let mut decoder =
            RawPcmDecoder::new(Dribble(Cursor::new(data)), layout(16, 2, Endianness::Little)).unwrap();

        let mut out = Vec::new();
        while decoder.decode_next(&mut out).unwrap().is_some() {}
        assert_eq!(out.len(), 6);
        assert_eq!(out[5], 5000.0 / 32_768.0);
    }

    #[test]
    fn test_rejects_odd_sample_size() {
        let result = RawPcmDecoder::new(Cursor::new(Vec::new()), layout(20, 2, Endianness::Little));
        assert!(result.is_err());
    }
}
