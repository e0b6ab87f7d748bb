//! Streaming audio decoder using symphonia
//!
//! Decodes MP3, FLAC, Ogg Vorbis, AAC (ADTS/MP4), ALAC and WAV-headed PCM
//! from a forward-only byte stream, one packet at a time. Output is always
//! interleaved stereo f32: mono is duplicated, channels beyond the first two
//! are dropped.

use crate::error::{Error, Result};
use slimgap_common::protocol::Codec;
use std::io::Read;
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, warn};

/// Corrupt packets tolerated in a row before the stream is abandoned
pub const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 3;

/// A decoder producing interleaved stereo f32 from a byte stream
pub trait AudioStreamDecoder: Send {
    /// Decode the next unit, appending samples to `out`
    ///
    /// Returns the source sample rate of what was appended, or `None` at
    /// end of stream. A call may append nothing (e.g. a skipped packet).
    fn decode_next(&mut self, out: &mut Vec<f32>) -> Result<Option<u32>>;
}

/// Container/extension hint for a codec
pub fn hint_for(codec: &Codec) -> Option<&'static str> {
    match codec {
        Codec::Pcm(_) => Some("wav"),
        Codec::Mp3 => Some("mp3"),
        Codec::Flac => Some("flac"),
        Codec::Ogg => Some("ogg"),
        Codec::Aac => Some("aac"),
        Codec::Alac => Some("m4a"),
        Codec::Wma | Codec::Opus | Codec::Dsd | Codec::Unsupported(_) => None,
    }
}

/// Symphonia-backed decoder over a forward-only source
pub struct SymphoniaStreamDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    consecutive_errors: u32,
}

impl SymphoniaStreamDecoder {
    /// Probe the stream and set up the decoder for its first audio track
    ///
    /// Probing reads from `source`, so this blocks until enough bytes have
    /// arrived to identify the format.
    pub fn open<R>(source: R, codec: &Codec) -> Result<Self>
    where
        R: Read + Send + Sync + 'static,
    {
        let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(source)), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = hint_for(codec) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to probe {} stream: {}", codec, e)))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        debug!(
            "Stream format: codec={}, sample_rate={:?}, channels={:?}",
            codec,
            track.codec_params.sample_rate,
            track.codec_params.channels.map(|c| c.count())
        );

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            consecutive_errors: 0,
        })
    }
}

impl AudioStreamDecoder for SymphoniaStreamDecoder {
    fn decode_next(&mut self, out: &mut Vec<f32>) -> Result<Option<u32>> {
        let packet = match self.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Reached end of stream");
                return Ok(None);
            }
            Err(SymphoniaError::ResetRequired) => {
                // Chained stream (e.g. a new Ogg logical stream)
                self.decoder.reset();
                return Ok(Some(0));
            }
            Err(e) => return Err(Error::Decode(format!("Error reading packet: {}", e))),
        };

        if packet.track_id() != self.track_id {
            return Ok(Some(0));
        }

        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                self.consecutive_errors = 0;
                let rate = decoded.spec().rate;
                convert_samples_to_f32(&decoded, out);
                Ok(Some(rate))
            }
            Err(SymphoniaError::DecodeError(e)) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                    return Err(Error::Decode(format!(
                        "{} consecutive corrupt packets, last: {}",
                        self.consecutive_errors, e
                    )));
                }
                warn!("Skipping corrupt packet: {}", e);
                Ok(Some(0))
            }
            Err(e) => Err(Error::Decode(format!("Decode failed: {}", e))),
        }
    }
}

/// Convert a symphonia buffer to interleaved stereo f32
pub fn convert_samples_to_f32(decoded: &AudioBufferRef, output: &mut Vec<f32>) {
    match decoded {
        AudioBufferRef::F32(buf) => interleave_planar(buf, output),
        AudioBufferRef::F64(buf) => interleave_planar(buf, output),
        AudioBufferRef::S32(buf) => interleave_planar(buf, output),
        AudioBufferRef::S24(buf) => interleave_planar(buf, output),
        AudioBufferRef::S16(buf) => interleave_planar(buf, output),
        AudioBufferRef::S8(buf) => interleave_planar(buf, output),
        AudioBufferRef::U32(buf) => interleave_planar(buf, output),
        AudioBufferRef::U24(buf) => interleave_planar(buf, output),
        AudioBufferRef::U16(buf) => interleave_planar(buf, output),
        AudioBufferRef::U8(buf) => interleave_planar(buf, output),
    }
}

fn interleave_planar<S>(buf: &AudioBuffer<S>, output: &mut Vec<f32>)
where
    S: Sample,
    f32: FromSample<S>,
{
    let num_channels = buf.spec().channels.count();
    let num_frames = buf.frames();
    if num_channels == 0 {
        return;
    }

    output.reserve(num_frames * 2);
    let left = buf.chan(0);
    let right = if num_channels > 1 { buf.chan(1) } else { left };
    for frame_idx in 0..num_frames {
        output.push(f32::from_sample(left[frame_idx]));
        output.push(f32::from_sample(right[frame_idx]));
    }
}
