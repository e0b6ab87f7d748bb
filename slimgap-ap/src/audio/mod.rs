//! Audio decoding, resampling and output
//!
//! Everything downstream of the stream source works in one fixed format:
//! interleaved stereo f32 at the configured output rate (see
//! [`OutputFormat`]).

pub mod decoder;
pub mod output;
pub mod pcm;
pub mod resampler;
pub mod types;

pub use output::{OutputDevice, OutputEvent, PacedOutput};
#[cfg(feature = "cpal-output")]
pub use output::CpalOutput;
pub use resampler::StreamResampler;
pub use types::{OutputFormat, BYTES_PER_FRAME, BYTES_PER_SAMPLE, OUTPUT_CHANNELS};
