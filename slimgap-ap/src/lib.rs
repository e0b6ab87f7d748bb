//! slimgap-ap: SlimProto player with gapless track transitions
//!
//! The player holds one control session to a music server, fetches and
//! decodes the streams it is told to play, and renders PCM from a single
//! continuous buffer so consecutive tracks join without silence.
//!
//! - [`session`]: control connection and handshake
//! - [`playback`]: buffer, boundaries, decoders and the coordinator loop
//! - [`audio`]: decoding, resampling and output devices
//! - [`config`]: bootstrap settings

pub mod audio;
pub mod config;
pub mod error;
pub mod playback;
pub mod session;

pub use error::{Error, Result};

/// Short git hash captured at build time
pub const GIT_HASH: &str = env!("GIT_HASH");

/// RFC 3339 build time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");

pub const BUILD_PROFILE: &str = env!("BUILD_PROFILE");

/// Firmware string reported to the server
pub fn build_id() -> String {
    format!("{}-{}", env!("CARGO_PKG_VERSION"), GIT_HASH)
}
