//! Error types for slimgap-ap

use thiserror::Error;

/// Main error type for the player core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Control connection errors (handshake, write failure)
    #[error("Session error: {0}")]
    Session(String),

    /// Stream source could not be opened or read
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Codec the decoder cannot handle
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Resampler construction or processing errors
    #[error("Resample error: {0}")]
    Resample(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// File and socket I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shared configuration errors
    #[error(transparent)]
    Common(#[from] slimgap_common::Error),
}

/// Convenience Result type using slimgap-ap Error
pub type Result<T> = std::result::Result<T, Error>;
