use thiserror::Error;

/// Frame encoding or decoding failure
///
/// The session treats any decode failure as fatal to the connection; there is
/// no partial-frame recovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Declared length disagrees with the bytes available, or a fixed-size
    /// header is truncated.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Opcode plus payload do not fit the 16-bit server length prefix
    #[error("Frame too large: {len} bytes (limit {limit})")]
    FrameTooLarge { len: usize, limit: usize },
}

impl CodecError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        CodecError::MalformedFrame(msg.into())
    }
}
