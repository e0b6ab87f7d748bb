//! SlimProto wire codec
//!
//! Stateless translation between wire bytes and typed frames. Two framings
//! share one TCP connection:
//!
//! ```text
//! server -> client:  u16 length | opcode[4] | payload       (length covers opcode + payload)
//! client -> server:  opcode[4]  | u32 length | payload      (length covers payload only)
//! ```
//!
//! All numeric fields are big-endian. Unknown opcodes decode to an `Unknown`
//! variant so newer servers never break an older client. Every frame value
//! the public API can build decodes back to an equal value.

mod client;
mod directive;
mod error;
mod server;

pub use client::{
    ClientFrame, Helo, Stat, StatusBody, StatusCode, CLIENT_HEADER_LEN, STATUS_BODY_LEN,
};
pub use directive::{
    AutostartMode, Codec, Endianness, MediaLocator, PcmFormat, TrackDirective, TrackId,
};
pub use error::CodecError;
pub use server::{Aude, Audg, ServerFrame, Strm, StrmCommand, SERVER_HEADER_LEN, STRM_FIXED_LEN};

/// Default SlimProto control port
pub const SLIMPROTO_PORT: u16 = 3483;

/// Opcode length shared by both framings
pub const OPCODE_LEN: usize = 4;

/// Frame with an opcode the codec does not interpret
///
/// Only decoding and the `unknown` constructors on [`ServerFrame`] and
/// [`ClientFrame`] build one, and both refuse opcodes that have a typed
/// variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    opcode: [u8; 4],
    payload: bytes::Bytes,
}

impl UnknownFrame {
    pub(crate) fn new(opcode: [u8; 4], payload: bytes::Bytes) -> Self {
        Self { opcode, payload }
    }

    pub fn opcode(&self) -> [u8; 4] {
        self.opcode
    }

    pub fn payload(&self) -> &bytes::Bytes {
        &self.payload
    }
}
