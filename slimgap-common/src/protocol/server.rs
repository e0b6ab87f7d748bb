//! Server → client frames
//!
//! Layout: `u16 length | opcode[4] | payload`, where `length` counts the
//! opcode and the payload.

use super::error::CodecError;
use super::{UnknownFrame, OPCODE_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Size of the length prefix on server frames
pub const SERVER_HEADER_LEN: usize = 2;

/// Fixed part of a `strm` payload (the HTTP request follows it)
pub const STRM_FIXED_LEN: usize = 24;

const AUDE_LEN: usize = 2;
const AUDG_LEN: usize = 18;

/// Opcodes with a typed variant
const KNOWN_OPCODES: [[u8; 4]; 3] = [*b"strm", *b"aude", *b"audg"];

/// Frame sent by the music server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Stream control: start, pause, unpause, stop, status query, flush, skip
    Strm(Strm),

    /// Audio output enable flags
    Aude(Aude),

    /// Output gain
    Audg(Audg),

    /// Any opcode this client does not interpret
    Unknown(UnknownFrame),
}

impl ServerFrame {
    /// Wire opcode for this frame
    pub fn opcode(&self) -> [u8; 4] {
        match self {
            ServerFrame::Strm(_) => *b"strm",
            ServerFrame::Aude(_) => *b"aude",
            ServerFrame::Audg(_) => *b"audg",
            ServerFrame::Unknown(frame) => frame.opcode(),
        }
    }

    /// Frame for an opcode without a typed variant; `None` for `strm`,
    /// `aude` and `audg`
    pub fn unknown(opcode: [u8; 4], payload: impl Into<Bytes>) -> Option<Self> {
        if KNOWN_OPCODES.contains(&opcode) {
            return None;
        }
        Some(ServerFrame::Unknown(UnknownFrame::new(opcode, payload.into())))
    }

    /// Encode including the length prefix
    ///
    /// # Errors
    /// `FrameTooLarge` when opcode and payload exceed `u16::MAX` bytes, e.g.
    /// a `strm` carrying an oversized HTTP request.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut payload = BytesMut::new();
        match self {
            ServerFrame::Strm(strm) => strm.write_payload(&mut payload),
            ServerFrame::Aude(aude) => aude.write_payload(&mut payload),
            ServerFrame::Audg(audg) => audg.write_payload(&mut payload),
            ServerFrame::Unknown(frame) => payload.put_slice(frame.payload()),
        }

        let len = OPCODE_LEN + payload.len();
        let declared = u16::try_from(len).map_err(|_| CodecError::FrameTooLarge {
            len,
            limit: u16::MAX as usize,
        })?;

        let mut out = BytesMut::with_capacity(SERVER_HEADER_LEN + len);
        out.put_u16(declared);
        out.put_slice(&self.opcode());
        out.put_slice(&payload);
        Ok(out.freeze())
    }

    /// Decode one complete frame (length prefix included)
    ///
    /// # Errors
    /// `MalformedFrame` when the length prefix is truncated, when the declared
    /// length differs from the bytes supplied, or when a known opcode's fixed
    /// header is short.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < SERVER_HEADER_LEN {
            return Err(CodecError::malformed(format!(
                "truncated length prefix ({} bytes)",
                frame.len()
            )));
        }

        let mut buf = frame;
        let declared = buf.get_u16() as usize;
        if declared != buf.remaining() {
            return Err(CodecError::malformed(format!(
                "declared length {} but {} bytes available",
                declared,
                buf.remaining()
            )));
        }

        Self::decode_body(buf)
    }

    /// Decode the bytes that follow the length prefix (opcode + payload)
    ///
    /// Used by the session, which reads the prefix separately and then
    /// exactly `length` bytes.
    pub fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        if body.len() < OPCODE_LEN {
            return Err(CodecError::malformed(format!(
                "truncated opcode ({} bytes)",
                body.len()
            )));
        }

        let mut opcode = [0u8; 4];
        opcode.copy_from_slice(&body[..OPCODE_LEN]);
        let payload = &body[OPCODE_LEN..];

        match &opcode {
            b"strm" => Ok(ServerFrame::Strm(Strm::parse(payload)?)),
            b"aude" => Ok(ServerFrame::Aude(Aude::parse(payload)?)),
            b"audg" => Ok(ServerFrame::Audg(Audg::parse(payload)?)),
            _ => Ok(ServerFrame::Unknown(UnknownFrame::new(
                opcode,
                Bytes::copy_from_slice(payload),
            ))),
        }
    }
}

/// `strm` sub-command
///
/// Equality is by wire byte, so `Other(b'q')` equals `Stop`.
#[derive(Debug, Clone, Copy)]
pub enum StrmCommand {
    Start,
    Pause,
    Unpause,
    Stop,
    /// Status query / heartbeat; `replay_gain` carries the server timestamp
    Status,
    Flush,
    /// Skip ahead; `replay_gain` carries the interval in milliseconds
    SkipAhead,
    /// Sub-command byte this client does not interpret
    Other(u8),
}

impl StrmCommand {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b's' => StrmCommand::Start,
            b'p' => StrmCommand::Pause,
            b'u' => StrmCommand::Unpause,
            b'q' => StrmCommand::Stop,
            b't' => StrmCommand::Status,
            b'f' => StrmCommand::Flush,
            b'a' => StrmCommand::SkipAhead,
            other => StrmCommand::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            StrmCommand::Start => b's',
            StrmCommand::Pause => b'p',
            StrmCommand::Unpause => b'u',
            StrmCommand::Stop => b'q',
            StrmCommand::Status => b't',
            StrmCommand::Flush => b'f',
            StrmCommand::SkipAhead => b'a',
            StrmCommand::Other(b) => b,
        }
    }
}

impl PartialEq for StrmCommand {
    fn eq(&self, other: &Self) -> bool {
        self.to_byte() == other.to_byte()
    }
}

impl Eq for StrmCommand {}

/// `strm` frame
///
/// Fields are kept as they appear on the wire; interpretation of the start
/// payload (codec, autostart, PCM format) happens once when a
/// [`TrackDirective`](super::TrackDirective) is built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strm {
    pub command: StrmCommand,
    pub autostart: u8,
    pub format: u8,
    pub pcm_sample_size: u8,
    pub pcm_sample_rate: u8,
    pub pcm_channels: u8,
    pub pcm_endianness: u8,
    /// Input buffer threshold in KiB before autostart
    pub threshold: u8,
    pub spdif_enable: u8,
    pub transition_period: u8,
    pub transition_type: u8,
    pub flags: u8,
    pub output_threshold: u8,
    pub reserved: u8,
    /// 16.16 replay gain on start; timestamp or interval on control commands
    pub replay_gain: u32,
    pub server_port: u16,
    /// 0 means "the control server's address"
    pub server_ip: u32,
    /// HTTP request to send to the stream server (start only)
    pub request: Bytes,
}

impl Strm {
    /// Control frame (pause, unpause, stop, status, flush, skip) with neutral
    /// start fields
    pub fn control(command: StrmCommand, replay_gain: u32) -> Self {
        Self {
            command,
            autostart: b'0',
            format: b'm',
            pcm_sample_size: b'?',
            pcm_sample_rate: b'?',
            pcm_channels: b'?',
            pcm_endianness: b'?',
            threshold: 0,
            spdif_enable: b'0',
            transition_period: 0,
            transition_type: b'0',
            flags: 0,
            output_threshold: 0,
            reserved: 0,
            replay_gain,
            server_port: 0,
            server_ip: 0,
            request: Bytes::new(),
        }
    }

    /// Start frame for a stream served from `server_port` on the control
    /// server's address
    pub fn start(format: u8, autostart: u8, server_port: u16, request: impl Into<Bytes>) -> Self {
        Self {
            autostart,
            format,
            threshold: 1,
            server_port,
            request: request.into(),
            ..Self::control(StrmCommand::Start, 0)
        }
    }

    /// Stream server address, `None` when the control server should be used
    pub fn server_ip(&self) -> Option<Ipv4Addr> {
        if self.server_ip == 0 {
            None
        } else {
            Some(Ipv4Addr::from(self.server_ip))
        }
    }

    fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < STRM_FIXED_LEN {
            return Err(CodecError::malformed(format!(
                "strm header needs {} bytes, got {}",
                STRM_FIXED_LEN,
                payload.len()
            )));
        }

        let mut buf = payload;
        Ok(Self {
            command: StrmCommand::from_byte(buf.get_u8()),
            autostart: buf.get_u8(),
            format: buf.get_u8(),
            pcm_sample_size: buf.get_u8(),
            pcm_sample_rate: buf.get_u8(),
            pcm_channels: buf.get_u8(),
            pcm_endianness: buf.get_u8(),
            threshold: buf.get_u8(),
            spdif_enable: buf.get_u8(),
            transition_period: buf.get_u8(),
            transition_type: buf.get_u8(),
            flags: buf.get_u8(),
            output_threshold: buf.get_u8(),
            reserved: buf.get_u8(),
            replay_gain: buf.get_u32(),
            server_port: buf.get_u16(),
            server_ip: buf.get_u32(),
            request: Bytes::copy_from_slice(buf),
        })
    }

    fn write_payload(&self, out: &mut BytesMut) {
        out.reserve(STRM_FIXED_LEN + self.request.len());
        out.put_u8(self.command.to_byte());
        out.put_u8(self.autostart);
        out.put_u8(self.format);
        out.put_u8(self.pcm_sample_size);
        out.put_u8(self.pcm_sample_rate);
        out.put_u8(self.pcm_channels);
        out.put_u8(self.pcm_endianness);
        out.put_u8(self.threshold);
        out.put_u8(self.spdif_enable);
        out.put_u8(self.transition_period);
        out.put_u8(self.transition_type);
        out.put_u8(self.flags);
        out.put_u8(self.output_threshold);
        out.put_u8(self.reserved);
        out.put_u32(self.replay_gain);
        out.put_u16(self.server_port);
        out.put_u32(self.server_ip);
        out.put_slice(&self.request);
    }
}

/// `aude` frame: output enable flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aude {
    pub spdif_enable: bool,
    pub dac_enable: bool,
}

impl Aude {
    fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < AUDE_LEN {
            return Err(CodecError::malformed(format!(
                "aude needs {} bytes, got {}",
                AUDE_LEN,
                payload.len()
            )));
        }
        Ok(Self {
            spdif_enable: payload[0] != 0,
            dac_enable: payload[1] != 0,
        })
    }

    fn write_payload(&self, out: &mut BytesMut) {
        out.put_u8(self.spdif_enable as u8);
        out.put_u8(self.dac_enable as u8);
    }
}

/// `audg` frame: output gain
///
/// New-style gains are 16.16 fixed point; the old-style fields are carried
/// for byte compatibility only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Audg {
    pub old_gain_left: u32,
    pub old_gain_right: u32,
    pub digital_volume: bool,
    pub preamp: u8,
    pub gain_left: u32,
    pub gain_right: u32,
}

impl Audg {
    /// Linear gain (average of both channels)
    pub fn gain(&self) -> f32 {
        let left = self.gain_left as f32 / 65536.0;
        let right = self.gain_right as f32 / 65536.0;
        (left + right) / 2.0
    }

    fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        // Newer servers append a sequence number; it is ignored.
        if payload.len() < AUDG_LEN {
            return Err(CodecError::malformed(format!(
                "audg needs {} bytes, got {}",
                AUDG_LEN,
                payload.len()
            )));
        }

        let mut buf = payload;
        Ok(Self {
            old_gain_left: buf.get_u32(),
            old_gain_right: buf.get_u32(),
            digital_volume: buf.get_u8() != 0,
            preamp: buf.get_u8(),
            gain_left: buf.get_u32(),
            gain_right: buf.get_u32(),
        })
    }

    fn write_payload(&self, out: &mut BytesMut) {
        out.put_u32(self.old_gain_left);
        out.put_u32(self.old_gain_right);
        out.put_u8(self.digital_volume as u8);
        out.put_u8(self.preamp);
        out.put_u32(self.gain_left);
        out.put_u32(self.gain_right);
    }
}
