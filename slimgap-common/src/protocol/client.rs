//! Client → server frames
//!
//! Layout: `opcode[4] | u32 length | payload`, where `length` counts the
//! payload only.

use super::error::CodecError;
use super::{UnknownFrame, OPCODE_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Opcode plus u32 length
pub const CLIENT_HEADER_LEN: usize = 8;

/// Size of the status body that follows the STAT event code
pub const STATUS_BODY_LEN: usize = 49;

const HELO_FIXED_LEN: usize = 36;

/// Opcodes with a typed variant
const KNOWN_OPCODES: [[u8; 4]; 5] = [*b"HELO", *b"STAT", *b"RESP", *b"DSCO", *b"BYE!"];

/// Frame sent to the music server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Handshake, sent once per connection
    Helo(Helo),

    /// Status event with the current buffer/playback snapshot
    Stat(Stat),

    /// HTTP response headers received from the stream server
    Resp(Bytes),

    /// Stream connection closed; payload is the reason code
    Dsco(u8),

    /// Orderly goodbye
    Bye,

    Unknown(UnknownFrame),
}

impl ClientFrame {
    pub fn opcode(&self) -> [u8; 4] {
        match self {
            ClientFrame::Helo(_) => *b"HELO",
            ClientFrame::Stat(_) => *b"STAT",
            ClientFrame::Resp(_) => *b"RESP",
            ClientFrame::Dsco(_) => *b"DSCO",
            ClientFrame::Bye => *b"BYE!",
            ClientFrame::Unknown(frame) => frame.opcode(),
        }
    }

    /// Frame for an opcode without a typed variant; `None` for the opcodes
    /// this codec interprets
    pub fn unknown(opcode: [u8; 4], payload: impl Into<Bytes>) -> Option<Self> {
        if KNOWN_OPCODES.contains(&opcode) {
            return None;
        }
        Some(ClientFrame::Unknown(UnknownFrame::new(opcode, payload.into())))
    }

    /// Encode including the opcode and length header
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            ClientFrame::Helo(helo) => helo.write_payload(&mut payload),
            ClientFrame::Stat(stat) => stat.write_payload(&mut payload),
            ClientFrame::Resp(headers) => payload.put_slice(headers),
            ClientFrame::Dsco(reason) => payload.put_u8(*reason),
            ClientFrame::Bye => {}
            ClientFrame::Unknown(frame) => payload.put_slice(frame.payload()),
        }

        let mut out = BytesMut::with_capacity(CLIENT_HEADER_LEN + payload.len());
        out.put_slice(&self.opcode());
        out.put_u32(payload.len() as u32);
        out.put_slice(&payload);
        out.freeze()
    }

    /// Decode one complete frame (header included)
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < CLIENT_HEADER_LEN {
            return Err(CodecError::malformed(format!(
                "client header needs {} bytes, got {}",
                CLIENT_HEADER_LEN,
                frame.len()
            )));
        }

        let mut opcode = [0u8; 4];
        opcode.copy_from_slice(&frame[..OPCODE_LEN]);
        let mut buf = &frame[OPCODE_LEN..];
        let declared = buf.get_u32() as usize;
        if declared != buf.remaining() {
            return Err(CodecError::malformed(format!(
                "declared length {} but {} bytes available",
                declared,
                buf.remaining()
            )));
        }

        match &opcode {
            b"HELO" => Ok(ClientFrame::Helo(Helo::parse(buf)?)),
            b"STAT" => Ok(ClientFrame::Stat(Stat::parse(buf)?)),
            b"RESP" => Ok(ClientFrame::Resp(Bytes::copy_from_slice(buf))),
            b"DSCO" => match buf.first() {
                Some(reason) => Ok(ClientFrame::Dsco(*reason)),
                None => Err(CodecError::malformed("DSCO without reason byte")),
            },
            b"BYE!" => Ok(ClientFrame::Bye),
            _ => Ok(ClientFrame::Unknown(UnknownFrame::new(
                opcode,
                Bytes::copy_from_slice(buf),
            ))),
        }
    }
}

/// `HELO` handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helo {
    pub device_id: u8,
    pub revision: u8,
    pub mac: [u8; 6],
    pub uuid: [u8; 16],
    /// Bitmask of usable WLAN channels (0 for wired)
    pub wlan_channels: u16,
    /// Bytes received across reconnects
    pub bytes_received: u64,
    pub language: [u8; 2],
    /// Comma separated capability list, e.g. `Model=slimgap,flc,mp3,...`
    pub capabilities: String,
}

impl Helo {
    fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < HELO_FIXED_LEN {
            return Err(CodecError::malformed(format!(
                "HELO needs {} bytes, got {}",
                HELO_FIXED_LEN,
                payload.len()
            )));
        }

        let mut buf = payload;
        let device_id = buf.get_u8();
        let revision = buf.get_u8();
        let mut mac = [0u8; 6];
        buf.copy_to_slice(&mut mac);
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let wlan_channels = buf.get_u16();
        let hi = buf.get_u32() as u64;
        let lo = buf.get_u32() as u64;
        let mut language = [0u8; 2];
        buf.copy_to_slice(&mut language);
        let capabilities = String::from_utf8(buf.to_vec())
            .map_err(|e| CodecError::malformed(format!("HELO capabilities: {}", e)))?;

        Ok(Self {
            device_id,
            revision,
            mac,
            uuid,
            wlan_channels,
            bytes_received: (hi << 32) | lo,
            language,
            capabilities,
        })
    }

    fn write_payload(&self, out: &mut BytesMut) {
        out.reserve(HELO_FIXED_LEN + self.capabilities.len());
        out.put_u8(self.device_id);
        out.put_u8(self.revision);
        out.put_slice(&self.mac);
        out.put_slice(&self.uuid);
        out.put_u16(self.wlan_channels);
        out.put_u32((self.bytes_received >> 32) as u32);
        out.put_u32(self.bytes_received as u32);
        out.put_slice(&self.language);
        out.put_slice(self.capabilities.as_bytes());
    }
}

/// STAT event code
///
/// Equality is by wire code, so `Other(*b"STMc")` equals `Connected`.
#[derive(Debug, Clone, Copy)]
pub enum StatusCode {
    /// STMc: connected to the stream source
    Connected,
    /// STMd: decoder finished, ready for the next track
    DecodeReady,
    /// STMf: buffers flushed
    Flushed,
    /// STMn: decoder cannot handle the stream
    NotSupported,
    /// STMo: output underrun while the stream is still decoding
    OutputUnderrun,
    /// STMp: paused
    Paused,
    /// STMr: resumed
    Resumed,
    /// STMs: a new track started playing
    TrackStarted,
    /// STMt: heartbeat reply
    Timer,
    /// STMu: playback drained, nothing left to play
    Underrun,
    Other([u8; 4]),
}

impl StatusCode {
    pub fn from_code(code: [u8; 4]) -> Self {
        match &code {
            b"STMc" => StatusCode::Connected,
            b"STMd" => StatusCode::DecodeReady,
            b"STMf" => StatusCode::Flushed,
            b"STMn" => StatusCode::NotSupported,
            b"STMo" => StatusCode::OutputUnderrun,
            b"STMp" => StatusCode::Paused,
            b"STMr" => StatusCode::Resumed,
            b"STMs" => StatusCode::TrackStarted,
            b"STMt" => StatusCode::Timer,
            b"STMu" => StatusCode::Underrun,
            _ => StatusCode::Other(code),
        }
    }

    pub fn code(&self) -> [u8; 4] {
        match self {
            StatusCode::Connected => *b"STMc",
            StatusCode::DecodeReady => *b"STMd",
            StatusCode::Flushed => *b"STMf",
            StatusCode::NotSupported => *b"STMn",
            StatusCode::OutputUnderrun => *b"STMo",
            StatusCode::Paused => *b"STMp",
            StatusCode::Resumed => *b"STMr",
            StatusCode::TrackStarted => *b"STMs",
            StatusCode::Timer => *b"STMt",
            StatusCode::Underrun => *b"STMu",
            StatusCode::Other(code) => *code,
        }
    }
}

impl PartialEq for StatusCode {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl Eq for StatusCode {}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Buffer and playback snapshot carried by every STAT frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusBody {
    pub num_crlf: u8,
    pub mas_initialized: u8,
    pub mas_mode: u8,
    pub stream_buffer_size: u32,
    pub stream_buffer_fullness: u32,
    pub bytes_received: u64,
    pub signal_strength: u16,
    pub jiffies: u32,
    pub output_buffer_size: u32,
    pub output_buffer_fullness: u32,
    pub elapsed_seconds: u32,
    pub voltage: u16,
    pub elapsed_milliseconds: u32,
    /// Echo of the timestamp from the last `strm t`
    pub server_timestamp: u32,
    pub error_code: u16,
}

impl StatusBody {
    fn parse(buf: &mut &[u8]) -> Self {
        let num_crlf = buf.get_u8();
        let mas_initialized = buf.get_u8();
        let mas_mode = buf.get_u8();
        let stream_buffer_size = buf.get_u32();
        let stream_buffer_fullness = buf.get_u32();
        let hi = buf.get_u32() as u64;
        let lo = buf.get_u32() as u64;
        Self {
            num_crlf,
            mas_initialized,
            mas_mode,
            stream_buffer_size,
            stream_buffer_fullness,
            bytes_received: (hi << 32) | lo,
            signal_strength: buf.get_u16(),
            jiffies: buf.get_u32(),
            output_buffer_size: buf.get_u32(),
            output_buffer_fullness: buf.get_u32(),
            elapsed_seconds: buf.get_u32(),
            voltage: buf.get_u16(),
            elapsed_milliseconds: buf.get_u32(),
            server_timestamp: buf.get_u32(),
            error_code: buf.get_u16(),
        }
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.num_crlf);
        out.put_u8(self.mas_initialized);
        out.put_u8(self.mas_mode);
        out.put_u32(self.stream_buffer_size);
        out.put_u32(self.stream_buffer_fullness);
        out.put_u32((self.bytes_received >> 32) as u32);
        out.put_u32(self.bytes_received as u32);
        out.put_u16(self.signal_strength);
        out.put_u32(self.jiffies);
        out.put_u32(self.output_buffer_size);
        out.put_u32(self.output_buffer_fullness);
        out.put_u32(self.elapsed_seconds);
        out.put_u16(self.voltage);
        out.put_u32(self.elapsed_milliseconds);
        out.put_u32(self.server_timestamp);
        out.put_u16(self.error_code);
    }
}

/// `STAT` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub code: StatusCode,
    pub body: StatusBody,
}

impl Stat {
    pub fn new(code: StatusCode, body: StatusBody) -> Self {
        Self { code, body }
    }

    fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < OPCODE_LEN + STATUS_BODY_LEN {
            return Err(CodecError::malformed(format!(
                "STAT needs {} bytes, got {}",
                OPCODE_LEN + STATUS_BODY_LEN,
                payload.len()
            )));
        }

        let mut buf = payload;
        let mut code = [0u8; 4];
        buf.copy_to_slice(&mut code);
        let body = StatusBody::parse(&mut buf);
        Ok(Self {
            code: StatusCode::from_code(code),
            body,
        })
    }

    fn write_payload(&self, out: &mut BytesMut) {
        out.reserve(OPCODE_LEN + STATUS_BODY_LEN);
        out.put_slice(&self.code.code());
        self.body.write(out);
    }
}
