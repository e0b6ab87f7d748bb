//! Track directives
//!
//! A [`TrackDirective`] is the interpreted form of a `strm s` frame: the
//! codec, autostart mode and stream location resolved once, with a fresh
//! track id attached.

use super::error::CodecError;
use super::server::{Strm, StrmCommand};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use uuid::Uuid;

/// Identifies one track for the lifetime of a session
pub type TrackId = Uuid;

/// When output should start for a new stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutostartMode {
    /// '0': buffer, wait for `strm u`
    Paused,
    /// '1': start once the threshold is reached
    Autoplay,
    /// '2': direct stream, wait for `strm u`
    Direct,
    /// '3': keep the current output state
    Continue,
}

impl AutostartMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'0' => Some(AutostartMode::Paused),
            b'1' => Some(AutostartMode::Autoplay),
            b'2' => Some(AutostartMode::Direct),
            b'3' => Some(AutostartMode::Continue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Big,
    Little,
}

/// Raw PCM layout from the `strm` header
///
/// A field is `None` when the server sent `'?'`, meaning the stream itself
/// (WAV/AIFF header) describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub bits_per_sample: Option<u16>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub endianness: Option<Endianness>,
}

impl PcmFormat {
    fn from_strm(strm: &Strm) -> Self {
        let bits_per_sample = match strm.pcm_sample_size {
            b'0' => Some(8),
            b'1' => Some(16),
            b'2' => Some(24),
            b'3' => Some(32),
            _ => None,
        };
        let sample_rate = match strm.pcm_sample_rate {
            b'0' => Some(11_025),
            b'1' => Some(22_050),
            b'2' => Some(32_000),
            b'3' => Some(44_100),
            b'4' => Some(48_000),
            b'5' => Some(8_000),
            b'6' => Some(12_000),
            b'7' => Some(16_000),
            b'8' => Some(24_000),
            b'9' => Some(96_000),
            b':' => Some(88_200),
            b';' => Some(176_400),
            b'<' => Some(192_000),
            b'=' => Some(352_800),
            b'>' => Some(384_000),
            _ => None,
        };
        let channels = match strm.pcm_channels {
            b'1' => Some(1),
            b'2' => Some(2),
            _ => None,
        };
        let endianness = match strm.pcm_endianness {
            b'0' => Some(Endianness::Big),
            b'1' => Some(Endianness::Little),
            _ => None,
        };

        Self {
            bits_per_sample,
            sample_rate,
            channels,
            endianness,
        }
    }

    /// True when every field is given, i.e. the stream is headerless PCM
    pub fn is_raw(&self) -> bool {
        self.bits_per_sample.is_some()
            && self.sample_rate.is_some()
            && self.channels.is_some()
            && self.endianness.is_some()
    }
}

/// Codec of a stream, resolved from the `strm` format byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Pcm(PcmFormat),
    Mp3,
    Flac,
    Ogg,
    Aac,
    Alac,
    Wma,
    Opus,
    Dsd,
    /// Format byte this client does not recognise
    Unsupported(u8),
}

impl Codec {
    pub fn from_strm(strm: &Strm) -> Self {
        match strm.format {
            b'p' => Codec::Pcm(PcmFormat::from_strm(strm)),
            b'm' => Codec::Mp3,
            b'f' => Codec::Flac,
            b'o' => Codec::Ogg,
            b'a' => Codec::Aac,
            b'l' => Codec::Alac,
            b'w' => Codec::Wma,
            b'u' => Codec::Opus,
            b'd' => Codec::Dsd,
            other => Codec::Unsupported(other),
        }
    }

    /// Whether this build can decode the codec
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            Codec::Pcm(_) | Codec::Mp3 | Codec::Flac | Codec::Ogg | Codec::Aac | Codec::Alac
        )
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Pcm(_) => write!(f, "pcm"),
            Codec::Mp3 => write!(f, "mp3"),
            Codec::Flac => write!(f, "flac"),
            Codec::Ogg => write!(f, "ogg"),
            Codec::Aac => write!(f, "aac"),
            Codec::Alac => write!(f, "alac"),
            Codec::Wma => write!(f, "wma"),
            Codec::Opus => write!(f, "opus"),
            Codec::Dsd => write!(f, "dsd"),
            Codec::Unsupported(tag) => write!(f, "unsupported({:#04x})", tag),
        }
    }
}

/// Where to fetch a stream from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLocator {
    /// `None` means the control server's own address
    pub server_ip: Option<Ipv4Addr>,
    pub server_port: u16,
    /// HTTP request to send verbatim
    pub request: String,
}

impl MediaLocator {
    /// Socket address of the stream server, given the control server address
    pub fn resolve(&self, control_ip: IpAddr) -> SocketAddr {
        let ip = self.server_ip.map(IpAddr::V4).unwrap_or(control_ip);
        SocketAddr::new(ip, self.server_port)
    }
}

/// Decoded "start playing this" instruction
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDirective {
    pub track_id: TrackId,
    pub locator: MediaLocator,
    pub codec: Codec,
    pub autostart: AutostartMode,
    /// Compressed bytes (KiB) to receive before `Autoplay` starts output
    pub threshold_kib: u32,
    /// Linear replay gain, 1.0 when the server sends 0
    pub replay_gain: f32,
    /// Audio before this point is decoded and discarded
    pub seek_offset: Duration,
}

impl TrackDirective {
    /// Interpret a `strm s` frame
    ///
    /// # Errors
    /// `MalformedFrame` if the frame is not a start command or the autostart
    /// byte is outside `'0'..='3'`.
    pub fn from_strm(strm: &Strm) -> Result<Self, CodecError> {
        if strm.command != StrmCommand::Start {
            return Err(CodecError::malformed(format!(
                "directive from non-start strm ({:?})",
                strm.command
            )));
        }

        let autostart = AutostartMode::from_byte(strm.autostart).ok_or_else(|| {
            CodecError::malformed(format!("autostart byte {:#04x}", strm.autostart))
        })?;

        let replay_gain = if strm.replay_gain == 0 {
            1.0
        } else {
            strm.replay_gain as f32 / 65536.0
        };

        Ok(Self {
            track_id: Uuid::new_v4(),
            locator: MediaLocator {
                server_ip: strm.server_ip(),
                server_port: strm.server_port,
                request: String::from_utf8_lossy(&strm.request).into_owned(),
            },
            codec: Codec::from_strm(strm),
            autostart,
            threshold_kib: strm.threshold as u32,
            replay_gain,
            seek_offset: Duration::ZERO,
        })
    }

    /// Start decoding partway into the track
    pub fn with_seek_offset(mut self, offset: Duration) -> Self {
        self.seek_offset = offset;
        self
    }
}
