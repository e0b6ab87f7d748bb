//! SlimProto control session
//!
//! One persistent TCP connection to the music server (port 3483). On
//! connect the session sends `HELO` once, then a reader task decodes server
//! frames in wire order and forwards each to the coordinator queue. The
//! coordinator owns the [`ProtocolSession`] and writes status frames through
//! it in the order it decides.
//!
//! Connection loss, read errors and malformed frames all end the reader
//! with exactly one `Disconnected` event. The session never reconnects by
//! itself.

use crate::error::{Error, Result};
use crate::playback::events::{CoordinatorEvent, EventSender};
use slimgap_common::protocol::{ClientFrame, Helo, ServerFrame, Stat, SLIMPROTO_PORT};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Player model reported in `HELO`
pub const MODEL_NAME: &str = "slimgap";

/// SqueezePlay device id; servers treat it as a capability-driven software player
pub const DEVICE_ID: u8 = 12;

/// Codecs the decoder stack can handle, in server capability syntax
pub const SUPPORTED_CODECS: &[&str] = &["flc", "ogg", "aac", "alc", "mp3", "pcm"];

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Capability string advertised in `HELO`
///
/// `AccuratePlayPoints` tells the server that track start and decode-ready
/// reports are tied to the actual output position, which is what lets it
/// queue the next track for gapless playback.
pub fn capabilities(max_sample_rate: u32, build_id: &str) -> String {
    let mut parts = vec![
        format!("Model={}", MODEL_NAME),
        format!("ModelName={}", MODEL_NAME),
        "AccuratePlayPoints=1".to_string(),
        "HasDigitalOut=1".to_string(),
        format!("Firmware={}", build_id),
        format!("MaxSampleRate={}", max_sample_rate),
    ];
    parts.extend(SUPPORTED_CODECS.iter().map(|c| c.to_string()));
    parts.join(",")
}

/// Build the handshake frame for this player
pub fn helo(mac: [u8; 6], max_sample_rate: u32, build_id: &str) -> Helo {
    Helo {
        device_id: DEVICE_ID,
        revision: 0,
        mac,
        uuid: [0u8; 16],
        wlan_channels: 0,
        bytes_received: 0,
        language: *b"EN",
        capabilities: capabilities(max_sample_rate, build_id),
    }
}

/// Resolve `server` (host or host:port) to a control address
pub async fn resolve_server(server: &str) -> Result<SocketAddr> {
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, SLIMPROTO_PORT)
    };
    let addr = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| Error::Session(format!("Cannot resolve {}: {}", target, e)))?
        .next()
        .ok_or_else(|| Error::Session(format!("No address for {}", target)))?;
    Ok(addr)
}

/// Live control connection
pub struct ProtocolSession {
    writer: BoxedWriter,
    reader: JoinHandle<()>,
    peer_ip: IpAddr,
    frames_sent: u64,
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("peer_ip", &self.peer_ip)
            .field("frames_sent", &self.frames_sent)
            .finish()
    }
}

impl ProtocolSession {
    /// Connect over TCP and perform the handshake
    pub async fn connect(addr: SocketAddr, helo: Helo, events: EventSender) -> Result<Self> {
        info!("Connecting to music server at {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Session(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        Self::establish(reader, writer, addr.ip(), helo, events).await
    }

    /// Handshake over an already-open byte stream
    ///
    /// Sends `HELO` and starts the reader task.
    pub async fn establish<R, W>(
        reader: R,
        writer: W,
        peer_ip: IpAddr,
        helo: Helo,
        events: EventSender,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = Self {
            writer: Box::new(writer),
            reader: tokio::spawn(read_frames(reader, events)),
            peer_ip,
            frames_sent: 0,
        };

        debug!("Sending HELO: {}", helo.capabilities);
        session.send(&ClientFrame::Helo(helo)).await?;
        info!("Session established with {}", peer_ip);
        Ok(session)
    }

    /// Address of the music server (default stream server)
    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Write one frame
    pub async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        let bytes = frame.encode();
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| Error::Session(format!("Write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Session(format!("Flush failed: {}", e)))?;
        self.frames_sent += 1;
        Ok(())
    }

    pub async fn send_stat(&mut self, stat: Stat) -> Result<()> {
        trace!("STAT {}", stat.code);
        self.send(&ClientFrame::Stat(stat)).await
    }

    /// Say goodbye and close the write side
    pub async fn bye(&mut self) -> Result<()> {
        info!("Sending BYE!");
        self.send(&ClientFrame::Bye).await?;
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Reader task: decode frames in order until the connection ends
async fn read_frames<R>(mut reader: R, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let length = match reader.read_u16().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "connection closed by server".to_string();
            }
            Err(e) => break format!("read error: {}", e),
        };

        let mut body = vec![0u8; length];
        if let Err(e) = reader.read_exact(&mut body).await {
            break format!("truncated frame ({} bytes declared): {}", length, e);
        }

        match ServerFrame::decode_body(&body) {
            Ok(frame) => {
                trace!("Received {}", String::from_utf8_lossy(&frame.opcode()));
                if events.send(CoordinatorEvent::Frame(frame)).is_err() {
                    debug!("Coordinator gone, session reader exiting");
                    return;
                }
            }
            Err(e) => break format!("malformed frame: {}", e),
        }
    };

    warn!("Control connection lost: {}", reason);
    let _ = events.send(CoordinatorEvent::Disconnected { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::events::event_channel;
    use slimgap_common::protocol::{Strm, StrmCommand};

    #[test]
    fn test_capabilities_list_codecs_and_rate() {
        let caps = capabilities(96_000, "abc123");
        assert!(caps.starts_with("Model=slimgap,"));
        assert!(caps.contains("MaxSampleRate=96000"));
        assert!(caps.contains("Firmware=abc123"));
        assert!(caps.ends_with("flc,ogg,aac,alc,mp3,pcm"));
    }

    #[tokio::test]
    async fn test_resolve_server_adds_default_port() {
        let addr = resolve_server("127.0.0.1").await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], SLIMPROTO_PORT)));

        let addr = resolve_server("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order_then_disconnect() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let (tx, mut rx) = event_channel();

        let _session = ProtocolSession::establish(
            read_half,
            write_half,
            "127.0.0.1".parse().unwrap(),
            helo([0; 6], 44_100, "test"),
            tx,
        )
        .await
        .unwrap();

        // HELO arrives first
        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..4], b"HELO");
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).await.unwrap();

        let pause = ServerFrame::Strm(Strm::control(StrmCommand::Pause, 0));
        let unpause = ServerFrame::Strm(Strm::control(StrmCommand::Unpause, 0));
        server.write_all(&pause.encode().unwrap()).await.unwrap();
        server.write_all(&unpause.encode().unwrap()).await.unwrap();
        drop(server);

        match rx.recv().await.unwrap() {
            CoordinatorEvent::Frame(frame) => assert_eq!(frame, pause),
            other => panic!("Expected frame, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            CoordinatorEvent::Frame(frame) => assert_eq!(frame, unpause),
            other => panic!("Expected frame, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_disconnects_once() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let (tx, mut rx) = event_channel();
        let _session = ProtocolSession::establish(
            read_half,
            write_half,
            "127.0.0.1".parse().unwrap(),
            helo([0; 6], 44_100, "test"),
            tx,
        )
        .await
        .unwrap();

        // A strm frame far too short for its fixed header
        server.write_all(&[0x00, 0x06, b's', b't', b'r', b'm', b's', b'1']).await.unwrap();

        match rx.recv().await.unwrap() {
            CoordinatorEvent::Disconnected { reason } => assert!(reason.contains("malformed")),
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        // Reader has exited; the queue closes once the session drops its sender
        let next = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(next, Ok(None) | Err(_)));
    }
}
