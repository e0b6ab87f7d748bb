//! Compressed stream sources
//!
//! A [`SourceFetcher`] opens a [`StreamSource`] for a directive's media
//! locator. Sources are polled, not awaited: `NotYet` means no bytes are
//! available right now, `Exhausted` means the server closed the stream and
//! nothing more will arrive. The two must never be confused, since only
//! `Exhausted` lets a decoder report completion.
//!
//! [`HttpFetcher`] is the production fetcher. It sends the request the music
//! server supplied, verbatim, to the stream server and hands the body to the
//! decoder through a bounded channel. Connection progress (connected,
//! response headers, end of stream) is reported through a
//! [`SourceObserver`].

use super::events::{CoordinatorEvent, DecoderEvent, EventSender};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use slimgap_common::protocol::{MediaLocator, TrackId};
use std::io::{self, Read};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Largest HTTP response header accepted from a stream server
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Socket read size
const READ_CHUNK: usize = 16 * 1024;

/// Chunks buffered between the socket task and the decoder
const CHANNEL_DEPTH: usize = 64;

/// How long a blocked reader sleeps between polls
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Result of polling a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRead {
    Data(Bytes),
    /// Nothing available yet; poll again
    NotYet,
    /// End of data, nothing more will arrive
    Exhausted,
}

/// Forward-only compressed byte stream
pub trait StreamSource: Send {
    fn read_chunk(&mut self) -> Result<SourceRead>;
}

/// Opens sources for media locators
pub trait SourceFetcher: Send + Sync {
    /// Begin fetching `locator`
    ///
    /// Called from a decoder thread. Connection failures may surface either
    /// here or as an error from the first `read_chunk`.
    fn open(&self, locator: &MediaLocator, observer: SourceObserver) -> Result<Box<dyn StreamSource>>;
}

/// Reports source progress to the coordinator on behalf of one track
#[derive(Debug, Clone)]
pub struct SourceObserver {
    track_id: TrackId,
    events: EventSender,
}

impl SourceObserver {
    pub fn new(track_id: TrackId, events: EventSender) -> Self {
        Self { track_id, events }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn connected(&self) {
        self.send(DecoderEvent::SourceConnected);
    }

    pub fn headers(&self, headers: Bytes) {
        self.send(DecoderEvent::Headers(headers));
    }

    pub fn ended(&self) {
        self.send(DecoderEvent::SourceEnded);
    }

    pub(crate) fn send(&self, event: DecoderEvent) {
        let _ = self.events.send(CoordinatorEvent::Decoder {
            track_id: self.track_id,
            event,
        });
    }
}

/// Fetches streams over plain HTTP/TCP
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    runtime: Handle,
    /// Address of the control server, used when a locator carries no IP
    control_ip: IpAddr,
}

impl HttpFetcher {
    pub fn new(runtime: Handle, control_ip: IpAddr) -> Self {
        Self {
            runtime,
            control_ip,
        }
    }
}

impl SourceFetcher for HttpFetcher {
    fn open(&self, locator: &MediaLocator, observer: SourceObserver) -> Result<Box<dyn StreamSource>> {
        let addr = locator.resolve(self.control_ip);
        let request = Bytes::from(locator.request.clone().into_bytes());
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let completed = Arc::new(AtomicBool::new(false));

        debug!("Fetching track {} from {}", observer.track_id(), addr);
        let fetch_completed = Arc::clone(&completed);
        self.runtime.spawn(async move {
            if let Err(e) = fetch(addr, request, &observer, &tx, &fetch_completed).await {
                warn!("Stream fetch from {} failed: {}", addr, e);
                let message = match e {
                    Error::Fetch(message) => message,
                    other => other.to_string(),
                };
                let _ = tx.send(Err(message)).await;
            }
        });

        Ok(Box::new(ChannelSource::new(rx, completed)))
    }
}

/// Socket side of an HTTP fetch
async fn fetch(
    addr: std::net::SocketAddr,
    request: Bytes,
    observer: &SourceObserver,
    tx: &mpsc::Sender<std::result::Result<Bytes, String>>,
    completed: &AtomicBool,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::Fetch(format!("connect to {}: {}", addr, e)))?;
    observer.connected();

    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::Fetch(format!("send request: {}", e)))?;

    // Response header, then whatever body bytes arrived with it
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::Fetch(format!(
                "response header exceeds {} bytes",
                MAX_HEADER_BYTES
            )));
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| Error::Fetch(format!("read response header: {}", e)))?;
        if n == 0 {
            return Err(Error::Fetch("connection closed before response header".to_string()));
        }
    };

    let headers = buf.split_to(header_end).freeze();
    trace!("Stream response header: {:?}", String::from_utf8_lossy(&headers));
    observer.headers(headers);

    if !buf.is_empty() && tx.send(Ok(buf.split().freeze())).await.is_err() {
        return Ok(());
    }

    let mut received = 0u64;
    loop {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        let n = stream
            .read_buf(&mut chunk)
            .await
            .map_err(|e| Error::Fetch(format!("read stream body: {}", e)))?;
        if n == 0 {
            debug!("Stream server closed connection after {} body bytes", received);
            completed.store(true, Ordering::Release);
            observer.ended();
            return Ok(());
        }
        received += n as u64;
        if tx.send(Ok(chunk.freeze())).await.is_err() {
            // Decoder gone (cancelled)
            trace!("Stream receiver dropped, abandoning fetch from {}", addr);
            return Ok(());
        }
    }
}

/// Index just past the blank line ending an HTTP header
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Decoder side of an [`HttpFetcher`] stream
///
/// The sender dropping is only a clean end of stream when the fetch task
/// set `completed` first. Otherwise the task died (panic or abort).
struct ChannelSource {
    rx: mpsc::Receiver<std::result::Result<Bytes, String>>,
    completed: Arc<AtomicBool>,
}

impl ChannelSource {
    fn new(rx: mpsc::Receiver<std::result::Result<Bytes, String>>, completed: Arc<AtomicBool>) -> Self {
        Self { rx, completed }
    }
}

impl StreamSource for ChannelSource {
    fn read_chunk(&mut self) -> Result<SourceRead> {
        match self.rx.try_recv() {
            Ok(Ok(bytes)) => Ok(SourceRead::Data(bytes)),
            Ok(Err(message)) => Err(Error::Fetch(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(SourceRead::NotYet),
            Err(mpsc::error::TryRecvError::Disconnected) if self.completed.load(Ordering::Acquire) => {
                Ok(SourceRead::Exhausted)
            }
            Err(mpsc::error::TryRecvError::Disconnected) => Err(Error::Fetch(
                "stream fetch ended before the server closed the stream".to_string(),
            )),
        }
    }
}

/// Blocking [`Read`] adapter over a polled source
///
/// Counts bytes received and reports `ThresholdReached` once the autostart
/// threshold is crossed. `read` returns `Ok(0)` at end of data or after
/// cancellation.
pub struct SourceReader {
    source: Mutex<Box<dyn StreamSource>>,
    pending: Bytes,
    received: Arc<AtomicU64>,
    threshold: u64,
    threshold_reported: bool,
    observer: SourceObserver,
    cancel: Arc<AtomicBool>,
}

impl SourceReader {
    pub fn new(
        source: Box<dyn StreamSource>,
        observer: SourceObserver,
        threshold: u64,
        received: Arc<AtomicU64>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source: Mutex::new(source),
            pending: Bytes::new(),
            received,
            threshold,
            threshold_reported: false,
            observer,
            cancel,
        }
    }

    fn count(&mut self, n: usize) {
        let total = self.received.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        if !self.threshold_reported && total >= self.threshold {
            self.threshold_reported = true;
            debug!("Autostart threshold reached: {} bytes received", total);
            self.observer.send(DecoderEvent::ThresholdReached);
        }
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            if self.cancel.load(Ordering::Acquire) {
                return Ok(0);
            }
            let next = self
                .source
                .get_mut()
                .unwrap_or_else(|p| p.into_inner())
                .read_chunk()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            match next {
                SourceRead::Data(bytes) => {
                    self.count(bytes.len());
                    self.pending = bytes;
                }
                SourceRead::NotYet => std::thread::sleep(POLL_INTERVAL),
                SourceRead::Exhausted => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        let _ = self.pending.split_to(n);
        Ok(n)
    }
}
