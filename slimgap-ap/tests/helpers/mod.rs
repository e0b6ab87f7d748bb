//! Test helpers for slimgap-ap integration tests
//!
//! - [`TestPlayer`]: a coordinator wired to an in-memory music server
//! - [`QueueFetcher`]: serves canned streams, one per start directive
//! - [`wav_bytes`]: deterministic WAV fixtures

#![allow(dead_code)]

use bytes::Bytes;
use slimgap_ap::playback::{
    event_channel, CoordinatorConfig, EventSender, PlaybackBuffer, PlaybackCoordinator,
    PlayerHandle, RenderControl, RenderCursor, SourceFetcher, SourceObserver, SourceRead,
    StreamSource, TrackBoundaryTracker,
};
use slimgap_ap::session::{self, ProtocolSession};
use slimgap_ap::{Error, Result};
use slimgap_common::protocol::{
    ClientFrame, MediaLocator, ServerFrame, Stat, StatusCode, Strm, StrmCommand,
    CLIENT_HEADER_LEN,
};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// Output rate used throughout the tests
pub const TEST_RATE: u32 = 44_100;

/// One second of stereo f32 at [`TEST_RATE`]
pub const ONE_SECOND_BYTES: u64 = TEST_RATE as u64 * 8;

/// How long to wait for any single frame from the player
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Stereo 16-bit WAV with every sample set to `left` / `right`
pub fn wav_bytes(frames: usize, left: i16, right: i16) -> Bytes {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: TEST_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(left).unwrap();
            writer.write_sample(right).unwrap();
        }
        writer.finalize().unwrap();
    }
    Bytes::from(cursor.into_inner())
}

/// Start directive for a self-describing (WAV) PCM stream
pub fn start_wav(autostart: u8) -> ServerFrame {
    ServerFrame::Strm(Strm::start(
        b'p',
        autostart,
        9000,
        &b"GET /stream.wav HTTP/1.0\r\n\r\n"[..],
    ))
}

pub fn control(command: StrmCommand, value: u32) -> ServerFrame {
    ServerFrame::Strm(Strm::control(command, value))
}

/// Hands out queued streams in order, one per `open`
#[derive(Default)]
pub struct QueueFetcher {
    streams: Mutex<VecDeque<Bytes>>,
}

impl QueueFetcher {
    pub fn new(streams: impl IntoIterator<Item = Bytes>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams.into_iter().collect()),
        })
    }

    pub fn push(&self, stream: Bytes) {
        self.streams.lock().unwrap().push_back(stream);
    }
}

impl SourceFetcher for QueueFetcher {
    fn open(&self, _: &MediaLocator, observer: SourceObserver) -> Result<Box<dyn StreamSource>> {
        let data = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Fetch("no stream queued".to_string()))?;
        observer.connected();
        Ok(Box::new(MemorySource {
            data,
            observer: Some(observer),
        }))
    }
}

struct MemorySource {
    data: Bytes,
    observer: Option<SourceObserver>,
}

impl StreamSource for MemorySource {
    fn read_chunk(&mut self) -> Result<SourceRead> {
        if self.data.is_empty() {
            if let Some(observer) = self.observer.take() {
                observer.ended();
            }
            return Ok(SourceRead::Exhausted);
        }
        let n = self.data.len().min(8 * 1024);
        Ok(SourceRead::Data(self.data.split_to(n)))
    }
}

/// A running coordinator with the far end of its control connection
pub struct TestPlayer {
    pub handle: PlayerHandle,
    pub buffer: Arc<PlaybackBuffer>,
    pub tracker: Arc<TrackBoundaryTracker>,
    pub control: Arc<RenderControl>,
    pub events: EventSender,
    pub run: JoinHandle<Result<()>>,
    cursor: RenderCursor,
    server_rx: ReadHalf<DuplexStream>,
    server_tx: WriteHalf<DuplexStream>,
    /// Every STAT code seen so far, in arrival order
    seen: Vec<StatusCode>,
}

impl TestPlayer {
    /// Connect a coordinator to an in-memory server and consume its HELO
    pub async fn start(fetcher: Arc<dyn SourceFetcher>) -> Self {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, server_tx) = tokio::io::split(server);
        let (events_tx, events_rx) = event_channel();

        let session = ProtocolSession::establish(
            client_rx,
            client_tx,
            "127.0.0.1".parse().unwrap(),
            session::helo([0x02, 0, 0, 0, 0, 0x01], TEST_RATE, "test"),
            events_tx.clone(),
        )
        .await
        .unwrap();

        let buffer = Arc::new(PlaybackBuffer::new(4_000_000, None));
        let tracker = Arc::new(TrackBoundaryTracker::new());
        let control = Arc::new(RenderControl::new());
        let cursor = RenderCursor::new(
            Arc::clone(&buffer),
            Arc::clone(&tracker),
            Arc::clone(&control),
            events_tx.clone(),
        );

        let coordinator = PlaybackCoordinator::new(
            session,
            (events_tx.clone(), events_rx),
            Arc::clone(&buffer),
            Arc::clone(&tracker),
            Arc::clone(&control),
            fetcher,
            CoordinatorConfig {
                position_interval: Duration::from_millis(50),
                ..CoordinatorConfig::default()
            },
        );
        let handle = coordinator.handle();
        let run = tokio::spawn(coordinator.run());

        let mut player = Self {
            handle,
            buffer,
            tracker,
            control,
            events: events_tx,
            run,
            cursor,
            server_rx,
            server_tx,
            seen: Vec::new(),
        };

        match player.next_frame().await {
            ClientFrame::Helo(helo) => assert!(helo.capabilities.starts_with("Model=slimgap")),
            other => panic!("Expected HELO, got {:?}", other),
        }
        player
    }

    /// Send a frame from the server
    pub async fn send(&mut self, frame: ServerFrame) {
        self.server_tx.write_all(&frame.encode().unwrap()).await.unwrap();
    }

    /// Next frame written by the player
    pub async fn next_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(FRAME_TIMEOUT, async {
            let mut header = [0u8; CLIENT_HEADER_LEN];
            self.server_rx.read_exact(&mut header).await?;
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let mut frame = header.to_vec();
            frame.resize(CLIENT_HEADER_LEN + len, 0);
            self.server_rx.read_exact(&mut frame[CLIENT_HEADER_LEN..]).await?;
            Ok::<_, std::io::Error>(frame)
        })
        .await
        .expect("timed out waiting for a frame from the player")
        .map(|frame| ClientFrame::decode(&frame).unwrap())
        .unwrap()
    }

    /// Read frames until a STAT with `code` arrives
    pub async fn wait_for_stat(&mut self, code: StatusCode) -> Stat {
        loop {
            if let ClientFrame::Stat(stat) = self.next_frame().await {
                self.seen.push(stat.code);
                if stat.code == code {
                    return stat;
                }
            }
        }
    }

    /// Read frames until one with `opcode` arrives
    pub async fn wait_for_frame(&mut self, opcode: [u8; 4]) -> ClientFrame {
        loop {
            let frame = self.next_frame().await;
            if let ClientFrame::Stat(stat) = &frame {
                self.seen.push(stat.code);
            }
            if frame.opcode() == opcode {
                return frame;
            }
        }
    }

    pub fn seen(&self) -> &[StatusCode] {
        &self.seen
    }

    /// Render `frames` stereo frames as the output device would
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![f32::NAN; frames * 2];
        let samples = self.cursor.render(&mut out);
        out.truncate(samples);
        out
    }

    /// Close the server side of the control connection
    pub fn disconnect(self) -> (PlayerHandle, JoinHandle<Result<()>>) {
        (self.handle, self.run)
    }
}

/// Wait for the first observer event matching `pred`
pub async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<slimgap_common::events::PlayerEvent>,
    mut pred: F,
) -> slimgap_common::events::PlayerEvent
where
    F: FnMut(&slimgap_common::events::PlayerEvent) -> bool,
{
    tokio::time::timeout(FRAME_TIMEOUT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for player event")
}
