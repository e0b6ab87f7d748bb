//! Playback coordinator
//!
//! The single control loop. It drains the coordinator queue in arrival
//! order (server frames, decoder progress, render-time boundary crossings,
//! output device changes) and is the only owner of session state, the
//! decoders and the session writer.
//!
//! # States
//!
//! ```text
//! Idle -> AwaitingStream -> Streaming <-> Paused
//!                              |   ^
//!                              v   |
//!                           Interrupted
//! ```
//!
//! # Track changes
//!
//! A `strm s` while audio is streaming is either gapless or a hard replace:
//!
//! - **Gapless**: the current decoder is finished (or the directive says
//!   `Continue`). A second decoder starts with `mark_boundary`, waits for
//!   its predecessor to exit, then records its boundary at `write_offset`.
//!   Nothing is flushed.
//! - **Hard replace**: every decoder is cancelled and joined, the buffer is
//!   flushed, and the new track starts a fresh span at offset 0.
//!
//! Track start (`STMs`) is reported when the render path crosses into the
//! track, never when its audio is queued.

use super::boundary::{BoundaryEvent, TrackBoundaryTracker};
use super::buffer::PlaybackBuffer;
use super::events::{CoordinatorEvent, DecoderEvent, EventReceiver, EventSender, RenderEvent};
use super::position::PositionReporter;
use super::render::RenderControl;
use super::source::SourceFetcher;
use super::stream_decoder::{DecoderContext, StreamDecoder};
use crate::audio::{OutputEvent, OutputFormat};
use crate::error::Result;
use crate::session::ProtocolSession;
use slimgap_common::events::{EventBus, PlayerEvent, PlayerStatus, SessionState};
use slimgap_common::protocol::{
    AutostartMode, ClientFrame, ServerFrame, Stat, StatusBody, StatusCode, Strm, StrmCommand,
    TrackDirective, TrackId,
};
use slimgap_common::time::{jiffies_since, now};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Observer events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// `DSCO` reason: stream closed normally
const DSCO_CLOSED: u8 = 0;

/// Started tracks remembered between flushes
const MAX_TRACKED: usize = 16;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub format: OutputFormat,
    /// Period of `PositionUpdated` events while playing
    pub position_interval: Duration,
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            position_interval: Duration::from_millis(500),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Read-only view of the player for UI layers
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    status: watch::Receiver<PlayerStatus>,
    bus: EventBus,
    position: PositionReporter,
    events: EventSender,
}

impl PlayerHandle {
    /// Latest published status snapshot
    pub fn status(&self) -> PlayerStatus {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<PlayerStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.bus.subscribe()
    }

    /// Live position in the audible track
    pub fn position(&self) -> Duration {
        self.position.position_in_current_track()
    }

    /// Ask the coordinator to say goodbye and stop
    pub fn shutdown(&self) {
        let _ = self.events.send(CoordinatorEvent::Shutdown);
    }
}

/// A decoder plus what the coordinator knows about it
#[derive(Debug)]
struct ActiveDecoder {
    decoder: StreamDecoder,
    complete: bool,
    failed: bool,
}

impl ActiveDecoder {
    fn finished(&self) -> bool {
        self.complete || self.failed
    }
}

pub struct PlaybackCoordinator {
    session: ProtocolSession,
    events_tx: EventSender,
    events_rx: EventReceiver,
    buffer: Arc<PlaybackBuffer>,
    tracker: Arc<TrackBoundaryTracker>,
    control: Arc<RenderControl>,
    position: PositionReporter,
    fetcher: Arc<dyn SourceFetcher>,
    config: CoordinatorConfig,

    /// Oldest first; at most a finishing predecessor and its successor
    decoders: VecDeque<ActiveDecoder>,
    /// Tracks started since the last flush; render events for anything else are stale
    tracks: VecDeque<TrackId>,
    state: SessionState,
    resume_state: Option<SessionState>,
    current_track: Option<TrackId>,
    /// Current track has reached the output since the last flush
    audible: bool,
    /// `Autoplay` track waiting for its threshold before output starts
    pending_autostart: Option<TrackId>,
    /// `STMd` sent and no directive since
    awaiting_directive: bool,
    drained_reported: bool,

    bus: EventBus,
    status_tx: watch::Sender<PlayerStatus>,
    epoch: Instant,
    /// Echoed back in every STAT
    server_timestamp: u32,
}

impl PlaybackCoordinator {
    pub fn new(
        session: ProtocolSession,
        events: (EventSender, EventReceiver),
        buffer: Arc<PlaybackBuffer>,
        tracker: Arc<TrackBoundaryTracker>,
        control: Arc<RenderControl>,
        fetcher: Arc<dyn SourceFetcher>,
        config: CoordinatorConfig,
    ) -> Self {
        let (events_tx, events_rx) = events;
        let position = PositionReporter::new(Arc::clone(&buffer), Arc::clone(&tracker), config.format);
        let (status_tx, _) = watch::channel(PlayerStatus::default());
        let bus = EventBus::new(config.event_capacity);

        Self {
            session,
            events_tx,
            events_rx,
            buffer,
            tracker,
            control,
            position,
            fetcher,
            config,
            decoders: VecDeque::new(),
            tracks: VecDeque::new(),
            state: SessionState::Idle,
            resume_state: None,
            current_track: None,
            audible: false,
            pending_autostart: None,
            awaiting_directive: false,
            drained_reported: false,
            bus,
            status_tx,
            epoch: Instant::now(),
            server_timestamp: 0,
        }
    }

    pub fn handle(&self) -> PlayerHandle {
        PlayerHandle {
            status: self.status_tx.subscribe(),
            bus: self.bus.clone(),
            position: self.position.clone(),
            events: self.events_tx.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run until shutdown or disconnect
    pub async fn run(mut self) -> Result<()> {
        info!("Playback coordinator running");
        let mut ticker = tokio::time::interval(self.config.position_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(CoordinatorEvent::Shutdown) => {
                        self.shutdown().await;
                        break;
                    }
                    Some(CoordinatorEvent::Disconnected { reason }) => {
                        self.on_disconnected(reason).await;
                        break;
                    }
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.publish_position(),
            }
        }

        info!("Playback coordinator stopped");
        Ok(())
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Frame(frame) => self.on_frame(frame).await,
            CoordinatorEvent::Decoder { track_id, event } => self.on_decoder_event(track_id, event).await,
            CoordinatorEvent::Render(RenderEvent::Boundary(boundary)) => self.on_boundary(boundary).await,
            CoordinatorEvent::Render(RenderEvent::Starved) => self.on_starved().await,
            CoordinatorEvent::Output(event) => self.on_output_event(event),
            // Handled by the run loop
            CoordinatorEvent::Disconnected { .. } | CoordinatorEvent::Shutdown => {}
        }
    }

    async fn on_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Strm(strm) => self.on_strm(strm).await,
            ServerFrame::Audg(audg) => {
                let gain = audg.gain();
                debug!("Server volume: {:.3}", gain);
                self.control.set_gain(gain);
            }
            ServerFrame::Aude(aude) => {
                debug!("Output enable: spdif={}, dac={}", aude.spdif_enable, aude.dac_enable);
            }
            ServerFrame::Unknown(frame) => {
                debug!(
                    "Ignoring {} ({} bytes)",
                    String::from_utf8_lossy(&frame.opcode()),
                    frame.payload().len()
                );
            }
        }
    }

    async fn on_strm(&mut self, strm: Strm) {
        match strm.command {
            StrmCommand::Start => match TrackDirective::from_strm(&strm) {
                Ok(directive) => self.start_track(directive).await,
                Err(e) => {
                    warn!("Rejecting start directive: {}", e);
                    self.send_stat(StatusCode::NotSupported).await;
                }
            },
            StrmCommand::Pause => {
                self.control.pause();
                self.transition_playing(SessionState::Paused);
                self.send_stat(StatusCode::Paused).await;
            }
            StrmCommand::Unpause => {
                self.pending_autostart = None;
                self.control.resume();
                self.transition_playing(SessionState::Streaming);
                self.send_stat(StatusCode::Resumed).await;
            }
            StrmCommand::Stop => {
                info!("Stop requested");
                self.stop_decoders().await;
                self.flush_buffer();
                self.set_state(SessionState::Idle);
                self.send_stat(StatusCode::Flushed).await;
            }
            StrmCommand::Flush => {
                info!("Flush requested");
                self.stop_decoders().await;
                self.flush_buffer();
                self.set_state(SessionState::AwaitingStream);
                self.send_stat(StatusCode::Flushed).await;
            }
            StrmCommand::Status => {
                // Replay gain field carries the server timestamp for `t`
                self.server_timestamp = strm.replay_gain;
                let code = if self.drained_after_last_decode() {
                    StatusCode::Underrun
                } else {
                    StatusCode::Timer
                };
                self.send_stat(code).await;
            }
            StrmCommand::SkipAhead => {
                // Replay gain field carries the interval in ms for `a`
                let bytes = self.config.format.millis_to_bytes(strm.replay_gain as u64);
                debug!("Skip ahead {}ms ({} bytes)", strm.replay_gain, bytes);
                self.control.request_skip(bytes);
            }
            StrmCommand::Other(byte) => {
                debug!("Ignoring strm command {:?}", byte as char);
            }
        }
    }

    /// Act on a start directive: fresh start, gapless append or hard replace
    async fn start_track(&mut self, directive: TrackDirective) {
        let track_id = directive.track_id;
        self.awaiting_directive = false;
        self.drained_reported = false;

        let streaming = matches!(
            self.effective_state(),
            SessionState::Streaming | SessionState::Paused
        );
        let current_finished = self.decoders.back().map_or(true, |d| d.finished());
        let gapless = streaming && (current_finished || directive.autostart == AutostartMode::Continue);

        if gapless {
            info!("Gapless start of track {} ({})", track_id, directive.codec);
            // An exited decoder may still have its terminal event queued
            self.decoders.retain(|d| !d.finished());
            let predecessor = self.decoders.back().map(|d| d.decoder.exit_signal());
            let decoder = StreamDecoder::begin(directive, true, predecessor, self.decoder_context());
            self.push_decoder(track_id, decoder);
            return;
        }

        if streaming {
            info!("Hard replace with track {} ({})", track_id, directive.codec);
        } else {
            info!("Starting track {} ({})", track_id, directive.codec);
        }

        self.stop_decoders().await;
        if !self.buffer.is_empty() || self.tracker.current_span().is_some() {
            self.flush_buffer();
        }

        self.tracker.start_track(track_id, self.buffer.write_offset());
        match directive.autostart {
            AutostartMode::Autoplay => {
                self.control.pause();
                self.pending_autostart = Some(track_id);
            }
            AutostartMode::Paused | AutostartMode::Direct => self.control.pause(),
            AutostartMode::Continue => {}
        }

        let decoder = StreamDecoder::begin(directive, false, None, self.decoder_context());
        self.push_decoder(track_id, decoder);
        self.set_state(SessionState::Streaming);
    }

    fn push_decoder(&mut self, track_id: TrackId, decoder: StreamDecoder) {
        self.decoders.push_back(ActiveDecoder {
            decoder,
            complete: false,
            failed: false,
        });
        self.tracks.push_back(track_id);
        while self.tracks.len() > MAX_TRACKED {
            self.tracks.pop_front();
        }
    }

    fn decoder_context(&self) -> DecoderContext {
        DecoderContext {
            buffer: Arc::clone(&self.buffer),
            tracker: Arc::clone(&self.tracker),
            fetcher: Arc::clone(&self.fetcher),
            events: self.events_tx.clone(),
            format: self.config.format,
        }
    }

    async fn on_decoder_event(&mut self, track_id: TrackId, event: DecoderEvent) {
        let Some(index) = self
            .decoders
            .iter()
            .position(|d| d.decoder.track_id() == track_id)
        else {
            trace!("Dropping {:?} from retired decoder {}", event, track_id);
            return;
        };

        match event {
            DecoderEvent::SourceConnected => self.send_stat(StatusCode::Connected).await,
            DecoderEvent::Headers(headers) => {
                if let Err(e) = self.session.send(&ClientFrame::Resp(headers)).await {
                    warn!("Failed to forward stream headers: {}", e);
                }
            }
            DecoderEvent::ThresholdReached => {
                if self.pending_autostart == Some(track_id) {
                    self.autostart_output();
                }
            }
            DecoderEvent::SourceEnded => {
                if let Err(e) = self.session.send(&ClientFrame::Dsco(DSCO_CLOSED)).await {
                    warn!("Failed to send DSCO: {}", e);
                }
            }
            DecoderEvent::DecodeComplete => {
                self.decoders[index].complete = true;
                if self.pending_autostart == Some(track_id) {
                    self.autostart_output();
                }
                self.awaiting_directive = true;
                self.send_stat(StatusCode::DecodeReady).await;

                // Nothing was appended and nothing is left to render
                if self.audible && self.buffer.is_empty() {
                    self.report_drained().await;
                }
            }
            DecoderEvent::DecodeError(message) => {
                warn!("Track {} failed: {}", track_id, message);
                self.decoders[index].failed = true;
                if self.pending_autostart == Some(track_id) {
                    self.pending_autostart = None;
                }
                self.send_stat(StatusCode::NotSupported).await;
                self.bus.emit_lossy(PlayerEvent::DecodeFailed {
                    track_id,
                    message,
                    timestamp: now(),
                });

                let decoding = self.decoders.iter().any(|d| !d.finished());
                if self.buffer.is_empty() && !decoding {
                    self.control.pause();
                    self.set_state(SessionState::Idle);
                }
            }
        }
    }

    fn autostart_output(&mut self) {
        if let Some(track_id) = self.pending_autostart.take() {
            debug!("Autostart threshold met for {}, starting output", track_id);
            self.control.resume();
        }
    }

    async fn on_boundary(&mut self, event: BoundaryEvent) {
        let track_id = event.track_id();
        if !self.tracks.contains(&track_id) {
            trace!("Ignoring stale boundary event for {}", track_id);
            return;
        }

        match event {
            BoundaryEvent::TrackStarted { .. } => info!("Track {} started", track_id),
            BoundaryEvent::BoundaryCrossed { previous, offset, .. } => {
                info!("Gapless transition {:?} -> {} at offset {}", previous, track_id, offset)
            }
        }

        self.current_track = Some(track_id);
        self.audible = true;
        self.send_stat(StatusCode::TrackStarted).await;
        self.bus.emit_lossy(PlayerEvent::TrackStarted {
            track_id,
            timestamp: now(),
        });
        self.refresh_status();
    }

    async fn on_starved(&mut self) {
        if !self.audible {
            return;
        }

        if self.decoders.iter().any(|d| !d.finished()) {
            warn!("Output underrun while decoding");
            self.send_stat(StatusCode::OutputUnderrun).await;
        } else {
            self.report_drained().await;
        }
    }

    async fn report_drained(&mut self) {
        if self.drained_reported {
            return;
        }
        self.drained_reported = true;
        info!("Playback buffer drained after final decode");
        self.send_stat(StatusCode::Underrun).await;
    }

    /// `STMd` sent, nothing new asked for, and nothing left to play
    fn drained_after_last_decode(&self) -> bool {
        self.awaiting_directive
            && self.buffer.is_empty()
            && self.decoders.iter().all(|d| d.finished())
    }

    fn on_output_event(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::Interrupted { reason } => {
                warn!("Output interrupted: {}", reason);
                if matches!(self.state, SessionState::Streaming | SessionState::Paused) {
                    self.resume_state = Some(self.state);
                    self.set_state(SessionState::Interrupted);
                }
            }
            OutputEvent::Restored => {
                if self.state == SessionState::Interrupted {
                    let previous = self.resume_state.take().unwrap_or(SessionState::Streaming);
                    info!("Output restored, returning to {}", previous);
                    self.set_state(previous);
                }
            }
        }
    }

    async fn on_disconnected(&mut self, reason: String) {
        warn!("Session ended: {}", reason);
        self.stop_decoders().await;
        self.control.pause();
        self.flush_buffer();
        self.set_state(SessionState::Idle);
        self.bus.emit_lossy(PlayerEvent::Disconnected {
            reason,
            timestamp: now(),
        });
    }

    async fn shutdown(&mut self) {
        info!("Shutting down playback");
        self.stop_decoders().await;
        self.control.pause();
        if let Err(e) = self.session.bye().await {
            warn!("Failed to send BYE!: {}", e);
        }
        self.set_state(SessionState::Idle);
    }

    /// Cancel every decoder and wait for each to retire
    async fn stop_decoders(&mut self) {
        for active in &self.decoders {
            active.decoder.cancel();
        }
        while let Some(mut active) = self.decoders.pop_front() {
            active.decoder.join().await;
        }
        self.pending_autostart = None;
    }

    /// Discard buffered audio and every span; position restarts at 0
    fn flush_buffer(&mut self) {
        let tracker = Arc::clone(&self.tracker);
        self.buffer.flush_then(|| tracker.reset());
        self.control.clear_skip();
        self.tracks.clear();
        self.current_track = None;
        self.audible = false;
        self.awaiting_directive = false;
        self.drained_reported = false;
        self.refresh_status();
    }

    /// State ignoring an output interruption
    fn effective_state(&self) -> SessionState {
        match self.state {
            SessionState::Interrupted => self.resume_state.unwrap_or(SessionState::Streaming),
            state => state,
        }
    }

    /// Pause/unpause target: only moves between Streaming and Paused
    fn transition_playing(&mut self, target: SessionState) {
        match self.state {
            SessionState::Streaming | SessionState::Paused => self.set_state(target),
            SessionState::Interrupted => self.resume_state = Some(target),
            SessionState::Idle | SessionState::AwaitingStream => {}
        }
    }

    fn set_state(&mut self, new_state: SessionState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        info!("State: {} -> {}", old_state, new_state);
        self.state = new_state;
        self.bus.emit_lossy(PlayerEvent::StateChanged {
            old_state,
            new_state,
            timestamp: now(),
        });
        self.refresh_status();
    }

    fn publish_position(&self) {
        if !self.audible || self.state != SessionState::Streaming {
            return;
        }
        if let Some((track_id, position)) = self.position.current() {
            self.bus.emit_lossy(PlayerEvent::PositionUpdated {
                track_id,
                position_ms: position.as_millis() as u64,
                timestamp: now(),
            });
        }
        self.refresh_status();
    }

    fn refresh_status(&self) {
        let position_ms = if self.audible {
            self.position.position_in_current_track().as_millis() as u64
        } else {
            0
        };
        self.status_tx.send_replace(PlayerStatus {
            state: self.state,
            track_id: self.current_track,
            position_ms,
            buffered_bytes: self.buffer.buffered(),
        });
    }

    fn status_body(&self) -> StatusBody {
        let stats = self.buffer.statistics();
        let elapsed = if self.audible {
            self.position.position_in_current_track()
        } else {
            Duration::ZERO
        };
        let bytes_received = self
            .decoders
            .back()
            .map(|d| d.decoder.bytes_received())
            .unwrap_or(0);
        let capacity = stats.capacity.min(u32::MAX as usize) as u32;
        let fullness = stats.buffered.min(u32::MAX as u64) as u32;

        // Compressed data is not buffered separately, so both buffer pairs
        // report the PCM buffer
        StatusBody {
            stream_buffer_size: capacity,
            stream_buffer_fullness: fullness,
            bytes_received,
            jiffies: jiffies_since(self.epoch),
            output_buffer_size: capacity,
            output_buffer_fullness: fullness,
            elapsed_seconds: elapsed.as_secs() as u32,
            elapsed_milliseconds: elapsed.as_millis().min(u32::MAX as u128) as u32,
            server_timestamp: self.server_timestamp,
            ..StatusBody::default()
        }
    }

    async fn send_stat(&mut self, code: StatusCode) {
        let stat = Stat::new(code, self.status_body());
        debug!("STAT {}", code);
        if let Err(e) = self.session.send_stat(stat).await {
            warn!("Failed to send STAT {}: {}", code, e);
        }
    }
}
