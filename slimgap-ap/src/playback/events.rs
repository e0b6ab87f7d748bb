//! Internal coordinator events
//!
//! Every concurrent activity (session reader, decoders, render path, output
//! device) reports through one unbounded queue of [`CoordinatorEvent`]s.
//! The coordinator drains it in arrival order. These events never leave
//! the process; observers see `slimgap_common::events::PlayerEvent`
//! instead.

use super::boundary::BoundaryEvent;
use crate::audio::OutputEvent;
use bytes::Bytes;
use slimgap_common::protocol::{ServerFrame, TrackId};
use tokio::sync::mpsc;

/// Sender half of the coordinator queue
pub type EventSender = mpsc::UnboundedSender<CoordinatorEvent>;

/// Receiver half of the coordinator queue
pub type EventReceiver = mpsc::UnboundedReceiver<CoordinatorEvent>;

/// Create the coordinator queue
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Frame from the music server, in wire order
    Frame(ServerFrame),

    /// Control connection gone (EOF, I/O error or malformed frame)
    Disconnected { reason: String },

    /// Progress report from a track's decoder
    Decoder { track_id: TrackId, event: DecoderEvent },

    /// Something happened at the render cursor
    Render(RenderEvent),

    /// Output device lost or regained
    Output(OutputEvent),

    /// Orderly shutdown requested
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEvent {
    /// TCP connection to the stream server established
    SourceConnected,

    /// HTTP response headers from the stream server
    Headers(Bytes),

    /// Compressed bytes received reached the autostart threshold
    ThresholdReached,

    /// Stream server closed the connection
    SourceEnded,

    /// All audio for the track is in the playback buffer
    DecodeComplete,

    /// Track abandoned; nothing more will be appended for it
    DecodeError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// A track became audible
    Boundary(BoundaryEvent),

    /// The output asked for audio and the buffer ran dry
    Starved,
}
