//! Playback engine: buffer, boundary tracking and the coordinator

pub mod boundary;
pub mod buffer;
pub mod coordinator;
pub mod events;
pub mod position;
pub mod render;
pub mod source;
pub mod stream_decoder;

pub use boundary::{BoundaryEvent, TrackBoundaryTracker, TrackSpan};
pub use buffer::{BufferStatistics, PlaybackBuffer, DEFAULT_CAPACITY_BYTES};
pub use coordinator::{CoordinatorConfig, PlaybackCoordinator, PlayerHandle};
pub use events::{event_channel, CoordinatorEvent, DecoderEvent, EventReceiver, EventSender, RenderEvent};
pub use position::PositionReporter;
pub use render::{RenderControl, RenderCursor};
pub use source::{HttpFetcher, SourceFetcher, SourceObserver, SourceRead, StreamSource};
pub use stream_decoder::{DecoderContext, StreamDecoder};
