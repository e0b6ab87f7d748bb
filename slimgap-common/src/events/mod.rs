//! Observer events
//!
//! The coordinator publishes [`PlayerEvent`]s on an [`EventBus`]; UI layers
//! subscribe and never write back.

mod playback_types;

pub use playback_types::{PlayerStatus, SessionState};

use crate::protocol::TrackId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event published to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// A track became audible (first render of a fresh buffer, or a gapless
    /// boundary crossed)
    TrackStarted {
        track_id: TrackId,
        timestamp: DateTime<Utc>,
    },

    /// Periodic position within the audible track
    PositionUpdated {
        track_id: TrackId,
        position_ms: u64,
        timestamp: DateTime<Utc>,
    },

    StateChanged {
        old_state: SessionState,
        new_state: SessionState,
        timestamp: DateTime<Utc>,
    },

    /// Track could not be fetched or decoded
    DecodeFailed {
        track_id: TrackId,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Control connection lost
    Disconnected {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl PlayerEvent {
    /// Short name for logging
    pub fn event_type(&self) -> &str {
        match self {
            PlayerEvent::TrackStarted { .. } => "TrackStarted",
            PlayerEvent::PositionUpdated { .. } => "PositionUpdated",
            PlayerEvent::StateChanged { .. } => "StateChanged",
            PlayerEvent::DecodeFailed { .. } => "DecodeFailed",
            PlayerEvent::Disconnected { .. } => "Disconnected",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PlayerEvent::TrackStarted { timestamp, .. }
            | PlayerEvent::PositionUpdated { timestamp, .. }
            | PlayerEvent::StateChanged { timestamp, .. }
            | PlayerEvent::DecodeFailed { timestamp, .. }
            | PlayerEvent::Disconnected { timestamp, .. } => *timestamp,
        }
    }
}

/// Broadcast channel for [`PlayerEvent`]s
///
/// Slow subscribers lag and lose old events; publishers never block.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    ///
    /// Returns `Err` if nobody is subscribed.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PlayerEvent,
    ) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_emit_without_subscribers_fails() {
        let bus = EventBus::new(10);
        let result = bus.emit(PlayerEvent::Disconnected {
            reason: "eof".to_string(),
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let track_id = Uuid::new_v4();

        bus.emit_lossy(PlayerEvent::TrackStarted {
            track_id,
            timestamp: Utc::now(),
        });
        bus.emit_lossy(PlayerEvent::PositionUpdated {
            track_id,
            position_ms: 500,
            timestamp: Utc::now(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "TrackStarted");
        match second {
            PlayerEvent::PositionUpdated { position_ms, .. } => assert_eq!(position_ms, 500),
            other => panic!("Expected PositionUpdated, got {:?}", other),
        }
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.capacity(), 4);
    }
}
