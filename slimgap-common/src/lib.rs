//! # slimgap Common Library
//!
//! Shared code for the slimgap player crates:
//! - SlimProto wire codec (server and client frames)
//! - Track directives decoded from start frames
//! - Observer event types (PlayerEvent) and the EventBus
//! - Bootstrap configuration file resolution
//! - Timing helpers (jiffies, PCM byte/duration conversion)

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod time;

pub use error::{Error, Result};
