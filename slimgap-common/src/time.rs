//! Timestamp and byte/time conversion utilities

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since `epoch`, wrapping at `u32::MAX` like the STAT jiffies
/// field
pub fn jiffies_since(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}

/// Playback time represented by `bytes` at `bytes_per_sec`
///
/// Returns zero for a zero rate.
pub fn bytes_to_duration(bytes: u64, bytes_per_sec: u64) -> Duration {
    if bytes_per_sec == 0 {
        return Duration::ZERO;
    }
    let secs = bytes / bytes_per_sec;
    let rem = bytes % bytes_per_sec;
    Duration::from_secs(secs) + Duration::from_nanos(rem * 1_000_000_000 / bytes_per_sec)
}

/// Byte count covering `duration` at `bytes_per_sec`, rounded down to whole
/// frames of `frame_bytes`
pub fn duration_to_bytes(duration: Duration, bytes_per_sec: u64, frame_bytes: u64) -> u64 {
    let bytes = (duration.as_nanos() * bytes_per_sec as u128 / 1_000_000_000) as u64;
    if frame_bytes == 0 {
        bytes
    } else {
        bytes - bytes % frame_bytes
    }
}
