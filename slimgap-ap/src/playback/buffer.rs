//! Continuous playback buffer
//!
//! One byte FIFO lives for the whole session. Decoders append converted
//! PCM at the write end and the render path drains the read end. Two
//! cumulative counters describe the stream:
//!
//! ```text
//!   0 ........ read_offset ............ write_offset
//!   |  rendered  |   buffered (unrendered)   |
//! ```
//!
//! Both only grow, except `flush()`, which discards everything unrendered
//! and moves both back to the same origin (0). Consecutive tracks are
//! appended back to back; nothing in the buffer separates them, the
//! boundary tracker records where one ends.
//!
//! ## Thread Safety
//!
//! The ring is split into producer and consumer halves, each behind a
//! `Mutex`. Offsets are atomics so observers never take a lock. Reads and
//! flushes both run under the consumer lock, and callers can hook work into
//! that critical section ([`read_then`](PlaybackBuffer::read_then),
//! [`flush_then`](PlaybackBuffer::flush_then)) so that boundary bookkeeping
//! can never observe a half-flushed buffer.

use crate::audio::BYTES_PER_FRAME;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Default capacity: 10 s of 44.1 kHz stereo f32
pub const DEFAULT_CAPACITY_BYTES: usize = 3_528_000;

/// Snapshot of buffer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatistics {
    pub capacity: usize,
    pub write_offset: u64,
    pub read_offset: u64,
    pub buffered: u64,
}

/// Session-wide PCM FIFO with cumulative offsets
pub struct PlaybackBuffer {
    prod: Mutex<HeapProd<u8>>,
    cons: Mutex<HeapCons<u8>>,
    capacity: usize,

    /// Decoders back off while more than this many bytes are unrendered
    high_water: usize,

    /// Cumulative bytes appended since the last flush
    ///
    /// Written only by the active decoder (one writer at a time).
    write_offset: AtomicU64,

    /// Cumulative bytes rendered since the last flush
    ///
    /// Written only under the consumer lock.
    read_offset: AtomicU64,
}

impl std::fmt::Debug for PlaybackBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackBuffer")
            .field("capacity", &self.capacity)
            .field("high_water", &self.high_water)
            .field("write_offset", &self.write_offset())
            .field("read_offset", &self.current_read_offset())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PlaybackBuffer {
    /// Create an empty buffer
    ///
    /// `high_water` defaults to the capacity minus one second of audio at
    /// 44.1 kHz (or half the capacity for small buffers).
    pub fn new(capacity: usize, high_water: Option<usize>) -> Self {
        let capacity = capacity - capacity % BYTES_PER_FRAME;
        let one_second = 44_100 * BYTES_PER_FRAME;
        let high_water = high_water.unwrap_or(if capacity > 2 * one_second {
            capacity - one_second
        } else {
            capacity / 2
        });

        debug!(
            "Creating playback buffer: capacity={} bytes, high_water={} bytes",
            capacity, high_water
        );

        let rb = HeapRb::<u8>::new(capacity);
        let (prod, cons) = rb.split();

        Self {
            prod: Mutex::new(prod),
            cons: Mutex::new(cons),
            capacity,
            high_water,
            write_offset: AtomicU64::new(0),
            read_offset: AtomicU64::new(0),
        }
    }

    /// Append as many whole frames of `pcm` as fit
    ///
    /// Returns the number of bytes taken (a multiple of the frame size, 0
    /// when full). `write_offset` advances by exactly that count.
    pub fn append(&self, pcm: &[u8]) -> usize {
        let mut prod = lock(&self.prod);

        let mut n = pcm.len().min(prod.vacant_len());
        n -= n % BYTES_PER_FRAME;
        if n == 0 {
            return 0;
        }

        let pushed = prod.push_slice(&pcm[..n]);
        let new_offset = self.write_offset.fetch_add(pushed as u64, Ordering::AcqRel) + pushed as u64;
        drop(prod);

        trace!("Appended {} bytes, write_offset={}", pushed, new_offset);
        pushed
    }

    /// Render up to `out.len()` bytes
    ///
    /// Returns the byte count read. `read_offset` advances by the same
    /// count.
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.read_then(out, |_, _| ()).0
    }

    /// Read, then run `f(bytes_read, new_read_offset)` while still holding
    /// the consumer lock
    pub fn read_then<R>(&self, out: &mut [u8], f: impl FnOnce(usize, u64) -> R) -> (usize, R) {
        let mut cons = lock(&self.cons);
        let n = cons.pop_slice(out);
        let read_offset = self.read_offset.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
        let result = f(n, read_offset);
        (n, result)
    }

    /// Drop up to `bytes` of unrendered audio as if rendered, then run `f`
    /// under the consumer lock
    pub fn discard_then<R>(&self, bytes: usize, f: impl FnOnce(usize, u64) -> R) -> (usize, R) {
        let mut cons = lock(&self.cons);
        let mut n = bytes.min(cons.occupied_len());
        n -= n % BYTES_PER_FRAME;
        let skipped = cons.skip(n);
        let read_offset = self.read_offset.fetch_add(skipped as u64, Ordering::AcqRel) + skipped as u64;
        let result = f(skipped, read_offset);
        (skipped, result)
    }

    /// Discard all unrendered bytes and reset both offsets to 0
    pub fn flush(&self) {
        self.flush_then(|| ());
    }

    /// Flush, then run `f` before releasing the render path
    ///
    /// Only valid while no decoder is appending; the coordinator joins
    /// decoders first.
    pub fn flush_then<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut cons = lock(&self.cons);
        let prod = lock(&self.prod);

        let discarded = cons.clear();
        let old_write = self.write_offset.swap(0, Ordering::AcqRel);
        let old_read = self.read_offset.swap(0, Ordering::AcqRel);
        let result = f();
        drop(prod);
        drop(cons);

        debug!(
            "Flushed playback buffer: discarded {} bytes (write_offset was {}, read_offset was {})",
            discarded, old_write, old_read
        );
        result
    }

    /// Cumulative bytes appended
    pub fn write_offset(&self) -> u64 {
        self.write_offset.load(Ordering::Acquire)
    }

    /// Cumulative bytes rendered
    pub fn current_read_offset(&self) -> u64 {
        self.read_offset.load(Ordering::Acquire)
    }

    /// Unrendered bytes
    pub fn buffered(&self) -> u64 {
        // Read first: write_offset never falls behind a later read_offset
        let read = self.current_read_offset();
        self.write_offset().saturating_sub(read)
    }

    /// True when a decoder should back off
    pub fn above_high_water(&self) -> bool {
        self.buffered() as usize > self.high_water
    }

    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn statistics(&self) -> BufferStatistics {
        let read_offset = self.current_read_offset();
        let write_offset = self.write_offset();
        BufferStatistics {
            capacity: self.capacity,
            write_offset,
            read_offset,
            buffered: write_offset.saturating_sub(read_offset),
        }
    }
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES, None)
    }
}
