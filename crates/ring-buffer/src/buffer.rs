//! Bounded Ring Buffer Implementation

use crate::Frame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Default buffer capacity (10,000 frames, ~2 s of a saturated 500 kbit/s bus)
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default trailing window for `rate()`
const DEFAULT_RATE_WINDOW_SECS: u64 = 10;

/// Returned by [`RingBuffer::push`] when the buffer is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ingestion buffer full ({capacity} frames)")]
pub struct BufferFull {
    pub capacity: usize,
}

/// Ingestion buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBufferConfig {
    /// Maximum number of frames held
    pub capacity: usize,
    /// Trailing window used for the frames/sec figure
    pub rate_window_secs: u64,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            rate_window_secs: DEFAULT_RATE_WINDOW_SECS,
        }
    }
}

/// Per-second arrival counts over a trailing window
struct RateWindow {
    origin: Instant,
    window_secs: u64,
    /// (second index since origin, frames accepted in that second)
    buckets: VecDeque<(u64, u64)>,
}

impl RateWindow {
    fn new(window_secs: u64) -> Self {
        Self {
            origin: Instant::now(),
            window_secs: window_secs.max(1),
            buckets: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant) {
        let second = now.saturating_duration_since(self.origin).as_secs();
        match self.buckets.back_mut() {
            Some((s, count)) if *s == second => *count += 1,
            _ => self.buckets.push_back((second, 1)),
        }
        self.prune(second);
    }

    fn prune(&mut self, current_second: u64) {
        let oldest = current_second.saturating_sub(self.window_secs - 1);
        while matches!(self.buckets.front(), Some((s, _)) if *s < oldest) {
            self.buckets.pop_front();
        }
    }

    fn rate(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.origin);
        let second = elapsed.as_secs();
        let oldest = second.saturating_sub(self.window_secs - 1);
        let count: u64 = self
            .buckets
            .iter()
            .filter(|(s, _)| *s >= oldest)
            .map(|(_, c)| c)
            .sum();

        // Before a full window has elapsed, average over what we have seen
        let span = elapsed
            .min(Duration::from_secs(self.window_secs))
            .as_secs_f64()
            .max(1.0);
        count as f64 / span
    }
}

struct Inner {
    frames: VecDeque<Frame>,
    rate: RateWindow,
}

/// Bounded FIFO buffer of raw frames.
///
/// `push` never blocks and never overwrites: once `occupancy == capacity`
/// every further push is rejected and counted. All accessors take `&self`
/// so one handle can be shared between the capture thread and the router.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Mirror of `frames.len()`, readable without taking the lock
    occupancy: AtomicUsize,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl RingBuffer {
    /// Create a new ring buffer with given capacity
    pub fn new(capacity: usize) -> Self {
        Self::from_config(&RingBufferConfig {
            capacity,
            ..Default::default()
        })
    }

    /// Create a buffer with default capacity (10,000 frames)
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn from_config(config: &RingBufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        info!("Creating ingestion buffer: capacity={} frames", capacity);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                rate: RateWindow::new(config.rate_window_secs),
            }),
            capacity,
            occupancy: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a frame, or reject it if the buffer is full
    pub fn push(&self, frame: Frame) -> Result<(), BufferFull> {
        let mut inner = self.lock();

        if inner.frames.len() >= self.capacity {
            drop(inner);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                warn!(
                    "Ingestion buffer full ({} frames), {} frames dropped so far",
                    self.capacity, dropped
                );
            }
            return Err(BufferFull {
                capacity: self.capacity,
            });
        }

        inner.frames.push_back(frame);
        inner.rate.record(Instant::now());
        self.occupancy.store(inner.frames.len(), Ordering::Release);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove and return up to `max_n` frames, oldest first
    pub fn drain(&self, max_n: usize) -> Vec<Frame> {
        let mut inner = self.lock();
        let count = max_n.min(inner.frames.len());
        let frames: Vec<Frame> = inner.frames.drain(..count).collect();
        self.occupancy.store(inner.frames.len(), Ordering::Release);
        frames
    }

    /// Number of frames currently buffered
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    /// Frames rejected because the buffer was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames accepted since creation
    pub fn total_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Accepted frames per second over the trailing window
    pub fn rate(&self) -> f64 {
        self.lock().rate.rate(Instant::now())
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.occupancy() as f64 / self.capacity as f64
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-push; the
        // deque itself is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn frame(i: u64) -> Frame {
        Frame::standard(0x7E8, &(i as u32).to_be_bytes(), i).unwrap()
    }

    #[test]
    fn test_push_and_drain_fifo() {
        let buffer = RingBuffer::new(10);

        for i in 0..5 {
            buffer.push(frame(i)).unwrap();
        }
        assert_eq!(buffer.occupancy(), 5);

        let frames = buffer.drain(3);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].timestamp_us(), 0); // Oldest first
        assert_eq!(frames[2].timestamp_us(), 2);
        assert_eq!(buffer.occupancy(), 2);

        // Asking for more than is buffered returns what is there
        let rest = buffer.drain(100);
        assert_eq!(rest.len(), 2);
        assert!(buffer.drain(10).is_empty());
    }

    #[test]
    fn test_full_buffer_rejects_without_overwrite() {
        let buffer = RingBuffer::new(5);

        for i in 0..8 {
            let _ = buffer.push(frame(i));
        }

        assert_eq!(buffer.occupancy(), 5);
        assert_eq!(buffer.dropped_count(), 3);

        // Original frames survive untouched
        let frames = buffer.drain(5);
        let stamps: Vec<u64> = frames.iter().map(|f| f.timestamp_us()).collect();
        assert_eq!(stamps, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_by_one() {
        let buffer = RingBuffer::with_default_capacity();
        let mut accepted = 0;
        let mut rejected = 0;

        for i in 0..10_001 {
            match buffer.push(frame(i)) {
                Ok(()) => accepted += 1,
                Err(BufferFull { capacity }) => {
                    assert_eq!(capacity, 10_000);
                    rejected += 1;
                }
            }
        }

        assert_eq!(accepted, 10_000);
        assert_eq!(rejected, 1);
        assert_eq!(buffer.dropped_count(), 1);
    }

    #[test]
    fn test_utilization() {
        let buffer = RingBuffer::new(100);
        assert_eq!(buffer.utilization(), 0.0);

        for i in 0..50 {
            buffer.push(frame(i)).unwrap();
        }

        assert!((buffer.utilization() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_rate_counts_accepted_frames() {
        let buffer = RingBuffer::new(100);
        for i in 0..40 {
            buffer.push(frame(i)).unwrap();
        }
        let rate = buffer.rate();
        assert!(rate > 0.0 && rate <= 40.0, "rate was {}", rate);
    }

    #[test]
    fn test_concurrent_push_and_drain() {
        let buffer = Arc::new(RingBuffer::new(64));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    let _ = buffer.push(frame(i));
                }
            })
        };

        let mut drained = 0u64;
        while !producer.is_finished() || !buffer.is_empty() {
            drained += buffer.drain(16).len() as u64;
        }
        producer.join().unwrap();

        assert_eq!(drained + buffer.dropped_count(), 10_000);
        assert_eq!(buffer.total_accepted(), drained);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push,
        Drain(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Push),
            1 => (0usize..8).prop_map(Op::Drain),
        ]
    }

    proptest! {
        #[test]
        fn prop_dropped_only_when_full(
            capacity in 1usize..16,
            ops in prop::collection::vec(op_strategy(), 0..200),
        ) {
            let buffer = RingBuffer::new(capacity);
            let mut next = 0u64;

            for op in ops {
                match op {
                    Op::Push => {
                        let was_full = buffer.occupancy() == capacity;
                        let before = buffer.dropped_count();
                        let result = buffer.push(frame(next));
                        next += 1;

                        prop_assert_eq!(result.is_err(), was_full);
                        let expected = if was_full { before + 1 } else { before };
                        prop_assert_eq!(buffer.dropped_count(), expected);
                    }
                    Op::Drain(n) => {
                        let before = buffer.dropped_count();
                        let occupancy = buffer.occupancy();
                        let frames = buffer.drain(n);
                        prop_assert_eq!(frames.len(), n.min(occupancy));
                        prop_assert_eq!(buffer.dropped_count(), before);
                    }
                }
                prop_assert!(buffer.occupancy() <= capacity);
            }
        }
    }
}
