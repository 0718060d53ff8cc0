//! Adaptive video jitter buffer.
//!
//! Bounded queue of received frames between the socket reader and the decode
//! feeder. Absorbs arrival variance with a small adaptive backlog target:
//! calm links run at 2 frames, jittery links up to 4. Overflow drops the
//! oldest frame so latency stays bounded no matter how far the consumer falls
//! behind.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::pool::PooledBuf;
use crate::protocol_constants::{
    JITTER_CAPACITY, JITTER_EWMA_ALPHA, JITTER_HEAVY_EWMA_MS, JITTER_HEAVY_SPIKE_MS,
    JITTER_MODERATE_EWMA_MS, JITTER_MODERATE_SPIKE_MS, JITTER_TARGET_CALM, JITTER_TARGET_HEAVY,
    JITTER_TARGET_MODERATE,
};
use crate::wire::FrameHeader;

/// One received video frame, owned by the buffer until dequeued.
pub struct VideoFrame {
    pub header: FrameHeader,
    /// Monotonic ms when the frame was read off the socket.
    pub recv_ms: u64,
    pub payload: PooledBuf,
}

struct Inner {
    queue: VecDeque<VideoFrame>,
    closed: bool,
    fps: u32,
    last_arrival_ms: Option<u64>,
    /// EWMA of |inter-arrival − expected| in milliseconds.
    deviation_ewma_ms: f64,
    target: usize,
    dropped_overflow: u64,
}

/// Bounded frame queue with an adaptive backlog target.
pub struct JitterBuffer {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
}

impl JitterBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(JITTER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                fps: 30,
                last_arrival_ms: None,
                deviation_ewma_ms: 0.0,
                target: JITTER_TARGET_CALM,
                dropped_overflow: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Updates the nominal frame rate used for the expected arrival interval.
    pub fn set_fps(&self, fps: u32) {
        self.inner.lock().fps = fps.max(1);
    }

    /// Enqueues a frame, updating the adaptive target.
    ///
    /// Returns `true` when the oldest frame had to be dropped to make room.
    pub fn push(&self, frame: VideoFrame, now_ms: u64) -> bool {
        let mut inner = self.inner.lock();

        if let Some(last) = inner.last_arrival_ms {
            let gap_ms = now_ms.saturating_sub(last);
            let expected_ms = 1_000.0 / inner.fps as f64;
            let deviation = (gap_ms as f64 - expected_ms).abs();
            inner.deviation_ewma_ms =
                (1.0 - JITTER_EWMA_ALPHA) * inner.deviation_ewma_ms + JITTER_EWMA_ALPHA * deviation;

            inner.target = if inner.deviation_ewma_ms >= JITTER_HEAVY_EWMA_MS
                || gap_ms >= JITTER_HEAVY_SPIKE_MS
            {
                JITTER_TARGET_HEAVY
            } else if inner.deviation_ewma_ms >= JITTER_MODERATE_EWMA_MS
                || gap_ms >= JITTER_MODERATE_SPIKE_MS
            {
                JITTER_TARGET_MODERATE
            } else {
                JITTER_TARGET_CALM
            };
        }
        inner.last_arrival_ms = Some(now_ms);

        let dropped = if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            inner.dropped_overflow += 1;
            true
        } else {
            false
        };
        inner.queue.push_back(frame);
        drop(inner);
        self.available.notify_one();
        dropped
    }

    /// Dequeues the oldest frame, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or when the buffer is closed and drained.
    pub fn pop_wait(&self, timeout: Duration) -> Option<VideoFrame> {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() && !inner.closed {
            self.available.wait_for(&mut inner, timeout);
        }
        inner.queue.pop_front()
    }

    /// Takes every queued frame at once (keyframe-gated drain-to-latest).
    pub fn drain_all(&self) -> Vec<VideoFrame> {
        self.inner.lock().queue.drain(..).collect()
    }

    /// Drops oldest frames until at most `max_len` remain. Returns the count
    /// shed.
    pub fn shed_to(&self, max_len: usize) -> u64 {
        let mut inner = self.inner.lock();
        let mut shed = 0;
        while inner.queue.len() > max_len {
            inner.queue.pop_front();
            shed += 1;
        }
        inner.dropped_overflow += shed;
        shed
    }

    /// Discards all queued frames.
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }

    /// Wakes waiting consumers permanently; further pops drain then end.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a push right now would overflow.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Current adaptive backlog target.
    #[must_use]
    pub fn target(&self) -> usize {
        self.inner.lock().target
    }

    /// Current deviation EWMA in milliseconds.
    #[must_use]
    pub fn deviation_ewma_ms(&self) -> f64 {
        self.inner.lock().deviation_ewma_ms
    }

    /// Frames dropped to overflow or shedding since creation.
    #[must_use]
    pub fn dropped_overflow(&self) -> u64 {
        self.inner.lock().dropped_overflow
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BytePool;

    fn frame(pool: &std::sync::Arc<BytePool>, seq: i64, key: bool) -> VideoFrame {
        VideoFrame {
            header: FrameHeader {
                epoch: 1,
                seq,
                size: 16,
                key,
                ts_us: seq * 33_333,
                srv_ms: 0,
                cap_ms: 0,
                age_ms: 0,
            },
            recv_ms: 0,
            payload: pool.acquire(16),
        }
    }

    #[test]
    fn push_pop_preserves_order() {
        let pool = BytePool::with_defaults();
        let jb = JitterBuffer::new();
        for seq in 0..3 {
            jb.push(frame(&pool, seq, seq == 0), seq as u64 * 33);
        }
        for seq in 0..3 {
            let f = jb.pop_wait(Duration::from_millis(1)).unwrap();
            assert_eq!(f.header.seq, seq);
        }
        assert!(jb.pop_wait(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let pool = BytePool::with_defaults();
        let jb = JitterBuffer::with_capacity(3);
        for seq in 0..4 {
            jb.push(frame(&pool, seq, false), 0);
        }
        assert_eq!(jb.len(), 3);
        assert_eq!(jb.dropped_overflow(), 1);
        assert_eq!(jb.pop_wait(Duration::from_millis(1)).unwrap().header.seq, 1);
    }

    #[test]
    fn target_stays_calm_on_even_arrivals() {
        let pool = BytePool::with_defaults();
        let jb = JitterBuffer::new();
        jb.set_fps(30);
        let mut now = 0;
        for seq in 0..60 {
            jb.push(frame(&pool, seq, false), now);
            jb.pop_wait(Duration::from_millis(0));
            now += 33;
        }
        assert_eq!(jb.target(), JITTER_TARGET_CALM);
        assert!(jb.deviation_ewma_ms() < JITTER_MODERATE_EWMA_MS);
    }

    #[test]
    fn single_heavy_spike_raises_target() {
        let pool = BytePool::with_defaults();
        let jb = JitterBuffer::new();
        jb.set_fps(30);
        jb.push(frame(&pool, 0, false), 0);
        jb.push(frame(&pool, 1, false), 120); // 120ms gap at 30fps
        assert_eq!(jb.target(), JITTER_TARGET_HEAVY);
    }

    #[test]
    fn sustained_moderate_jitter_raises_target() {
        let pool = BytePool::with_defaults();
        let jb = JitterBuffer::new();
        jb.set_fps(30);
        let mut now = 0;
        // Alternate 10ms / 56ms gaps: mean deviation ~23ms, no single gap ≥60ms.
        for seq in 0..60 {
            jb.push(frame(&pool, seq, false), now);
            jb.pop_wait(Duration::from_millis(0));
            now += if seq % 2 == 0 { 10 } else { 56 };
        }
        assert_eq!(jb.target(), JITTER_TARGET_MODERATE);
    }

    #[test]
    fn drain_all_empties_queue() {
        let pool = BytePool::with_defaults();
        let jb = JitterBuffer::new();
        for seq in 0..5 {
            jb.push(frame(&pool, seq, false), 0);
        }
        let drained = jb.drain_all();
        assert_eq!(drained.len(), 5);
        assert!(jb.is_empty());
    }

    #[test]
    fn shed_to_drops_oldest_extras() {
        let pool = BytePool::with_defaults();
        let jb = JitterBuffer::new();
        for seq in 0..10 {
            jb.push(frame(&pool, seq, false), 0);
        }
        assert_eq!(jb.shed_to(4), 6);
        assert_eq!(jb.pop_wait(Duration::from_millis(1)).unwrap().header.seq, 6);
    }

    #[test]
    fn close_wakes_waiting_consumer() {
        let jb = std::sync::Arc::new(JitterBuffer::new());
        let jb2 = std::sync::Arc::clone(&jb);
        let handle = std::thread::spawn(move || jb2.pop_wait(Duration::from_secs(10)).is_none());
        std::thread::sleep(Duration::from_millis(20));
        jb.close();
        assert!(handle.join().unwrap());
    }
}
