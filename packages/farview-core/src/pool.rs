//! Size-bucketed reuse of payload buffers.
//!
//! Video and audio payloads churn at frame rate; recycling their backing
//! storage keeps the receive path allocation-free in steady state. Buffers are
//! parked in power-of-two size classes from 1 B to 2 MiB with a soft global
//! byte cap; larger requests bypass the pool entirely.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::ViewerError;
use crate::protocol_constants::{
    POOL_MAX_BUFFER_BYTES, POOL_PER_BUCKET_CAP, POOL_SOFT_CAP_BYTES,
};

/// Number of power-of-two size classes: 2^0 … 2^21 (1 B … 2 MiB).
const BUCKET_COUNT: usize = 22;

/// Pool of reusable payload buffers.
pub struct BytePool {
    buckets: [Mutex<Vec<Vec<u8>>>; BUCKET_COUNT],
    /// Bytes currently parked across all free lists.
    parked_bytes: AtomicUsize,
    soft_cap: usize,
    per_bucket_cap: usize,
}

impl BytePool {
    /// Creates a pool with explicit caps.
    pub fn new(soft_cap: usize, per_bucket_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            buckets: std::array::from_fn(|_| Mutex::new(Vec::new())),
            parked_bytes: AtomicUsize::new(0),
            soft_cap,
            per_bucket_cap,
        })
    }

    /// Creates a pool with the default caps.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(POOL_SOFT_CAP_BYTES, POOL_PER_BUCKET_CAP)
    }

    /// Acquires a buffer of exactly `len` readable bytes.
    ///
    /// Requests above the largest size class are served off-pool and freed on
    /// drop rather than recycled.
    pub fn acquire(self: &Arc<Self>, len: usize) -> PooledBuf {
        let class = size_class(len);
        let Some(class) = class else {
            log::warn!(
                "[Pool] {}, serving off-pool",
                ViewerError::ResourceExhausted(len)
            );
            return PooledBuf {
                buf: vec![0; len],
                len,
                pool: Weak::new(),
            };
        };

        let cap = 1usize << class;
        let recycled = self.buckets[class].lock().pop();
        let mut buf = match recycled {
            Some(buf) => {
                self.parked_bytes.fetch_sub(cap, Ordering::Relaxed);
                buf
            }
            None => Vec::with_capacity(cap),
        };
        buf.clear();
        buf.resize(len, 0);
        PooledBuf {
            buf,
            len,
            pool: Arc::downgrade(self),
        }
    }

    /// Bytes currently parked in free lists.
    #[must_use]
    pub fn parked_bytes(&self) -> usize {
        self.parked_bytes.load(Ordering::Relaxed)
    }

    /// Returns a buffer to its free list, or drops it when caps are hit.
    fn recycle(&self, buf: Vec<u8>) {
        let cap = buf.capacity();
        let Some(class) = size_class(cap) else {
            return;
        };
        // A recycled buffer may have been grown by the holder; park it in the
        // class its real capacity fits.
        let class_bytes = 1usize << class;
        if class_bytes > cap {
            // capacity is not a power of two; park one class down
            debug_assert!(class > 0);
            return self.recycle_into(class - 1, buf);
        }
        self.recycle_into(class, buf);
    }

    fn recycle_into(&self, class: usize, buf: Vec<u8>) {
        let class_bytes = 1usize << class;
        let parked = self.parked_bytes.load(Ordering::Relaxed);
        if parked + class_bytes > self.soft_cap {
            log::trace!("[Pool] Soft cap reached, freeing {} byte buffer", class_bytes);
            return;
        }
        let mut bucket = self.buckets[class].lock();
        if bucket.len() >= self.per_bucket_cap {
            return;
        }
        bucket.push(buf);
        self.parked_bytes.fetch_add(class_bytes, Ordering::Relaxed);
    }
}

/// Smallest power-of-two class that fits `len`, or `None` above the ceiling.
fn size_class(len: usize) -> Option<usize> {
    if len > POOL_MAX_BUFFER_BYTES {
        return None;
    }
    Some(len.max(1).next_power_of_two().trailing_zeros() as usize)
}

/// A pooled payload buffer. Recycles itself into the pool on drop.
///
/// Exactly one of two things happens to every acquired buffer: it is parked
/// back into a free list, or it is freed (caps hit, oversized, or the pool is
/// gone). There is no third path.
pub struct PooledBuf {
    buf: Vec<u8>,
    len: usize,
    pool: Weak<BytePool>,
}

impl PooledBuf {
    /// Readable length of the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Mutable payload bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len).finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(std::mem::take(&mut self.buf));
        }
    }
}

/// Reusable scratch buffer for draining payloads that will be discarded.
///
/// Grows by doubling and never shrinks within a session, so steady-state
/// drains allocate nothing.
pub struct Scratch {
    buf: Vec<u8>,
}

impl Scratch {
    /// Creates an empty scratch buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Returns a mutable slice of at least `len` bytes.
    pub fn space(&mut self, len: usize) -> &mut [u8] {
        if self.buf.len() < len {
            let new_len = self.buf.len().max(1024).max(len).next_power_of_two();
            self.buf.resize(new_len, 0);
        }
        &mut self.buf[..len]
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Self::new()
    }
}
