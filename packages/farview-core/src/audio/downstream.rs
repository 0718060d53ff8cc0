//! Downstream audio playback.
//!
//! Received AUDIO_FRAME dir=down packets land in a bounded queue consumed by
//! one audio-priority thread doing blocking writes to the platform sink. PCM
//! plays directly through the adaptive noise gate; ADTS-AAC goes through the
//! decoder adapter first and joins the same queue discipline. The timestamp
//! of the last played sample is published for A/V sync.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::pool::PooledBuf;
use crate::protocol_constants::AUDIO_QUEUE_CAPACITY;
use crate::traits::{AacDecoder, AudioSink, Clock};
use crate::wire::AudioCodec;

use super::aac::AdtsAacAdapter;
use super::gate::{GateDecision, NoiseGate};

/// One downstream audio packet, owned by the queue until played.
pub struct AudioPacket {
    pub payload: PooledBuf,
    pub rate: u32,
    pub channels: u16,
    pub ts_us: i64,
    pub format: AudioCodec,
}

struct QueueInner {
    queue: VecDeque<AudioPacket>,
    closed: bool,
    dropped_overflow: u64,
}

/// Bounded playback queue; overflow drops the oldest packet.
pub struct PlaybackQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
}

impl PlaybackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(AUDIO_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                dropped_overflow: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues a packet; returns `true` when the oldest was dropped.
    pub fn push(&self, packet: AudioPacket) -> bool {
        let mut inner = self.inner.lock();
        let dropped = if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            inner.dropped_overflow += 1;
            true
        } else {
            false
        };
        inner.queue.push_back(packet);
        drop(inner);
        self.available.notify_one();
        dropped
    }

    fn pop_wait(&self, timeout: Duration) -> (Option<AudioPacket>, bool) {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() && !inner.closed {
            self.available.wait_for(&mut inner, timeout);
        }
        let closed = inner.closed;
        (inner.queue.pop_front(), closed)
    }

    /// Wakes the playback thread for shutdown; queued packets are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.queue.clear();
        drop(inner);
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

    /// Packets dropped to overflow since creation.
    #[must_use]
    pub fn dropped_overflow(&self) -> u64 {
        self.inner.lock().dropped_overflow
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the playback thread.
pub struct AudioDownstream {
    queue: Arc<PlaybackQueue>,
    muted: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioDownstream {
    /// Spawns the playback thread.
    ///
    /// `latest_played_ts_us` is updated after every successful write and read
    /// by the video feeder for A/V sync. `packets_played` feeds session stats.
    pub fn spawn(
        queue: Arc<PlaybackQueue>,
        mut sink: Box<dyn AudioSink>,
        aac: Option<Box<dyn AacDecoder>>,
        clock: Arc<dyn Clock>,
        latest_played_ts_us: Arc<AtomicI64>,
        packets_played: Arc<AtomicU64>,
    ) -> Self {
        let muted = Arc::new(AtomicBool::new(false));
        let muted_flag = Arc::clone(&muted);
        let thread_queue = Arc::clone(&queue);

        let handle = std::thread::Builder::new()
            .name("fv-audio-play".into())
            .spawn(move || {
                let mut gate = NoiseGate::new();
                gate.on_unmute(clock.mono_ms());
                let mut adapter = aac.map(AdtsAacAdapter::new);
                let mut was_muted = false;
                let mut aac_drop_warned = false;

                loop {
                    let (packet, closed) = thread_queue.pop_wait(Duration::from_millis(100));
                    let Some(packet) = packet else {
                        if closed {
                            break;
                        }
                        continue;
                    };

                    let muted_now = muted_flag.load(Ordering::Acquire);
                    if muted_now {
                        was_muted = true;
                        continue;
                    }
                    if was_muted {
                        was_muted = false;
                        gate.on_unmute(clock.mono_ms());
                    }

                    match packet.format {
                        AudioCodec::Pcm => {
                            sink.ensure(packet.rate, packet.channels);
                            let now = clock.mono_ms();
                            match gate.process(now, packet.payload.as_slice()) {
                                GateDecision::Pass => {
                                    sink.write(packet.payload.as_slice());
                                }
                                GateDecision::Suppress => {
                                    // Keep cadence: write silence of equal length.
                                    let silence = vec![0u8; packet.payload.len()];
                                    sink.write(&silence);
                                }
                            }
                            latest_played_ts_us.store(packet.ts_us, Ordering::Release);
                            packets_played.fetch_add(1, Ordering::Relaxed);
                        }
                        AudioCodec::Aac => match adapter.as_mut() {
                            Some(adapter) => {
                                let chunks = adapter.decode(
                                    packet.rate,
                                    packet.channels,
                                    packet.payload.as_slice(),
                                    packet.ts_us,
                                );
                                for (pcm, ts_us) in chunks {
                                    sink.ensure(packet.rate, packet.channels);
                                    sink.write(&pcm);
                                    latest_played_ts_us.store(ts_us, Ordering::Release);
                                    packets_played.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            None => {
                                if !aac_drop_warned {
                                    aac_drop_warned = true;
                                    log::warn!(
                                        "[Audio] AAC downstream received but no AAC decoder is wired; dropping"
                                    );
                                }
                            }
                        },
                    }
                }
                sink.flush_and_release();
                log::debug!("[Audio] Playback thread stopped");
            })
            .expect("spawn audio playback thread");

        Self {
            queue,
            muted,
            handle: Some(handle),
        }
    }

    /// Mutes or unmutes playback. Unmuting re-runs gate calibration.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Stops the thread and drops queued packets. Idempotent.
    pub fn shutdown(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioDownstream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
