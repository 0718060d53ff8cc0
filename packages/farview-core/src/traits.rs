//! Collaborator interfaces consumed by the core.
//!
//! The core never talks to hardware directly. Platform decoders, audio
//! devices and render surfaces plug in through these traits; the `Null*`
//! implementations keep headless sessions (and tests) running without any
//! hardware behind them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Time source used by watchdogs and pacing logic.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since an arbitrary origin.
    fn mono_ms(&self) -> u64;

    /// Wall-clock Unix milliseconds.
    fn wall_ms(&self) -> i64;
}

/// Real-time clock backed by [`Instant`] and the system clock.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
        })
    }
}

impl Clock for SystemClock {
    fn mono_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall_ms(&self) -> i64 {
        now_millis() as i64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Video Decoder
// ─────────────────────────────────────────────────────────────────────────────

/// Result of feeding one access unit to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// The unit was queued for decode.
    Fed,
    /// No input buffer was available; retry after draining output.
    BufferFull,
}

/// One poll of the decoder output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderOutput {
    /// The coded format changed (or became known).
    FormatChanged { width: u32, height: u32 },
    /// A decoded buffer is ready; release it with [`DecoderSink::release`].
    Buffer { index: usize, pts_us: i64 },
    /// Nothing ready within the timeout.
    None,
}

/// Decoder-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecoderError {
    /// The decoder rejected a call in its current state. A flush may clear
    /// it; otherwise the instance must be rebuilt.
    #[error("decoder in illegal state")]
    IllegalState,
    /// The instance is unusable and must be rebuilt.
    #[error("decoder failed: {0}")]
    Fatal(String),
}

/// Abstract hardware/software H.264 decoder.
///
/// A configured instance cannot be re-configured with different parameter
/// sets; the feeder drops and recreates it instead.
pub trait DecoderSink: Send {
    /// Configures the decoder with SPS/PPS and target dimensions.
    fn configure(
        &mut self,
        sps: &[u8],
        pps: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), DecoderError>;

    /// Feeds one access unit.
    fn feed(&mut self, data: &[u8], pts_us: i64, is_key: bool) -> Result<FeedResult, DecoderError>;

    /// Polls for output, waiting at most `timeout_us`.
    fn poll_output(&mut self, timeout_us: u64) -> Result<DecoderOutput, DecoderError>;

    /// Releases an output buffer, optionally rendering it to the surface.
    fn release(&mut self, index: usize, render: bool) -> Result<(), DecoderError>;

    /// Flushes queued input and output without losing configuration.
    fn flush(&mut self) -> Result<(), DecoderError>;
}

/// Creates decoder instances. The feeder calls this again after teardown.
pub trait DecoderFactory: Send {
    fn create(&self) -> Box<dyn DecoderSink>;
}

/// Loopback decoder for headless sessions and tests: every fed frame becomes
/// one output buffer with the same timestamp.
pub struct NullDecoderSink {
    configured: bool,
    pending: VecDeque<i64>,
    next_index: usize,
    format_reported: bool,
    width: u32,
    height: u32,
}

impl NullDecoderSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            configured: false,
            pending: VecDeque::new(),
            next_index: 0,
            format_reported: false,
            width: 0,
            height: 0,
        }
    }
}

impl Default for NullDecoderSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderSink for NullDecoderSink {
    fn configure(
        &mut self,
        _sps: &[u8],
        _pps: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), DecoderError> {
        if self.configured {
            return Err(DecoderError::IllegalState);
        }
        self.configured = true;
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn feed(&mut self, _data: &[u8], pts_us: i64, _is_key: bool) -> Result<FeedResult, DecoderError> {
        if !self.configured {
            return Err(DecoderError::IllegalState);
        }
        self.pending.push_back(pts_us);
        Ok(FeedResult::Fed)
    }

    fn poll_output(&mut self, _timeout_us: u64) -> Result<DecoderOutput, DecoderError> {
        if !self.configured {
            return Err(DecoderError::IllegalState);
        }
        if !self.format_reported && !self.pending.is_empty() {
            self.format_reported = true;
            return Ok(DecoderOutput::FormatChanged {
                width: self.width,
                height: self.height,
            });
        }
        match self.pending.pop_front() {
            Some(pts_us) => {
                let index = self.next_index;
                self.next_index += 1;
                Ok(DecoderOutput::Buffer { index, pts_us })
            }
            None => Ok(DecoderOutput::None),
        }
    }

    fn release(&mut self, _index: usize, _render: bool) -> Result<(), DecoderError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DecoderError> {
        self.pending.clear();
        Ok(())
    }
}

/// Factory producing [`NullDecoderSink`] instances.
pub struct NullDecoderFactory;

impl DecoderFactory for NullDecoderFactory {
    fn create(&self) -> Box<dyn DecoderSink> {
        Box::new(NullDecoderSink::new())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio
// ─────────────────────────────────────────────────────────────────────────────

/// Abstract PCM playback device. `write` may block until the device accepts
/// the data, which is why playback runs on its own thread.
pub trait AudioSink: Send {
    /// Ensures the sink is open at the given format, reopening on change.
    fn ensure(&mut self, rate: u32, channels: u16);

    /// Writes PCM bytes, blocking as needed. Returns bytes accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Flushes and releases the device.
    fn flush_and_release(&mut self);
}

/// Playback sink that discards samples. Used by headless sessions.
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn ensure(&mut self, _rate: u32, _channels: u16) {}

    fn write(&mut self, data: &[u8]) -> usize {
        data.len()
    }

    fn flush_and_release(&mut self) {}
}

/// Optional ADTS-AAC decoder adapter. When absent, AAC downstream packets are
/// dropped with a rate-limited warning.
pub trait AacDecoder: Send {
    /// Configures for ADTS input with a synthesized AudioSpecificConfig.
    fn configure_adts(&mut self, rate: u32, channels: u16, asc: &[u8]);

    /// Feeds one whole ADTS frame, 7-byte header included.
    fn feed(&mut self, adts: &[u8], ts_us: i64);

    /// Drains decoded PCM chunks with their timestamps.
    fn drain_pcm(&mut self) -> Vec<(Vec<u8>, i64)>;
}

/// Blocking microphone source for talkback. One read returns one 20 ms frame.
///
/// Platform implementations should prefer a voice-communication source with
/// echo cancellation, noise suppression and AGC enabled, falling back to the
/// raw microphone when those effects are unavailable.
pub trait AudioCapture: Send {
    /// Reads one frame into `buf`, blocking until available.
    /// Returns bytes written, or `None` when the source has ended.
    fn read_frame(&mut self, buf: &mut [u8]) -> Option<usize>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Render Surface
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque render target handle. The core only asks whether it is still valid
/// before releasing decoder output for render.
pub trait RenderSurface: Send + Sync {
    fn is_valid(&self) -> bool;
}

/// Always-valid surface for headless sessions.
pub struct NullSurface;

impl RenderSurface for NullSurface {
    fn is_valid(&self) -> bool {
        true
    }
}

/// Surface whose validity can be toggled; handy in tests.
pub struct ToggleSurface {
    valid: AtomicBool,
}

impl ToggleSurface {
    #[must_use]
    pub fn new(valid: bool) -> Self {
        Self {
            valid: AtomicBool::new(valid),
        }
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }
}

impl RenderSurface for ToggleSurface {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_decoder_echoes_frames_in_order() {
        let mut dec = NullDecoderSink::new();
        dec.configure(&[1], &[2], 640, 480).unwrap();
        dec.feed(&[0u8; 8], 100, true).unwrap();
        dec.feed(&[0u8; 8], 200, false).unwrap();

        assert_eq!(
            dec.poll_output(0).unwrap(),
            DecoderOutput::FormatChanged {
                width: 640,
                height: 480
            }
        );
        assert_eq!(
            dec.poll_output(0).unwrap(),
            DecoderOutput::Buffer { index: 0, pts_us: 100 }
        );
        assert_eq!(
            dec.poll_output(0).unwrap(),
            DecoderOutput::Buffer { index: 1, pts_us: 200 }
        );
        assert_eq!(dec.poll_output(0).unwrap(), DecoderOutput::None);
    }

    #[test]
    fn null_decoder_rejects_double_configure() {
        let mut dec = NullDecoderSink::new();
        dec.configure(&[1], &[2], 640, 480).unwrap();
        assert_eq!(
            dec.configure(&[1], &[2], 640, 480),
            Err(DecoderError::IllegalState)
        );
    }

    #[test]
    fn null_decoder_rejects_feed_before_configure() {
        let mut dec = NullDecoderSink::new();
        assert_eq!(
            dec.feed(&[0u8; 4], 0, true),
            Err(DecoderError::IllegalState)
        );
    }

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock::new();
        let a = clock.mono_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.mono_ms() >= a);
    }
}
