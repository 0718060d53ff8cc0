//! Decode feeder: consumes the jitter buffer and drives the decoder sink.
//!
//! Runs on a dedicated thread because decoder calls may block. Applies the
//! ordering invariants that keep corruption off the screen: nothing is fed
//! before codec config, no non-key frame is fed while keyframe-gated, and no
//! output is rendered until a keyframe has been queued since the last reset.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol_constants::{
    AV_SYNC_MAX_SLEEP_MS, FEEDER_BACKLOG_SLACK, KEYFRAME_SKIP_DOWNGRADE_COUNT, STREAM_STALL_MS,
    WARMUP_DROP_OUTPUTS, WARMUP_STABLE_RENDERS, WARMUP_SUPPRESS_MS,
};
use crate::traits::{
    Clock, DecoderError, DecoderFactory, DecoderOutput, DecoderSink, FeedResult, RenderSurface,
};
use crate::wire::should_drop_frame_by_epoch;

use super::jitter::{JitterBuffer, VideoFrame};
use super::VideoShared;

/// How long one feeder iteration waits for a frame before re-checking
/// commands and decoder output.
const POP_WAIT: Duration = Duration::from_millis(40);

/// Output poll timeout per iteration (µs).
const OUTPUT_POLL_US: u64 = 5_000;

/// Feed retries when the decoder reports full input buffers.
const FEED_RETRIES: u32 = 3;

/// Control messages from the orchestrator to the feeder thread.
pub enum FeederCommand {
    /// New or repeated codec config.
    Csd { epoch: u64, sps: Bytes, pps: Bytes },
    /// Negotiated stream parameters (dimensions may differ from requested).
    StreamAccepted {
        epoch: u64,
        width: u32,
        height: u32,
        fps: u32,
    },
    /// Stop the thread; queued frames are recycled.
    Shutdown,
}

/// Events from the feeder thread back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum FeederEvent {
    /// The feeder needs an IDR to make progress.
    RequestKeyframe,
    /// First stable frame reached the surface this session.
    FirstFrameRendered,
    /// A frame was rendered to the surface.
    FrameRendered { pts_us: i64 },
    /// A frame was fed to the decoder (rendered or not).
    FrameFed { late_ms: u64 },
    /// Video dimensions; `coded` distinguishes decoder-reported size from the
    /// negotiated fallback.
    VideoSize { width: u32, height: u32, coded: bool },
    /// Cumulative non-key frames skipped while keyframe-gated.
    KeyframeGateSkips { total: u64 },
    /// The decoder instance was torn down (reset bookkeeping upstream).
    DecoderTeardown,
    /// The decoder misbehaved and a recovery (flush or rebuild) was started.
    DecoderFault { detail: String },
}

/// Feeder tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct FeederConfig {
    /// Enables the post-IDR warmup window for devices that emit transient
    /// garbage after a reset.
    pub warmup: bool,
    /// Disables backlog buffering entirely (always drain to latest).
    pub jitter_disabled: bool,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            warmup: false,
            jitter_disabled: false,
        }
    }
}

/// The decode-feed loop. Owns the decoder instance for its whole life.
pub struct DecodeFeeder {
    config: FeederConfig,
    jitter: Arc<JitterBuffer>,
    shared: Arc<VideoShared>,
    clock: Arc<dyn Clock>,
    factory: Box<dyn DecoderFactory>,
    surface: Arc<RwLock<Option<Arc<dyn RenderSurface>>>>,
    /// Timestamp of the most recently played audio sample, for A/V sync.
    audio_clock: Arc<AtomicI64>,
    commands: Receiver<FeederCommand>,
    events: UnboundedSender<FeederEvent>,

    decoder: Option<Box<dyn DecoderSink>>,
    csd: Option<(Bytes, Bytes)>,
    negotiated: Option<(u32, u32)>,
    coded: Option<(u32, u32)>,
    queued_keyframe_since_reset: bool,
    first_frame_reported: bool,
    skip_count: u64,
    skip_downgrade_reported: bool,

    warmup_drops_left: u32,
    suppress_render_until_ms: u64,
    stable_renders: u32,
}

impl DecodeFeeder {
    /// Spawns the feeder thread.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: FeederConfig,
        jitter: Arc<JitterBuffer>,
        shared: Arc<VideoShared>,
        clock: Arc<dyn Clock>,
        factory: Box<dyn DecoderFactory>,
        surface: Arc<RwLock<Option<Arc<dyn RenderSurface>>>>,
        audio_clock: Arc<AtomicI64>,
        commands: Receiver<FeederCommand>,
        events: UnboundedSender<FeederEvent>,
    ) -> JoinHandle<()> {
        let mut feeder = Self {
            config,
            jitter,
            shared,
            clock,
            factory,
            surface,
            audio_clock,
            commands,
            events,
            decoder: None,
            csd: None,
            negotiated: None,
            coded: None,
            queued_keyframe_since_reset: false,
            first_frame_reported: false,
            skip_count: 0,
            skip_downgrade_reported: false,
            warmup_drops_left: 0,
            suppress_render_until_ms: 0,
            stable_renders: 0,
        };
        std::thread::Builder::new()
            .name("fv-decode-feeder".into())
            .spawn(move || feeder.run())
            .expect("spawn decode feeder thread")
    }

    fn run(&mut self) {
        log::debug!("[Feeder] Thread started");
        loop {
            match self.drain_commands() {
                ControlFlow::Stop => break,
                ControlFlow::Continue => {}
            }

            let waiting = self.shared.waiting_for_keyframe.load(Ordering::Acquire);
            let frame = if waiting || self.config.jitter_disabled {
                self.take_latest()
            } else {
                let max = self.jitter.target() + FEEDER_BACKLOG_SLACK;
                let shed = self.jitter.shed_to(max);
                if shed > 0 {
                    log::debug!("[Feeder] Shed {} frames over backlog bound", shed);
                }
                self.jitter.pop_wait(POP_WAIT)
            };

            if let Some(frame) = frame {
                self.process_frame(frame);
            }
            self.drain_outputs();
        }
        self.jitter.clear();
        log::debug!("[Feeder] Thread stopped");
    }

    fn drain_commands(&mut self) -> ControlFlow {
        loop {
            match self.commands.try_recv() {
                Ok(FeederCommand::Csd { epoch, sps, pps }) => self.handle_csd(epoch, sps, pps),
                Ok(FeederCommand::StreamAccepted {
                    epoch,
                    width,
                    height,
                    fps,
                }) => self.handle_stream_accepted(epoch, width, height, fps),
                Ok(FeederCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    return ControlFlow::Stop
                }
                Err(TryRecvError::Empty) => return ControlFlow::Continue,
            }
        }
    }

    /// Drains the queue and returns the newest key frame, or the newest frame
    /// when none of the drained frames is a key.
    fn take_latest(&mut self) -> Option<VideoFrame> {
        let mut drained = self.jitter.drain_all();
        if drained.is_empty() {
            return self.jitter.pop_wait(POP_WAIT);
        }
        let newest_key = drained.iter().rposition(|f| f.header.key);
        let chosen = match newest_key {
            Some(pos) => drained.swap_remove(pos),
            None => drained.pop().expect("drained is non-empty"),
        };
        if self.shared.waiting_for_keyframe.load(Ordering::Acquire) {
            self.note_gate_skips(drained.len() as u64);
        }
        // Remaining frames recycle their payloads on drop.
        Some(chosen)
    }

    fn note_gate_skips(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        self.skip_count += count;
        if self.skip_count >= KEYFRAME_SKIP_DOWNGRADE_COUNT && !self.skip_downgrade_reported {
            self.skip_downgrade_reported = true;
            let _ = self.events.send(FeederEvent::KeyframeGateSkips {
                total: self.skip_count,
            });
        }
    }

    fn process_frame(&mut self, frame: VideoFrame) {
        let current_epoch = self.shared.current_epoch.load(Ordering::Acquire);
        if should_drop_frame_by_epoch(current_epoch, frame.header.epoch) {
            log::trace!(
                "[Feeder] Dropped frame seq={} from epoch {} (current {})",
                frame.header.seq,
                frame.header.epoch,
                current_epoch
            );
            return;
        }

        let waiting = self.shared.waiting_for_keyframe.load(Ordering::Acquire);
        if waiting && !frame.header.key {
            self.note_gate_skips(1);
            return;
        }

        if self.decoder.is_none() && !self.maybe_configure() {
            // No codec config yet; the frame is unusable.
            return;
        }

        let late_ms = self.clock.mono_ms().saturating_sub(frame.recv_ms);
        match self.feed_with_retry(&frame) {
            Ok(FeedResult::Fed) => {
                if waiting {
                    // Gate clears only here, in the same operation that
                    // queued the key.
                    self.shared
                        .waiting_for_keyframe
                        .store(false, Ordering::Release);
                    self.queued_keyframe_since_reset = true;
                    self.skip_count = 0;
                    // Anything still queued predates this key and references
                    // invalid state.
                    let flushed = self.jitter.drain_all().len();
                    if flushed > 0 {
                        log::debug!("[Feeder] Flushed {} pre-key frames", flushed);
                    }
                    if self.config.warmup {
                        self.warmup_drops_left = WARMUP_DROP_OUTPUTS;
                        self.suppress_render_until_ms =
                            self.clock.mono_ms() + WARMUP_SUPPRESS_MS;
                        self.stable_renders = 0;
                    }
                }
                let _ = self.events.send(FeederEvent::FrameFed { late_ms });
            }
            Ok(FeedResult::BufferFull) => {
                log::warn!(
                    "[Feeder] Decoder input full, dropped frame seq={}",
                    frame.header.seq
                );
            }
            Err(e) => self.recover_decoder(e),
        }
    }

    fn feed_with_retry(&mut self, frame: &VideoFrame) -> Result<FeedResult, DecoderError> {
        for _ in 0..FEED_RETRIES {
            // The decoder can disappear mid-retry when draining output hits an
            // error and tears it down.
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(FeedResult::BufferFull);
            };
            match decoder.feed(frame.payload.as_slice(), frame.header.ts_us, frame.header.key)? {
                FeedResult::Fed => return Ok(FeedResult::Fed),
                FeedResult::BufferFull => self.drain_outputs(),
            }
        }
        Ok(FeedResult::BufferFull)
    }

    fn drain_outputs(&mut self) {
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return;
            };
            match decoder.poll_output(OUTPUT_POLL_US) {
                Ok(DecoderOutput::FormatChanged { width, height }) => {
                    log::info!("[Feeder] Decoder format changed: {}x{}", width, height);
                    self.coded = Some((width, height));
                    let _ = self.events.send(FeederEvent::VideoSize {
                        width,
                        height,
                        coded: true,
                    });
                }
                Ok(DecoderOutput::Buffer { index, pts_us }) => {
                    self.release_output(index, pts_us);
                }
                Ok(DecoderOutput::None) => return,
                Err(e) => {
                    self.recover_decoder(e);
                    return;
                }
            }
        }
    }

    fn release_output(&mut self, index: usize, pts_us: i64) {
        let now_ms = self.clock.mono_ms();

        // Never render before a post-reset key has been queued.
        if !self.queued_keyframe_since_reset {
            self.release(index, false);
            return;
        }

        // Input stalled but decoder still draining: discard to avoid a stuck
        // last-frame artifact.
        let last_rx = self.shared.last_rx_ms.load(Ordering::Acquire);
        if last_rx > 0 && now_ms.saturating_sub(last_rx) >= STREAM_STALL_MS {
            self.release(index, false);
            return;
        }

        if self.warmup_drops_left > 0 {
            self.warmup_drops_left -= 1;
            self.release(index, false);
            return;
        }

        let surface_ok = self
            .surface
            .read()
            .as_ref()
            .is_some_and(|s| s.is_valid());
        let suppressed = now_ms < self.suppress_render_until_ms;
        let paused = self.shared.paused.load(Ordering::Acquire);
        let render = surface_ok && !suppressed && !paused;

        if render {
            self.av_sync_delay(pts_us);
        }
        self.release(index, render);

        if render {
            self.stable_renders = self.stable_renders.saturating_add(1);
            let _ = self.events.send(FeederEvent::FrameRendered { pts_us });

            let required = if self.config.warmup {
                WARMUP_STABLE_RENDERS
            } else {
                1
            };
            if !self.first_frame_reported && self.stable_renders >= required {
                self.first_frame_reported = true;
                let _ = self.events.send(FeederEvent::FirstFrameRendered);
            }
        }
    }

    fn release(&mut self, index: usize, render: bool) {
        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.release(index, render) {
                self.recover_decoder(e);
            }
        }
    }

    /// Sleeps so video does not run ahead of the audio clock.
    fn av_sync_delay(&self, pts_us: i64) {
        let audio_ts = self.audio_clock.load(Ordering::Acquire);
        if audio_ts <= 0 {
            return;
        }
        let ahead_us = pts_us - audio_ts;
        if ahead_us > 0 {
            let sleep_ms = ((ahead_us / 1_000) as u64).min(AV_SYNC_MAX_SLEEP_MS);
            if sleep_ms > 0 {
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }
    }

    fn handle_csd(&mut self, epoch: u64, sps: Bytes, pps: Bytes) {
        let current = self.shared.current_epoch.load(Ordering::Acquire);
        if epoch > current {
            self.epoch_bump(epoch);
        } else if epoch > 0 && epoch < current {
            log::debug!("[Feeder] Ignoring CSD from stale epoch {}", epoch);
            return;
        }

        if let Some((old_sps, old_pps)) = &self.csd {
            if *old_sps == sps && *old_pps == pps {
                log::info!("[Feeder] Duplicate CSD ignored (epoch {})", epoch);
                return;
            }
            // Parameter sets changed: a configured decoder cannot be
            // re-configured in place.
            self.teardown_decoder();
        }

        self.csd = Some((sps, pps));
        self.reset_gating();
        self.maybe_configure();
    }

    fn handle_stream_accepted(&mut self, epoch: u64, width: u32, height: u32, fps: u32) {
        let current = self.shared.current_epoch.load(Ordering::Acquire);
        if epoch > current {
            self.epoch_bump(epoch);
        } else if epoch > 0 && epoch < current {
            log::debug!("[Feeder] Ignoring STREAM_ACCEPTED from stale epoch {}", epoch);
            return;
        }

        self.negotiated = Some((width, height));
        self.jitter.set_fps(fps);
        // Fallback size; a later FormatChanged supersedes it with coded dims.
        if self.coded.is_none() {
            let _ = self.events.send(FeederEvent::VideoSize {
                width,
                height,
                coded: false,
            });
        }
        self.maybe_configure();
    }

    /// Epoch bump: discard everything tied to the previous encoder era.
    fn epoch_bump(&mut self, epoch: u64) {
        log::info!(
            "[Feeder] Epoch {} -> {}",
            self.shared.current_epoch.load(Ordering::Acquire),
            epoch
        );
        self.shared.current_epoch.store(epoch, Ordering::Release);
        self.negotiated = None;
        self.coded = None;
        self.csd = None;
        self.teardown_decoder();
        self.jitter.clear();
        self.reset_gating();
    }

    fn reset_gating(&mut self) {
        self.shared
            .waiting_for_keyframe
            .store(true, Ordering::Release);
        self.queued_keyframe_since_reset = false;
        self.skip_count = 0;
        self.skip_downgrade_reported = false;
        self.warmup_drops_left = 0;
        self.suppress_render_until_ms = 0;
        self.stable_renders = 0;
    }

    fn teardown_decoder(&mut self) {
        if self.decoder.take().is_some() {
            log::info!("[Feeder] Decoder torn down");
            let _ = self.events.send(FeederEvent::DecoderTeardown);
        }
    }

    /// Creates and configures the decoder once CSD and dimensions are known.
    /// Returns whether a configured decoder is available.
    fn maybe_configure(&mut self) -> bool {
        if self.decoder.is_some() {
            return true;
        }
        let (Some((sps, pps)), Some((width, height))) = (&self.csd, self.negotiated) else {
            return false;
        };
        let mut decoder = self.factory.create();
        match decoder.configure(sps, pps, width, height) {
            Ok(()) => {
                log::info!("[Feeder] Decoder configured at {}x{}", width, height);
                self.decoder = Some(decoder);
                true
            }
            Err(e) => {
                log::error!("[Feeder] Decoder configure failed: {}", e);
                let _ = self.events.send(FeederEvent::DecoderFault {
                    detail: e.to_string(),
                });
                let _ = self.events.send(FeederEvent::RequestKeyframe);
                false
            }
        }
    }

    /// Flush first; rebuild the instance only if the flush also fails.
    fn recover_decoder(&mut self, error: DecoderError) {
        log::warn!("[Feeder] Decoder error: {}", error);
        let _ = self.events.send(FeederEvent::DecoderFault {
            detail: error.to_string(),
        });
        let flushed = match (&error, self.decoder.as_mut()) {
            (DecoderError::IllegalState, Some(decoder)) => decoder.flush().is_ok(),
            _ => false,
        };
        if !flushed {
            self.teardown_decoder();
            self.maybe_configure();
        }
        self.shared
            .waiting_for_keyframe
            .store(true, Ordering::Release);
        self.queued_keyframe_since_reset = false;
        self.stable_renders = 0;
        let _ = self.events.send(FeederEvent::RequestKeyframe);
    }
}

enum ControlFlow {
    Continue,
    Stop,
}
