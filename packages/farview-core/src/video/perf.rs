//! Backpressure signaling and staged performance downgrade.
//!
//! Both controllers are pure state machines fed by the orchestrator: they
//! take observations and return the wire action to perform, which keeps
//! every threshold unit-testable without a socket.

use crate::profile::StreamProfile;
use crate::protocol_constants::{
    BACKPRESSURE_COOLDOWN_MS, BACKPRESSURE_LATE_COUNT, BACKPRESSURE_LATE_MS, PERF_BITRATE_FACTOR,
    PERF_BITRATE_FLOOR, PERF_CRITICAL_FPS, PERF_LOW_FPS, PERF_MIN_SAMPLES, PERF_SUSTAIN_MS,
};

/// Upstream signals produced by [`BackpressureTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSignal {
    /// Consumer is falling behind; producer should slow down.
    Backpressure,
    /// Pressure resolved.
    Clear,
}

/// Detects sustained consumer lag from per-frame processing delay.
pub struct BackpressureTracker {
    late_streak: u32,
    signaled: bool,
    last_signal_ms: u64,
}

impl BackpressureTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            late_streak: 0,
            signaled: false,
            last_signal_ms: 0,
        }
    }

    /// Records one processed frame. `late_ms` is the delay between socket
    /// receive and decode feed.
    pub fn on_frame(&mut self, now_ms: u64, late_ms: u64) -> Option<PressureSignal> {
        if late_ms > BACKPRESSURE_LATE_MS {
            self.late_streak += 1;
            if self.late_streak >= BACKPRESSURE_LATE_COUNT
                && !self.signaled
                && now_ms.saturating_sub(self.last_signal_ms) >= BACKPRESSURE_COOLDOWN_MS
            {
                self.signaled = true;
                self.last_signal_ms = now_ms;
                return Some(PressureSignal::Backpressure);
            }
        } else {
            self.late_streak = 0;
            if self.signaled
                && now_ms.saturating_sub(self.last_signal_ms) >= BACKPRESSURE_COOLDOWN_MS
            {
                self.signaled = false;
                self.last_signal_ms = now_ms;
                return Some(PressureSignal::Clear);
            }
        }
        None
    }
}

impl Default for BackpressureTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire action requested by [`PerfController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfAction {
    /// Seamless bitrate reduction, no decoder reset.
    AdjustBitrate(u32),
    /// Full profile change via SET_STREAM.
    RequestProfile(StreamProfile),
}

/// Staged downgrade controller for sustained low render FPS.
///
/// Acts only when the preview is actually visible and a first frame has been
/// rendered, otherwise warmup periods read as performance trouble.
pub struct PerfController {
    current: StreamProfile,
    perf_level: u8,
    /// Set false once the server is seen overriding a requested resolution;
    /// from then on only bitrate adjustments are issued.
    server_honors_resolution: bool,
    preview_visible: bool,
    first_frame_rendered: bool,
    low_fps_since_ms: Option<u64>,
    low_fps_samples: u32,
    gating_downgrade_done: bool,
}

impl PerfController {
    #[must_use]
    pub fn new(start: StreamProfile) -> Self {
        Self {
            current: start,
            perf_level: 0,
            server_honors_resolution: true,
            preview_visible: false,
            first_frame_rendered: false,
            low_fps_since_ms: None,
            low_fps_samples: 0,
            gating_downgrade_done: false,
        }
    }

    pub fn set_preview_visible(&mut self, visible: bool) {
        self.preview_visible = visible;
        if !visible {
            self.reset_tracking();
        }
    }

    pub fn set_first_frame_rendered(&mut self) {
        self.first_frame_rendered = true;
    }

    /// Whether the server has honored resolution requests so far.
    #[must_use]
    pub fn server_honors_resolution(&self) -> bool {
        self.server_honors_resolution
    }

    /// Current (believed) active profile.
    #[must_use]
    pub fn current_profile(&self) -> StreamProfile {
        self.current
    }

    /// Records the outcome of a SET_STREAM negotiation.
    pub fn on_stream_accepted(
        &mut self,
        requested: Option<StreamProfile>,
        accepted_width: u32,
        accepted_height: u32,
        accepted_bitrate: u32,
        accepted_fps: u32,
    ) {
        if let Some(req) = requested {
            if req.width != accepted_width || req.height != accepted_height {
                if self.server_honors_resolution {
                    log::info!(
                        "[Perf] Server overrode resolution {}x{} -> {}x{}; bitrate-only control from now on",
                        req.width,
                        req.height,
                        accepted_width,
                        accepted_height
                    );
                }
                self.server_honors_resolution = false;
            }
        }
        self.current = StreamProfile {
            width: accepted_width,
            height: accepted_height,
            bitrate: if accepted_bitrate > 0 {
                accepted_bitrate
            } else {
                self.current.bitrate
            },
            fps: accepted_fps,
        };
        self.reset_tracking();
    }

    /// Records a once-per-second render FPS sample.
    pub fn on_fps_sample(&mut self, now_ms: u64, fps: f64) -> Option<PerfAction> {
        if !self.preview_visible || !self.first_frame_rendered {
            return None;
        }
        if fps >= PERF_LOW_FPS {
            self.reset_tracking();
            return None;
        }

        let since = *self.low_fps_since_ms.get_or_insert(now_ms);
        self.low_fps_samples += 1;
        if self.low_fps_samples < PERF_MIN_SAMPLES
            || now_ms.saturating_sub(since) < PERF_SUSTAIN_MS
        {
            return None;
        }
        self.reset_tracking();
        self.pick_downgrade(fps)
    }

    fn pick_downgrade(&mut self, fps: f64) -> Option<PerfAction> {
        if self.current.bitrate > PERF_BITRATE_FLOOR {
            let target = (self.current.bitrate as f64 * PERF_BITRATE_FACTOR).round() as u32;
            let target = target.max(PERF_BITRATE_FLOOR);
            self.current.bitrate = target;
            log::info!("[Perf] Sustained low FPS, adjusting bitrate to {}", target);
            return Some(PerfAction::AdjustBitrate(target));
        }
        if !self.server_honors_resolution {
            // Resolution requests are futile; nothing further to do below the
            // bitrate floor.
            return None;
        }
        if self.perf_level < 1
            && (self.current.width > StreamProfile::PERF_MID.width
                || self.current.height > StreamProfile::PERF_MID.height)
        {
            self.perf_level = 1;
            log::info!("[Perf] Dropping to mid profile");
            return Some(PerfAction::RequestProfile(StreamProfile::PERF_MID));
        }
        if self.perf_level < 2
            && fps < PERF_CRITICAL_FPS
            && self.current.width <= StreamProfile::PERF_MID.width
        {
            self.perf_level = 2;
            log::info!("[Perf] Dropping to floor profile");
            return Some(PerfAction::RequestProfile(StreamProfile::PERF_FLOOR));
        }
        None
    }

    /// One-shot downgrade when keyframe gating has skipped too many frames.
    pub fn on_keyframe_gate_skips(&mut self) -> Option<PerfAction> {
        if self.gating_downgrade_done {
            return None;
        }
        self.gating_downgrade_done = true;
        if !self.server_honors_resolution {
            return None;
        }
        log::info!("[Perf] Keyframe gate churn, requesting low-tier profile once");
        Some(PerfAction::RequestProfile(StreamProfile::LOW))
    }

    /// A decoder reset re-arms the gating downgrade.
    pub fn on_decoder_reset(&mut self) {
        self.gating_downgrade_done = false;
        self.reset_tracking();
    }

    fn reset_tracking(&mut self) {
        self.low_fps_since_ms = None;
        self.low_fps_samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sustained_low_fps(ctrl: &mut PerfController, start_ms: u64, fps: f64) -> Option<PerfAction> {
        let mut action = None;
        for i in 0..7 {
            action = ctrl.on_fps_sample(start_ms + i * 1_000, fps);
            if action.is_some() {
                break;
            }
        }
        action
    }

    fn visible_controller(start: StreamProfile) -> PerfController {
        let mut ctrl = PerfController::new(start);
        ctrl.set_preview_visible(true);
        ctrl.set_first_frame_rendered();
        ctrl
    }

    // ─────────────────────────────────────────────────────────────────────
    // BackpressureTracker
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn backpressure_after_five_consecutive_late_frames() {
        let mut t = BackpressureTracker::new();
        let mut now = 10_000;
        for i in 0..5 {
            let signal = t.on_frame(now, 120);
            if i < 4 {
                assert_eq!(signal, None, "too early at frame {i}");
            } else {
                assert_eq!(signal, Some(PressureSignal::Backpressure));
            }
            now += 33;
        }
    }

    #[test]
    fn on_time_frame_breaks_streak() {
        let mut t = BackpressureTracker::new();
        for _ in 0..4 {
            t.on_frame(10_000, 120);
        }
        assert_eq!(t.on_frame(10_000, 10), None);
        for _ in 0..4 {
            assert_eq!(t.on_frame(10_000, 120), None);
        }
        assert_eq!(t.on_frame(10_000, 120), Some(PressureSignal::Backpressure));
    }

    #[test]
    fn clear_after_cooldown() {
        let mut t = BackpressureTracker::new();
        for _ in 0..5 {
            t.on_frame(10_000, 120);
        }
        // On-time frame inside cooldown: no clear yet.
        assert_eq!(t.on_frame(10_500, 10), None);
        // After cooldown the clear goes out.
        assert_eq!(t.on_frame(11_100, 10), Some(PressureSignal::Clear));
    }

    #[test]
    fn repeated_backpressure_respects_cooldown() {
        let mut t = BackpressureTracker::new();
        for _ in 0..5 {
            t.on_frame(10_000, 120);
        }
        t.on_frame(11_100, 10); // clear
        for i in 0..5 {
            // Cooldown since the clear at 11_100 has not elapsed at 11_500.
            assert_eq!(t.on_frame(11_500 + i, 120), None);
        }
        assert_eq!(
            t.on_frame(12_200, 120),
            Some(PressureSignal::Backpressure)
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // PerfController
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn no_action_before_first_frame() {
        let mut ctrl = PerfController::new(StreamProfile::HIGH);
        ctrl.set_preview_visible(true);
        assert_eq!(sustained_low_fps(&mut ctrl, 0, 10.0), None);
    }

    #[test]
    fn no_action_when_preview_hidden() {
        let mut ctrl = PerfController::new(StreamProfile::HIGH);
        ctrl.set_first_frame_rendered();
        assert_eq!(sustained_low_fps(&mut ctrl, 0, 10.0), None);
    }

    #[test]
    fn first_action_is_bitrate_reduction() {
        let mut ctrl = visible_controller(StreamProfile::HIGH);
        let action = sustained_low_fps(&mut ctrl, 0, 18.0);
        assert_eq!(action, Some(PerfAction::AdjustBitrate(3_500_000)));
    }

    #[test]
    fn requires_sustained_samples_and_duration() {
        let mut ctrl = visible_controller(StreamProfile::HIGH);
        // Four samples over 3 s: not enough of either.
        for i in 0..4 {
            assert_eq!(ctrl.on_fps_sample(i * 1_000, 10.0), None);
        }
        // A healthy sample resets tracking entirely.
        assert_eq!(ctrl.on_fps_sample(4_000, 30.0), None);
        assert_eq!(ctrl.on_fps_sample(5_000, 10.0), None);
    }

    #[test]
    fn below_floor_requests_mid_profile() {
        let mut ctrl = visible_controller(StreamProfile {
            width: 1080,
            height: 1440,
            bitrate: 900_000,
            fps: 30,
        });
        let action = sustained_low_fps(&mut ctrl, 0, 18.0);
        assert_eq!(
            action,
            Some(PerfAction::RequestProfile(StreamProfile::PERF_MID))
        );
    }

    #[test]
    fn critical_fps_at_mid_requests_floor_profile() {
        let mut ctrl = visible_controller(StreamProfile {
            width: 720,
            height: 960,
            bitrate: 900_000,
            fps: 20,
        });
        ctrl.perf_level = 1;
        let action = sustained_low_fps(&mut ctrl, 0, 12.0);
        assert_eq!(
            action,
            Some(PerfAction::RequestProfile(StreamProfile::PERF_FLOOR))
        );
    }

    #[test]
    fn mid_fps_at_mid_profile_does_not_hit_floor() {
        let mut ctrl = visible_controller(StreamProfile {
            width: 720,
            height: 960,
            bitrate: 900_000,
            fps: 20,
        });
        ctrl.perf_level = 1;
        // 17 fps is low but above the critical threshold.
        assert_eq!(sustained_low_fps(&mut ctrl, 0, 17.0), None);
    }

    #[test]
    fn server_resolution_override_limits_to_bitrate() {
        let mut ctrl = visible_controller(StreamProfile {
            width: 480,
            height: 640,
            bitrate: 900_000,
            fps: 30,
        });
        ctrl.on_stream_accepted(
            Some(StreamProfile {
                width: 480,
                height: 640,
                bitrate: 900_000,
                fps: 30,
            }),
            720,
            960,
            900_000,
            30,
        );
        assert!(!ctrl.server_honors_resolution());
        // Below the bitrate floor and resolution requests are off the table.
        assert_eq!(sustained_low_fps(&mut ctrl, 0, 10.0), None);
    }

    #[test]
    fn honored_negotiation_keeps_resolution_control() {
        let mut ctrl = visible_controller(StreamProfile::HIGH);
        ctrl.on_stream_accepted(Some(StreamProfile::HIGH), 1080, 1440, 5_000_000, 30);
        assert!(ctrl.server_honors_resolution());
    }

    #[test]
    fn gate_skip_downgrade_fires_once_until_reset() {
        let mut ctrl = visible_controller(StreamProfile::HIGH);
        assert_eq!(
            ctrl.on_keyframe_gate_skips(),
            Some(PerfAction::RequestProfile(StreamProfile::LOW))
        );
        assert_eq!(ctrl.on_keyframe_gate_skips(), None);
        ctrl.on_decoder_reset();
        assert_eq!(
            ctrl.on_keyframe_gate_skips(),
            Some(PerfAction::RequestProfile(StreamProfile::LOW))
        );
    }
}
