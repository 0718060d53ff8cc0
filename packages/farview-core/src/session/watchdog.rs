//! Health counters and watchdog evaluation.
//!
//! The heartbeat task calls [`Watchdogs::tick`] every interval; the returned
//! actions are applied by the orchestrator. Keeping the evaluation pure (time
//! in, actions out) makes every threshold testable without sockets or sleeps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::protocol_constants::{
    AUDIO_ACTIVE_WINDOW_MS, CONNECTED_KEYFRAME_PROBE_MS, CONNECTED_RECONNECT_MS,
    CONNECTED_RENEGOTIATE_MS, CONNECTED_STALLED_RECONNECT_MS, HANDSHAKE_AUTH_TIMEOUT_MS,
    HANDSHAKE_KICK_AFTER_MS, HANDSHAKE_KICK_MIN_GAP_MS, HANDSHAKE_NO_FRAMES_DOWNGRADE_MS,
    HANDSHAKE_NO_FRAMES_RECONNECT_MS, PONG_TIMEOUT_AUDIO_MS, PONG_TIMEOUT_GRACE_MS,
    PONG_TIMEOUT_MS, RECONFIGURE_GRACE_MAX_QUIESCENCE_MS, RECONFIGURE_GRACE_MS, STREAM_STALL_MS,
};
use crate::state::ConnectionState;

/// Per-session health counters. All timestamps are monotonic milliseconds;
/// zero means "never this connection".
pub struct Health {
    pub connect_started_ms: AtomicU64,
    pub last_pong_ms: AtomicU64,
    pub last_frame_rx_ms: AtomicU64,
    pub last_frame_render_ms: AtomicU64,
    pub last_audio_rx_ms: AtomicU64,
    pub last_auth_ok_ms: AtomicU64,
    pub last_stream_accepted_ms: AtomicU64,
    pub last_csd_ms: AtomicU64,
    pub last_kick_ms: AtomicU64,
    pub connected_entered_ms: AtomicU64,
    /// Reconfigure grace deadline; extended, never shortened.
    pub grace_deadline_ms: AtomicU64,
    /// Whether any frame arrived this connection.
    pub had_video: AtomicBool,
}

impl Health {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_started_ms: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(0),
            last_frame_rx_ms: AtomicU64::new(0),
            last_frame_render_ms: AtomicU64::new(0),
            last_audio_rx_ms: AtomicU64::new(0),
            last_auth_ok_ms: AtomicU64::new(0),
            last_stream_accepted_ms: AtomicU64::new(0),
            last_csd_ms: AtomicU64::new(0),
            last_kick_ms: AtomicU64::new(0),
            connected_entered_ms: AtomicU64::new(0),
            grace_deadline_ms: AtomicU64::new(0),
            had_video: AtomicBool::new(false),
        }
    }

    /// Clears per-connection counters at the start of a connection attempt.
    /// The grace deadline survives: it describes the stream, not the socket.
    pub fn reset_for_connection(&self, now_ms: u64) {
        self.connect_started_ms.store(now_ms, Ordering::Release);
        self.last_pong_ms.store(0, Ordering::Release);
        self.last_frame_rx_ms.store(0, Ordering::Release);
        self.last_frame_render_ms.store(0, Ordering::Release);
        self.last_audio_rx_ms.store(0, Ordering::Release);
        self.last_auth_ok_ms.store(0, Ordering::Release);
        self.last_stream_accepted_ms.store(0, Ordering::Release);
        self.last_csd_ms.store(0, Ordering::Release);
        self.last_kick_ms.store(0, Ordering::Release);
        self.connected_entered_ms.store(0, Ordering::Release);
        self.had_video.store(false, Ordering::Release);
    }

    pub fn mark_frame_rx(&self, now_ms: u64) {
        self.last_frame_rx_ms.store(now_ms, Ordering::Release);
        self.had_video.store(true, Ordering::Release);
    }

    /// Extends the grace deadline; a shorter extension never shrinks it.
    pub fn extend_grace(&self, now_ms: u64, duration_ms: u64) {
        let candidate = now_ms + duration_ms;
        self.grace_deadline_ms
            .fetch_max(candidate, Ordering::AcqRel);
    }

    #[must_use]
    pub fn in_grace(&self, now_ms: u64) -> bool {
        now_ms < self.grace_deadline_ms.load(Ordering::Acquire)
    }

    fn audio_active(&self, now_ms: u64) -> bool {
        let last = self.last_audio_rx_ms.load(Ordering::Acquire);
        last > 0 && now_ms.saturating_sub(last) <= AUDIO_ACTIVE_WINDOW_MS
    }

    /// Last sign of life from the primary on this connection.
    fn last_activity_ms(&self, now_ms: u64) -> u64 {
        self.last_pong_ms
            .load(Ordering::Acquire)
            .max(self.last_frame_rx_ms.load(Ordering::Acquire))
            .max(self.last_audio_rx_ms.load(Ordering::Acquire))
            .max(self.connect_started_ms.load(Ordering::Acquire))
            .min(now_ms)
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

/// Corrective actions produced by a watchdog tick, applied in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Close the socket and reconnect per backoff.
    Reconnect,
    /// Resend CAPS + SET_STREAM + REQ_KEYFRAME (handshake stalled).
    KickNegotiation,
    /// Send a REQ_KEYFRAME probe.
    RequestKeyframe,
    /// Renegotiate CAPS + SET_STREAM and post RECOVERING.
    Renegotiate,
    /// Post CONNECTED ("No Video").
    DowngradeToConnected,
    /// Extend the reconfigure grace window instead of disconnecting.
    ExtendGrace,
}

/// Watchdog evaluation state. One per session; survives reconnects.
pub struct Watchdogs {
    last_probe_ms: u64,
    last_renegotiate_ms: u64,
}

impl Watchdogs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_probe_ms: 0,
            last_renegotiate_ms: 0,
        }
    }

    /// Evaluates every watchdog for the current heartbeat tick.
    pub fn tick(
        &mut self,
        now_ms: u64,
        state: ConnectionState,
        health: &Health,
    ) -> Vec<WatchdogAction> {
        match state {
            ConnectionState::Connecting => self.tick_connecting(now_ms, health),
            ConnectionState::Authenticated => self.tick_authenticated(now_ms, health),
            ConnectionState::Connected => self.tick_connected(now_ms, health),
            ConnectionState::Streaming | ConnectionState::Recovering => {
                self.tick_streaming(now_ms, health)
            }
            ConnectionState::Disconnected | ConnectionState::Idle => Vec::new(),
        }
    }

    fn tick_connecting(&mut self, now_ms: u64, health: &Health) -> Vec<WatchdogAction> {
        let started = health.connect_started_ms.load(Ordering::Acquire);
        let authed = health.last_auth_ok_ms.load(Ordering::Acquire) > 0;
        if !authed && started > 0 && now_ms.saturating_sub(started) >= HANDSHAKE_AUTH_TIMEOUT_MS {
            log::warn!("[Watchdog] No AUTH_OK within handshake timeout");
            return vec![WatchdogAction::Reconnect];
        }
        Vec::new()
    }

    fn tick_authenticated(&mut self, now_ms: u64, health: &Health) -> Vec<WatchdogAction> {
        let auth_ok = health.last_auth_ok_ms.load(Ordering::Acquire);
        if auth_ok == 0 || health.last_frame_rx_ms.load(Ordering::Acquire) > 0 {
            return Vec::new();
        }
        let since_auth = now_ms.saturating_sub(auth_ok);
        let mut actions = Vec::new();

        let negotiated = health.last_stream_accepted_ms.load(Ordering::Acquire) > 0
            || health.last_csd_ms.load(Ordering::Acquire) > 0;
        let last_kick = health.last_kick_ms.load(Ordering::Acquire);
        if !negotiated
            && since_auth >= HANDSHAKE_KICK_AFTER_MS
            && now_ms.saturating_sub(last_kick.max(auth_ok)) >= HANDSHAKE_KICK_MIN_GAP_MS
        {
            log::info!("[Watchdog] Handshake quiet after AUTH_OK, re-kicking negotiation");
            actions.push(WatchdogAction::KickNegotiation);
        }

        if since_auth >= HANDSHAKE_NO_FRAMES_RECONNECT_MS && !health.in_grace(now_ms) {
            log::warn!("[Watchdog] Authenticated but no frames, reconnecting");
            actions.push(WatchdogAction::Reconnect);
        } else if since_auth >= HANDSHAKE_NO_FRAMES_DOWNGRADE_MS {
            actions.push(WatchdogAction::DowngradeToConnected);
        }
        actions
    }

    fn tick_connected(&mut self, now_ms: u64, health: &Health) -> Vec<WatchdogAction> {
        let mut actions = Vec::new();
        let in_grace = health.in_grace(now_ms);
        let audio = health.audio_active(now_ms);

        // Grace caps quiescence instead of using the normal ladder.
        if in_grace {
            let quiet = now_ms.saturating_sub(health.last_activity_ms(now_ms));
            if quiet >= RECONFIGURE_GRACE_MAX_QUIESCENCE_MS {
                log::warn!("[Watchdog] Grace quiescence ceiling hit, reconnecting");
                return vec![WatchdogAction::Reconnect];
            }
        }

        // PONG starvation.
        let pong_timeout = if in_grace {
            PONG_TIMEOUT_GRACE_MS
        } else if audio {
            PONG_TIMEOUT_AUDIO_MS
        } else {
            PONG_TIMEOUT_MS
        };
        let pong_baseline = health
            .last_pong_ms
            .load(Ordering::Acquire)
            .max(health.connect_started_ms.load(Ordering::Acquire));
        if !in_grace && pong_baseline > 0 && now_ms.saturating_sub(pong_baseline) >= pong_timeout {
            log::warn!("[Watchdog] PONG starvation ({} ms), reconnecting", pong_timeout);
            return vec![WatchdogAction::Reconnect];
        }

        // Periodic keyframe probe.
        if now_ms.saturating_sub(self.last_probe_ms) >= CONNECTED_KEYFRAME_PROBE_MS {
            self.last_probe_ms = now_ms;
            actions.push(WatchdogAction::RequestKeyframe);
        }

        let entered = health.connected_entered_ms.load(Ordering::Acquire);
        let in_connected_ms = now_ms.saturating_sub(entered);
        let had_video = health.had_video.load(Ordering::Acquire);

        // Renegotiate: after a stretch of CONNECTED, or immediately when video
        // was flowing and then stalled into CONNECTED.
        if entered > 0
            && (in_connected_ms >= CONNECTED_RENEGOTIATE_MS || had_video)
            && now_ms.saturating_sub(self.last_renegotiate_ms) >= CONNECTED_RENEGOTIATE_MS
        {
            self.last_renegotiate_ms = now_ms;
            actions.push(WatchdogAction::Renegotiate);
        }

        // Stuck: give up and reconnect, unless audio or grace argues for
        // patience.
        let stalled_after_video = had_video
            && entered > 0
            && in_connected_ms >= CONNECTED_STALLED_RECONNECT_MS;
        let stuck = entered > 0
            && (in_connected_ms >= CONNECTED_RECONNECT_MS || stalled_after_video);
        if stuck {
            if audio || in_grace {
                health.extend_grace(now_ms, RECONFIGURE_GRACE_MS);
                actions.push(WatchdogAction::ExtendGrace);
            } else {
                actions.push(WatchdogAction::Reconnect);
            }
        }
        actions
    }

    fn tick_streaming(&mut self, now_ms: u64, health: &Health) -> Vec<WatchdogAction> {
        let last_rx = health.last_frame_rx_ms.load(Ordering::Acquire);
        if last_rx > 0 && now_ms.saturating_sub(last_rx) >= STREAM_STALL_MS {
            // Downgrade without touching the decoder; a reset here would
            // flicker the surface for what is usually a brief stall.
            return vec![
                WatchdogAction::DowngradeToConnected,
                WatchdogAction::RequestKeyframe,
            ];
        }
        Vec::new()
    }
}

impl Default for Watchdogs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 100_000;

    fn health_connected_at(now: u64) -> Health {
        let h = Health::new();
        h.reset_for_connection(now);
        h
    }

    // ─────────────────────────────────────────────────────────────────────
    // Handshake watchdog
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn connecting_times_out_without_auth_ok() {
        let h = health_connected_at(T0);
        let mut w = Watchdogs::new();
        assert!(w.tick(T0 + 5_000, ConnectionState::Connecting, &h).is_empty());
        assert_eq!(
            w.tick(T0 + 10_000, ConnectionState::Connecting, &h),
            vec![WatchdogAction::Reconnect]
        );
    }

    #[test]
    fn connecting_is_quiet_after_auth_ok() {
        let h = health_connected_at(T0);
        h.last_auth_ok_ms.store(T0 + 500, Ordering::Release);
        let mut w = Watchdogs::new();
        assert!(w.tick(T0 + 11_000, ConnectionState::Connecting, &h).is_empty());
    }

    #[test]
    fn authenticated_kicks_negotiation_when_quiet() {
        let h = health_connected_at(T0);
        h.last_auth_ok_ms.store(T0, Ordering::Release);
        let mut w = Watchdogs::new();

        // 2 s after AUTH_OK: too early.
        assert!(w
            .tick(T0 + 2_000, ConnectionState::Authenticated, &h)
            .is_empty());
        // 3 s: kick.
        assert_eq!(
            w.tick(T0 + 3_000, ConnectionState::Authenticated, &h),
            vec![WatchdogAction::KickNegotiation]
        );
    }

    #[test]
    fn kick_respects_min_gap() {
        let h = health_connected_at(T0);
        h.last_auth_ok_ms.store(T0, Ordering::Release);
        h.last_kick_ms.store(T0 + 3_000, Ordering::Release);
        let mut w = Watchdogs::new();
        assert!(w
            .tick(T0 + 4_000, ConnectionState::Authenticated, &h)
            .is_empty());
        assert_eq!(
            w.tick(T0 + 5_600, ConnectionState::Authenticated, &h),
            vec![WatchdogAction::KickNegotiation]
        );
    }

    #[test]
    fn no_kick_once_negotiation_answered() {
        let h = health_connected_at(T0);
        h.last_auth_ok_ms.store(T0, Ordering::Release);
        h.last_csd_ms.store(T0 + 1_000, Ordering::Release);
        let mut w = Watchdogs::new();
        assert!(w
            .tick(T0 + 4_000, ConnectionState::Authenticated, &h)
            .is_empty());
    }

    #[test]
    fn authenticated_downgrades_then_reconnects_without_frames() {
        let h = health_connected_at(T0);
        h.last_auth_ok_ms.store(T0, Ordering::Release);
        h.last_csd_ms.store(T0 + 100, Ordering::Release);
        let mut w = Watchdogs::new();

        let actions = w.tick(T0 + 12_000, ConnectionState::Authenticated, &h);
        assert_eq!(actions, vec![WatchdogAction::DowngradeToConnected]);

        let actions = w.tick(T0 + 25_000, ConnectionState::Authenticated, &h);
        assert_eq!(actions, vec![WatchdogAction::Reconnect]);
    }

    #[test]
    fn authenticated_reconnect_deferred_by_grace() {
        let h = health_connected_at(T0);
        h.last_auth_ok_ms.store(T0, Ordering::Release);
        h.last_csd_ms.store(T0 + 100, Ordering::Release);
        h.extend_grace(T0, 60_000);
        let mut w = Watchdogs::new();
        let actions = w.tick(T0 + 25_000, ConnectionState::Authenticated, &h);
        assert_eq!(actions, vec![WatchdogAction::DowngradeToConnected]);
    }

    #[test]
    fn frames_silence_the_handshake_watchdog() {
        let h = health_connected_at(T0);
        h.last_auth_ok_ms.store(T0, Ordering::Release);
        h.mark_frame_rx(T0 + 1_000);
        let mut w = Watchdogs::new();
        assert!(w
            .tick(T0 + 30_000, ConnectionState::Authenticated, &h)
            .is_empty());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connected watchdog
    // ─────────────────────────────────────────────────────────────────────

    fn connected_health(now: u64) -> Health {
        let h = health_connected_at(now);
        h.last_auth_ok_ms.store(now, Ordering::Release);
        h.connected_entered_ms.store(now, Ordering::Release);
        h.last_pong_ms.store(now, Ordering::Release);
        h
    }

    #[test]
    fn pong_starvation_reconnects_at_default_timeout() {
        let h = connected_health(T0);
        let mut w = Watchdogs::new();
        assert!(!w
            .tick(T0 + 6_000, ConnectionState::Connected, &h)
            .contains(&WatchdogAction::Reconnect));
        assert_eq!(
            w.tick(T0 + 7_000, ConnectionState::Connected, &h),
            vec![WatchdogAction::Reconnect]
        );
    }

    #[test]
    fn pong_timeout_extends_while_audio_active() {
        let h = connected_health(T0);
        let mut w = Watchdogs::new();
        // Audio arriving keeps the session alive past 7 s.
        h.last_audio_rx_ms.store(T0 + 9_500, Ordering::Release);
        let actions = w.tick(T0 + 10_000, ConnectionState::Connected, &h);
        assert!(!actions.contains(&WatchdogAction::Reconnect), "{actions:?}");

        // Past 15 s with audio still active: reconnect.
        h.last_audio_rx_ms.store(T0 + 14_500, Ordering::Release);
        let actions = w.tick(T0 + 15_000, ConnectionState::Connected, &h);
        assert!(actions.contains(&WatchdogAction::Reconnect), "{actions:?}");
    }

    #[test]
    fn keyframe_probe_every_five_seconds() {
        let h = connected_health(T0);
        // Keep pongs fresh so probes are the only action.
        let mut w = Watchdogs::new();
        let mut probes = 0;
        for tick in 0..7 {
            let now = T0 + tick * 2_000;
            h.last_pong_ms.store(now, Ordering::Release);
            let actions = w.tick(now, ConnectionState::Connected, &h);
            probes += actions
                .iter()
                .filter(|a| **a == WatchdogAction::RequestKeyframe)
                .count();
        }
        // 12 s window, probes at 0, 6, 12 (5 s minimum spacing on a 2 s tick).
        assert_eq!(probes, 3);
    }

    #[test]
    fn renegotiates_after_fifteen_seconds_connected() {
        let h = connected_health(T0);
        let mut w = Watchdogs::new();
        let mut saw_renegotiate = false;
        for tick in 0..9 {
            let now = T0 + tick * 2_000;
            h.last_pong_ms.store(now, Ordering::Release);
            let actions = w.tick(now, ConnectionState::Connected, &h);
            if actions.contains(&WatchdogAction::Renegotiate) {
                assert!(now - T0 >= 15_000, "renegotiated too early at {}", now - T0);
                saw_renegotiate = true;
            }
        }
        assert!(saw_renegotiate);
    }

    #[test]
    fn renegotiates_promptly_after_video_stall() {
        let h = connected_health(T0);
        h.mark_frame_rx(T0); // video had been flowing
        let mut w = Watchdogs::new();
        h.last_pong_ms.store(T0 + 2_000, Ordering::Release);
        let actions = w.tick(T0 + 2_000, ConnectionState::Connected, &h);
        assert!(actions.contains(&WatchdogAction::Renegotiate), "{actions:?}");
    }

    #[test]
    fn stuck_connected_reconnects_at_45s() {
        let h = connected_health(T0);
        let mut w = Watchdogs::new();
        h.last_pong_ms.store(T0 + 44_000, Ordering::Release);
        let actions = w.tick(T0 + 45_000, ConnectionState::Connected, &h);
        assert!(actions.contains(&WatchdogAction::Reconnect), "{actions:?}");
    }

    #[test]
    fn stalled_after_video_reconnects_at_10s() {
        let h = connected_health(T0);
        h.mark_frame_rx(T0);
        let mut w = Watchdogs::new();
        h.last_pong_ms.store(T0 + 9_000, Ordering::Release);
        let actions = w.tick(T0 + 10_000, ConnectionState::Connected, &h);
        assert!(actions.contains(&WatchdogAction::Reconnect), "{actions:?}");
    }

    #[test]
    fn stuck_with_audio_extends_grace_instead() {
        let h = connected_health(T0);
        h.mark_frame_rx(T0);
        let mut w = Watchdogs::new();
        h.last_pong_ms.store(T0 + 9_500, Ordering::Release);
        h.last_audio_rx_ms.store(T0 + 9_500, Ordering::Release);
        let actions = w.tick(T0 + 10_000, ConnectionState::Connected, &h);
        assert!(actions.contains(&WatchdogAction::ExtendGrace), "{actions:?}");
        assert!(!actions.contains(&WatchdogAction::Reconnect));
        assert!(h.in_grace(T0 + 10_000));
    }

    #[test]
    fn grace_defers_reconnect_until_quiescence_ceiling() {
        let h = connected_health(T0);
        h.extend_grace(T0, 60_000);
        let mut w = Watchdogs::new();

        // Deep in what would normally be a reconnect, grace holds the line.
        h.last_pong_ms.store(T0, Ordering::Release);
        let actions = w.tick(T0 + 20_000, ConnectionState::Connected, &h);
        assert!(!actions.contains(&WatchdogAction::Reconnect), "{actions:?}");

        // Total quiescence past the hard ceiling reconnects even in grace.
        h.extend_grace(T0 + 20_000, 200_000);
        let actions = w.tick(T0 + 121_000, ConnectionState::Connected, &h);
        assert!(actions.contains(&WatchdogAction::Reconnect), "{actions:?}");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stream-health watchdog
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn streaming_stall_downgrades_and_probes() {
        let h = health_connected_at(T0);
        h.mark_frame_rx(T0 + 1_000);
        let mut w = Watchdogs::new();

        assert!(w
            .tick(T0 + 2_500, ConnectionState::Streaming, &h)
            .is_empty());
        assert_eq!(
            w.tick(T0 + 3_000, ConnectionState::Streaming, &h),
            vec![
                WatchdogAction::DowngradeToConnected,
                WatchdogAction::RequestKeyframe
            ]
        );
    }

    #[test]
    fn recovering_stall_also_downgrades() {
        let h = health_connected_at(T0);
        h.mark_frame_rx(T0 + 1_000);
        let mut w = Watchdogs::new();
        let actions = w.tick(T0 + 4_000, ConnectionState::Recovering, &h);
        assert!(actions.contains(&WatchdogAction::DowngradeToConnected));
    }

    #[test]
    fn grace_extends_but_never_shortens() {
        let h = Health::new();
        h.extend_grace(1_000, 50_000); // deadline 51_000
        h.extend_grace(2_000, 10_000); // candidate 12_000, keeps 51_000
        assert!(h.in_grace(50_999));
        assert!(!h.in_grace(51_000));
    }

    #[test]
    fn idle_and_disconnected_are_quiet() {
        let h = connected_health(T0);
        let mut w = Watchdogs::new();
        assert!(w.tick(T0 + 60_000, ConnectionState::Idle, &h).is_empty());
        assert!(w
            .tick(T0 + 60_000, ConnectionState::Disconnected, &h)
            .is_empty());
    }
}
