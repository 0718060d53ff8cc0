//! Connection state machine and reconnect policy.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::protocol_constants::{
    RECONNECT_DELAYS_MS, RECONNECT_DELAY_CAP_MS, RECONNECT_RESET_AFTER_MS,
};

/// Connection state of a viewer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Authenticated but no frame rendered yet.
    Authenticated,
    /// Link alive (PONGs flowing) but video stalled; UI shows "No Video".
    Connected,
    /// Mid-stream reconfiguration or stall recovery in progress.
    Recovering,
    /// Frames are being rendered.
    Streaming,
    /// Stream intentionally stopped by the primary.
    Idle,
}

impl ConnectionState {
    /// Progress rank backing [`StateCell::post`]'s downgrade guard.
    ///
    /// Ranks compare session progress, not enum declaration order; downgrade
    /// rules must never depend on ordinals.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Idle => 2,
            Self::Connected => 3,
            Self::Authenticated => 4,
            Self::Recovering => 5,
            Self::Streaming => 6,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Authenticated,
            3 => Self::Connected,
            4 => Self::Recovering,
            5 => Self::Streaming,
            6 => Self::Idle,
            _ => Self::Disconnected,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Authenticated => 2,
            Self::Connected => 3,
            Self::Recovering => 4,
            Self::Streaming => 5,
            Self::Idle => 6,
        }
    }
}

/// Lock-free holder for the current connection state.
///
/// Enforces the downgrade rule: a stale AUTHENTICATED post must not regress a
/// session that already reached STREAMING or RECOVERING.
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    /// Creates a cell in DISCONNECTED.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Posts a new state. Returns `Some(new)` when the state changed, `None`
    /// when the post was a no-op (same state, or suppressed downgrade).
    pub fn post(&self, new: ConnectionState) -> Option<ConnectionState> {
        loop {
            let cur_raw = self.state.load(Ordering::Acquire);
            let cur = ConnectionState::from_u8(cur_raw);
            if cur == new {
                return None;
            }
            // A stale AUTHENTICATED callback must not regress a session that
            // has made more progress (RECOVERING or STREAMING outrank it).
            if new == ConnectionState::Authenticated && cur.rank() > new.rank() {
                log::debug!(
                    "[State] Suppressed stale downgrade {:?} -> {:?}",
                    cur,
                    new
                );
                return None;
            }
            if self
                .state
                .compare_exchange(cur_raw, new.to_u8(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::info!("[State] {:?} -> {:?}", cur, new);
                return Some(new);
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential reconnect backoff: 1 s, 2 s, 4 s, 8 s, capped at 10 s.
///
/// The attempt counter resets when a connection survives long enough to be
/// considered healthy.
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Delay before the next reconnect attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        let ms = RECONNECT_DELAYS_MS
            .get(self.attempt as usize)
            .copied()
            .unwrap_or(RECONNECT_DELAY_CAP_MS);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(ms)
    }

    /// Records how long the last connection survived.
    pub fn note_connection_lasted(&mut self, lasted: Duration) {
        if lasted.as_millis() as u64 >= RECONNECT_RESET_AFTER_MS {
            self.attempt = 0;
        }
    }

    /// Resets the counter unconditionally (explicit user reconnect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_changes_state() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert_eq!(
            cell.post(ConnectionState::Connecting),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[test]
    fn duplicate_post_is_noop() {
        let cell = StateCell::new();
        cell.post(ConnectionState::Connecting);
        assert_eq!(cell.post(ConnectionState::Connecting), None);
    }

    #[test]
    fn authenticated_does_not_regress_streaming() {
        let cell = StateCell::new();
        cell.post(ConnectionState::Streaming);
        assert_eq!(cell.post(ConnectionState::Authenticated), None);
        assert_eq!(cell.get(), ConnectionState::Streaming);
    }

    #[test]
    fn authenticated_does_not_regress_recovering() {
        let cell = StateCell::new();
        cell.post(ConnectionState::Recovering);
        assert_eq!(cell.post(ConnectionState::Authenticated), None);
        assert_eq!(cell.get(), ConnectionState::Recovering);
    }

    #[test]
    fn authenticated_applies_from_connecting() {
        let cell = StateCell::new();
        cell.post(ConnectionState::Connecting);
        assert_eq!(
            cell.post(ConnectionState::Authenticated),
            Some(ConnectionState::Authenticated)
        );
    }

    #[test]
    fn other_downgrades_are_allowed() {
        let cell = StateCell::new();
        cell.post(ConnectionState::Streaming);
        assert_eq!(
            cell.post(ConnectionState::Connected),
            Some(ConnectionState::Connected)
        );
    }

    #[test]
    fn rank_orders_progress() {
        use ConnectionState::*;
        assert!(Streaming.rank() > Recovering.rank());
        assert!(Recovering.rank() > Authenticated.rank());
        assert!(Authenticated.rank() > Connected.rank());
        assert!(Connected.rank() > Idle.rank());
        assert!(Idle.rank() > Connecting.rank());
        assert!(Connecting.rank() > Disconnected.rank());
    }

    #[test]
    fn backoff_ladder_and_cap() {
        let mut b = ReconnectBackoff::new();
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn backoff_resets_after_healthy_connection() {
        let mut b = ReconnectBackoff::new();
        b.next_delay();
        b.next_delay();
        b.note_connection_lasted(Duration::from_millis(2_500));
        assert_eq!(b.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_keeps_counting_after_short_connection() {
        let mut b = ReconnectBackoff::new();
        b.next_delay();
        b.note_connection_lasted(Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_millis(2_000));
    }
}
