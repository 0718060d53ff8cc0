//! Video receive pipeline: jitter buffer, decode feeder, performance control.

mod feeder;
mod jitter;
mod perf;

pub use feeder::{DecodeFeeder, FeederCommand, FeederConfig, FeederEvent};
pub use jitter::{JitterBuffer, VideoFrame};
pub use perf::{BackpressureTracker, PerfAction, PerfController, PressureSignal};

use std::sync::atomic::{AtomicBool, AtomicU64};

/// State shared between the socket reader, the decode feeder and the
/// watchdogs. Single-field atomic updates only; no compound invariants.
pub struct VideoShared {
    /// Decoder must not be fed non-key frames while set.
    pub waiting_for_keyframe: AtomicBool,
    /// Current stream epoch; frames from other epochs are dropped.
    pub current_epoch: AtomicU64,
    /// Set while decode is paused (surface detached, stream paused).
    pub paused: AtomicBool,
    /// Monotonic ms of the last received FRAME.
    pub last_rx_ms: AtomicU64,
}

impl VideoShared {
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiting_for_keyframe: AtomicBool::new(true),
            current_epoch: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            last_rx_ms: AtomicU64::new(0),
        }
    }
}

impl Default for VideoShared {
    fn default() -> Self {
        Self::new()
    }
}
