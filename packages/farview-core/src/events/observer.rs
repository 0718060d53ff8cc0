//! Observer trait and stock implementations.

use crate::state::ConnectionState;

/// Callbacks a viewer UI implements to follow session progress.
///
/// All methods have empty default bodies so embedders override only what they
/// render. Callbacks arrive on a single serial dispatch task and must return
/// quickly.
pub trait ViewerObserver: Send + Sync {
    /// Connection state changed.
    fn on_state(&self, _state: ConnectionState) {}

    /// A user-facing error message should be shown.
    fn on_error(&self, _message: &str) {}

    /// Encoder rotation metadata changed (UI hint only; frames are not
    /// rotated by the core).
    fn on_rotation(&self, _degrees: i32) {}

    /// Recording started/stopped on the primary.
    fn on_recording(&self, _active: bool) {}

    /// Display size of the video became known or changed.
    fn on_video_size(&self, _width: u32, _height: u32) {}

    /// Visible crop within the coded picture changed.
    fn on_video_crop(&self, _width: u32, _height: u32, _coded_width: u32, _coded_height: u32) {}

    /// First real frame reached the display surface.
    fn on_first_frame_rendered(&self) {}

    /// Active camera reported by the primary ("front"/"back").
    fn on_camera_facing(&self, _facing: &str) {}

    /// Two-way audio enabled state changed.
    fn on_comm_enabled(&self, _enabled: bool) {}
}

/// Observer that ignores everything. Used by headless sessions.
pub struct NoopObserver;

impl ViewerObserver for NoopObserver {}

/// Observer that logs every callback at debug level.
pub struct LoggingObserver;

impl ViewerObserver for LoggingObserver {
    fn on_state(&self, state: ConnectionState) {
        tracing::debug!(?state, "viewer_state");
    }

    fn on_error(&self, message: &str) {
        tracing::debug!(message, "viewer_error");
    }

    fn on_rotation(&self, degrees: i32) {
        tracing::debug!(degrees, "viewer_rotation");
    }

    fn on_recording(&self, active: bool) {
        tracing::debug!(active, "viewer_recording");
    }

    fn on_video_size(&self, width: u32, height: u32) {
        tracing::debug!(width, height, "viewer_video_size");
    }

    fn on_video_crop(&self, width: u32, height: u32, coded_width: u32, coded_height: u32) {
        tracing::debug!(width, height, coded_width, coded_height, "viewer_video_crop");
    }

    fn on_first_frame_rendered(&self) {
        tracing::debug!("viewer_first_frame");
    }

    fn on_camera_facing(&self, facing: &str) {
        tracing::debug!(facing, "viewer_camera_facing");
    }

    fn on_comm_enabled(&self, enabled: bool) {
        tracing::debug!(enabled, "viewer_comm");
    }
}
