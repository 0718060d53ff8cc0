//! Observer callbacks for embedding UIs.
//!
//! The session reports everything a UI needs through [`ViewerObserver`].
//! Callbacks are dispatched from a single serial task so observers never see
//! interleaved or reordered notifications.

mod observer;

pub use observer::{LoggingObserver, NoopObserver, ViewerObserver};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::state::ConnectionState;

/// Notifications fanned out to the observer, in emit order.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    State(ConnectionState),
    Error(String),
    Rotation(i32),
    Recording(bool),
    /// Display size of the video (negotiated, or coded once known).
    VideoSize { width: u32, height: u32 },
    /// Visible crop within the coded picture.
    VideoCrop {
        width: u32,
        height: u32,
        coded_width: u32,
        coded_height: u32,
    },
    FirstFrameRendered,
    CameraFacing(String),
    CommEnabled(bool),
}

/// Serializes observer callbacks onto one task.
///
/// Emitters call [`ObserverDispatcher::emit`] from any task or thread; the
/// dispatch loop invokes the observer in order. Dropping the dispatcher ends
/// the loop after the queue drains.
#[derive(Clone)]
pub struct ObserverDispatcher {
    tx: mpsc::UnboundedSender<ViewerEvent>,
}

impl ObserverDispatcher {
    /// Spawns the dispatch loop onto the current runtime.
    pub fn spawn(observer: Arc<dyn ViewerObserver>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ViewerEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(&*observer, event);
            }
        });
        Self { tx }
    }

    /// Queues an event for delivery. Events after shutdown are dropped.
    pub fn emit(&self, event: ViewerEvent) {
        let _ = self.tx.send(event);
    }
}

fn dispatch(observer: &dyn ViewerObserver, event: ViewerEvent) {
    match event {
        ViewerEvent::State(state) => observer.on_state(state),
        ViewerEvent::Error(message) => observer.on_error(&message),
        ViewerEvent::Rotation(deg) => observer.on_rotation(deg),
        ViewerEvent::Recording(active) => observer.on_recording(active),
        ViewerEvent::VideoSize { width, height } => observer.on_video_size(width, height),
        ViewerEvent::VideoCrop {
            width,
            height,
            coded_width,
            coded_height,
        } => observer.on_video_crop(width, height, coded_width, coded_height),
        ViewerEvent::FirstFrameRendered => observer.on_first_frame_rendered(),
        ViewerEvent::CameraFacing(facing) => observer.on_camera_facing(&facing),
        ViewerEvent::CommEnabled(enabled) => observer.on_comm_enabled(enabled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl ViewerObserver for RecordingObserver {
        fn on_state(&self, state: ConnectionState) {
            self.events.lock().push(format!("state:{state:?}"));
        }

        fn on_video_size(&self, width: u32, height: u32) {
            self.events.lock().push(format!("size:{width}x{height}"));
        }

        fn on_first_frame_rendered(&self) {
            self.events.lock().push("first-frame".into());
        }
    }

    #[tokio::test]
    async fn dispatches_in_emit_order() {
        let observer = Arc::new(RecordingObserver::default());
        let dispatcher = ObserverDispatcher::spawn(observer.clone());

        dispatcher.emit(ViewerEvent::State(ConnectionState::Connecting));
        dispatcher.emit(ViewerEvent::VideoSize {
            width: 1080,
            height: 1440,
        });
        dispatcher.emit(ViewerEvent::FirstFrameRendered);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            *observer.events.lock(),
            vec![
                "state:Connecting".to_string(),
                "size:1080x1440".to_string(),
                "first-frame".to_string(),
            ]
        );
    }
}
