//! Talkback uplink: microphone capture → soft gain → AUDIO_FRAME dir=up.
//!
//! Capture runs on its own thread because microphone reads block. The capture
//! loop reuses one buffer, so each frame is copied before gain is applied.
//! Soft gain nudges quiet speech toward a target RMS without ever exceeding
//! a fixed ceiling, with saturating arithmetic on the way back to i16.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol_constants::{
    UPLINK_FRAME_MS, UPLINK_MAX_GAIN, UPLINK_SAMPLE_RATE, UPLINK_TARGET_RMS,
};
use crate::traits::AudioCapture;
use crate::wire::{AudioCodec, AudioDir, AudioFrameHeader};

use super::gate::rms_i16le;

/// Smoothing factor for the per-frame gain estimate.
const GAIN_SMOOTHING: f64 = 0.2;

/// One outbound talkback frame, ready for the session writer.
pub struct UplinkFrame {
    pub header: AudioFrameHeader,
    pub payload: Bytes,
}

/// Active talkback session. At most one exists per viewer session.
pub struct Talkback {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Talkback {
    /// Starts capturing and emitting uplink frames.
    pub fn start(mut capture: Box<dyn AudioCapture>, out: UnboundedSender<UplinkFrame>) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let run = Arc::clone(&active);

        let handle = std::thread::Builder::new()
            .name("fv-audio-capture".into())
            .spawn(move || {
                let frame_bytes =
                    (UPLINK_SAMPLE_RATE as usize / 1_000) * UPLINK_FRAME_MS as usize * 2;
                let mut capture_buf = vec![0u8; frame_bytes];
                let mut gain = 1.0f64;
                let mut ts_us: i64 = 0;

                log::info!("[Talkback] Capture started ({} byte frames)", frame_bytes);
                while run.load(Ordering::Acquire) {
                    let n = match capture.read_frame(&mut capture_buf) {
                        Some(0) | None => break,
                        Some(n) => n,
                    };

                    let rms = rms_i16le(&capture_buf[..n]);
                    let target_gain = if rms > 0.0 {
                        (UPLINK_TARGET_RMS / rms).clamp(1.0, UPLINK_MAX_GAIN)
                    } else {
                        1.0
                    };
                    gain = (1.0 - GAIN_SMOOTHING) * gain + GAIN_SMOOTHING * target_gain;

                    // The capture loop reuses its buffer; work on a copy.
                    let mut samples: Vec<i16> = bytemuck::pod_collect_to_vec(&capture_buf[..n]);
                    for sample in &mut samples {
                        let amplified = (*sample as f64 * gain)
                            .round()
                            .clamp(i16::MIN as f64, i16::MAX as f64);
                        *sample = amplified as i16;
                    }
                    let payload = Bytes::from(bytemuck::cast_slice::<i16, u8>(&samples).to_vec());

                    let frame = UplinkFrame {
                        header: AudioFrameHeader {
                            dir: AudioDir::Up,
                            size: payload.len(),
                            rate: UPLINK_SAMPLE_RATE,
                            channels: 1,
                            format: AudioCodec::Pcm,
                            ts_us,
                        },
                        payload,
                    };
                    if out.send(frame).is_err() {
                        break;
                    }
                    ts_us += i64::from(UPLINK_FRAME_MS) * 1_000;
                }
                log::info!("[Talkback] Capture stopped");
            })
            .expect("spawn audio capture thread");

        Self {
            active,
            handle: Some(handle),
        }
    }

    /// Whether capture is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stops capture and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Talkback {
    fn drop(&mut self) {
        self.stop();
    }
}
