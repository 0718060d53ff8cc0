//! Typed representations of protocol messages.

/// Direction of an AUDIO_FRAME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDir {
    /// Viewer → primary (talkback).
    Up,
    /// Primary → viewer (camera microphone).
    Down,
}

impl AudioDir {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

/// Payload format of an AUDIO_FRAME.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioCodec {
    /// Raw 16-bit little-endian PCM.
    #[default]
    Pcm,
    /// ADTS-framed AAC-LC, 7-byte headers included.
    Aac,
}

impl AudioCodec {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Aac => "aac",
        }
    }
}

/// Header fields of a FRAME message. The payload follows on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub epoch: u64,
    pub seq: i64,
    pub size: usize,
    pub key: bool,
    /// Sender timestamp at encode time (µs).
    pub ts_us: i64,
    /// Primary wall clock at send (ms).
    pub srv_ms: i64,
    /// Primary wall clock at capture (ms).
    pub cap_ms: i64,
    /// Frame age at send (ms).
    pub age_ms: i64,
}

/// Header fields of an AUDIO_FRAME message. The payload follows on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrameHeader {
    pub dir: AudioDir,
    pub size: usize,
    pub rate: u32,
    pub channels: u16,
    pub format: AudioCodec,
    pub ts_us: i64,
}

/// STREAM_STATE codes published by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStateCode {
    /// Encoder running, frames flowing.
    Active,
    /// Encoder restarting; a CSD + keyframe will follow.
    Reconfiguring,
    /// Stream paused without teardown.
    Paused,
    /// Stream intentionally stopped.
    Stopped,
}

impl StreamStateCode {
    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Active),
            2 => Some(Self::Reconfiguring),
            3 => Some(Self::Paused),
            4 => Some(Self::Stopped),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            Self::Active => 1,
            Self::Reconfiguring => 2,
            Self::Paused => 3,
            Self::Stopped => 4,
        }
    }
}

/// A parsed protocol message header.
///
/// Binary-bearing variants (`Frame`, `Csd`, `AudioFrame`) carry only the
/// declared payload sizes; the reader consumes the payload bytes separately so
/// that epoch-dropped frames can be drained without allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello { client: String, version: u32 },
    AuthChallenge { salt: String },
    AuthResponse { hash: String },
    AuthOk,
    AuthFail,
    Session { id: String },
    Resume { session: String },
    ResumeOk,
    ResumeFail,
    Caps { max_width: u32, max_height: u32, max_bitrate: u32 },
    SetStream { width: u32, height: u32, bitrate: u32, fps: u32 },
    StreamAccepted { epoch: u64, width: u32, height: u32, bitrate: u32, fps: u32 },
    AdjustBitrate { bitrate: u32 },
    BitrateAdjusted { bitrate: u32 },
    Csd { epoch: u64, sps_len: usize, pps_len: usize },
    Frame(FrameHeader),
    AudioFrame(AudioFrameHeader),
    Ping { ts_ms: i64 },
    Pong { ts_ms: i64, srv_ms: i64 },
    ReqKeyframe,
    Backpressure,
    PressureClear,
    StartRecording,
    StopRecording,
    Recording { active: bool },
    SwitchCamera,
    Camera { facing: String },
    Zoom { level: f32 },
    EncRot { deg: i32 },
    Comm { enabled: bool },
    StreamState { code: StreamStateCode, epoch: u64 },
    Error { reason: String },
}

/// Epoch gating predicate for received frames.
///
/// A frame is dropped when both sides are epoch-aware (non-zero) and disagree.
/// Epoch 0 on either side means "not negotiated yet" and never drops.
#[must_use]
pub fn should_drop_frame_by_epoch(current: u64, msg: u64) -> bool {
    current > 0 && msg > 0 && msg != current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_zero_never_drops() {
        assert!(!should_drop_frame_by_epoch(0, 5));
        assert!(!should_drop_frame_by_epoch(5, 0));
        assert!(!should_drop_frame_by_epoch(0, 0));
    }

    #[test]
    fn mismatched_epochs_drop() {
        assert!(should_drop_frame_by_epoch(2, 1));
        assert!(should_drop_frame_by_epoch(1, 2));
    }

    #[test]
    fn matching_epochs_pass() {
        assert!(!should_drop_frame_by_epoch(3, 3));
    }

    #[test]
    fn stream_state_codes_round_trip() {
        for code in 1..=4 {
            let state = StreamStateCode::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(StreamStateCode::from_code(0), None);
        assert_eq!(StreamStateCode::from_code(9), None);
    }
}
