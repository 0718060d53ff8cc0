//! Fixed protocol constants that should NOT be changed.
//!
//! These values are part of the viewer↔primary link contract or were tuned
//! against real camera hardware. Changing them changes on-wire behavior or
//! recovery timing for both peers.

// ─────────────────────────────────────────────────────────────────────────────
// Wire Protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol version advertised in HELLO.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client identity advertised in HELLO.
pub const CLIENT_ID: &str = "viewer";

/// Maximum accepted header line length (bytes, excluding payload).
///
/// Headers are short key=value lists; anything past this is a framing error,
/// not a legitimate message.
pub const MAX_HEADER_LINE_BYTES: usize = 4096;

/// Maximum accepted binary payload size (bytes).
///
/// A full 1080×1440 IDR at high bitrate stays well under 2 MiB; larger sizes
/// indicate a corrupted or hostile size field.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Socket Options
// ─────────────────────────────────────────────────────────────────────────────

/// TCP connect timeout (milliseconds).
pub const CONNECT_TIMEOUT_MS: u64 = 6_000;

/// Socket read timeout (milliseconds).
pub const READ_TIMEOUT_MS: u64 = 15_000;

/// Requested send/receive buffer size (bytes, best-effort).
pub const SOCKET_BUFFER_BYTES: usize = 256 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat and Watchdogs
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between PING messages (milliseconds).
pub const HEARTBEAT_INTERVAL_MS: u64 = 2_000;

/// PONG starvation timeout, no downstream audio active (milliseconds).
pub const PONG_TIMEOUT_MS: u64 = 7_000;

/// PONG starvation timeout while downstream audio is active (milliseconds).
pub const PONG_TIMEOUT_AUDIO_MS: u64 = 15_000;

/// PONG starvation timeout inside a reconfigure grace window (milliseconds).
pub const PONG_TIMEOUT_GRACE_MS: u64 = 25_000;

/// Window in which received downstream audio counts as "audio active" (ms).
pub const AUDIO_ACTIVE_WINDOW_MS: u64 = 5_000;

/// No AUTH_OK in CONNECTING for this long → reconnect (milliseconds).
pub const HANDSHAKE_AUTH_TIMEOUT_MS: u64 = 10_000;

/// In AUTHENTICATED with no frames and no STREAM_ACCEPTED/CSD for this long
/// after AUTH_OK, the negotiation is re-kicked (milliseconds).
pub const HANDSHAKE_KICK_AFTER_MS: u64 = 3_000;

/// Minimum gap between successive negotiation kicks (milliseconds).
pub const HANDSHAKE_KICK_MIN_GAP_MS: u64 = 2_500;

/// In AUTHENTICATED with no frames for this long → downgrade to CONNECTED (ms).
pub const HANDSHAKE_NO_FRAMES_DOWNGRADE_MS: u64 = 12_000;

/// In AUTHENTICATED with no frames for this long → reconnect (milliseconds).
pub const HANDSHAKE_NO_FRAMES_RECONNECT_MS: u64 = 25_000;

/// Keyframe probe interval while stuck in CONNECTED (milliseconds).
pub const CONNECTED_KEYFRAME_PROBE_MS: u64 = 5_000;

/// Time in CONNECTED before renegotiating CAPS+SET_STREAM (milliseconds).
pub const CONNECTED_RENEGOTIATE_MS: u64 = 15_000;

/// Time stuck in CONNECTED before reconnecting (milliseconds).
pub const CONNECTED_RECONNECT_MS: u64 = 45_000;

/// Reconnect threshold when video had been flowing and then stalled (ms).
pub const CONNECTED_STALLED_RECONNECT_MS: u64 = 10_000;

/// No video RX in STREAMING/RECOVERING for this long → downgrade (ms).
pub const STREAM_STALL_MS: u64 = 2_000;

/// Default reconfigure grace extension (milliseconds).
pub const RECONFIGURE_GRACE_MS: u64 = 45_000;

/// Hard ceiling on quiescence tolerated inside a grace window (milliseconds).
pub const RECONFIGURE_GRACE_MAX_QUIESCENCE_MS: u64 = 120_000;

// ─────────────────────────────────────────────────────────────────────────────
// Reconnect Backoff
// ─────────────────────────────────────────────────────────────────────────────

/// Reconnect delays (milliseconds, exponential ladder).
pub const RECONNECT_DELAYS_MS: [u64; 4] = [1_000, 2_000, 4_000, 8_000];

/// Cap applied past the end of the ladder (milliseconds).
pub const RECONNECT_DELAY_CAP_MS: u64 = 10_000;

/// A connection that survived this long resets the backoff counter (ms).
pub const RECONNECT_RESET_AFTER_MS: u64 = 2_000;

// ─────────────────────────────────────────────────────────────────────────────
// Video Jitter Buffer and Decode Feeder
// ─────────────────────────────────────────────────────────────────────────────

/// Jitter buffer capacity (frames).
pub const JITTER_CAPACITY: usize = 30;

/// EWMA smoothing factor for inter-arrival deviation.
pub const JITTER_EWMA_ALPHA: f64 = 0.10;

/// Target backlog when arrival timing is calm (frames).
pub const JITTER_TARGET_CALM: usize = 2;

/// Target backlog at moderate jitter (frames).
pub const JITTER_TARGET_MODERATE: usize = 3;

/// Target backlog at heavy jitter (frames).
pub const JITTER_TARGET_HEAVY: usize = 4;

/// Moderate jitter: EWMA deviation threshold (milliseconds).
pub const JITTER_MODERATE_EWMA_MS: f64 = 12.0;

/// Moderate jitter: single-gap spike threshold (milliseconds).
pub const JITTER_MODERATE_SPIKE_MS: u64 = 60;

/// Heavy jitter: EWMA deviation threshold (milliseconds).
pub const JITTER_HEAVY_EWMA_MS: f64 = 25.0;

/// Heavy jitter: single-gap spike threshold (milliseconds).
pub const JITTER_HEAVY_SPIKE_MS: u64 = 90;

/// Backlog slack above the jitter target before oldest frames are shed.
pub const FEEDER_BACKLOG_SLACK: usize = 10;

/// Non-key frames skipped while keyframe-gated before a one-shot downgrade.
pub const KEYFRAME_SKIP_DOWNGRADE_COUNT: u64 = 60;

/// Upper bound on the A/V sync sleep before releasing a video buffer (ms).
pub const AV_SYNC_MAX_SLEEP_MS: u64 = 40;

/// Output buffers discarded after a decoder reset on quirky hardware.
pub const WARMUP_DROP_OUTPUTS: u32 = 2;

/// Render suppression window after the first post-reset IDR (milliseconds).
pub const WARMUP_SUPPRESS_MS: u64 = 120;

/// Stable renders required before first-frame-rendered is reported.
pub const WARMUP_STABLE_RENDERS: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Backpressure and Performance Control
// ─────────────────────────────────────────────────────────────────────────────

/// A frame is "late" when processed this long after its receive time (ms).
pub const BACKPRESSURE_LATE_MS: u64 = 80;

/// Consecutive late frames required before signaling BACKPRESSURE.
pub const BACKPRESSURE_LATE_COUNT: u32 = 5;

/// Minimum gap between backpressure signals (milliseconds).
pub const BACKPRESSURE_COOLDOWN_MS: u64 = 1_000;

/// Render FPS below this enters downgrade tracking.
pub const PERF_LOW_FPS: f64 = 20.0;

/// FPS below this at the mid profile triggers the final downgrade step.
pub const PERF_CRITICAL_FPS: f64 = 15.0;

/// Samples of sustained low FPS required before acting.
pub const PERF_MIN_SAMPLES: u32 = 5;

/// Sustained low-FPS duration required before acting (milliseconds).
pub const PERF_SUSTAIN_MS: u64 = 5_000;

/// Bitrate floor under which bitrate-only downgrades stop (bits/second).
pub const PERF_BITRATE_FLOOR: u32 = 900_000;

/// Multiplier applied per seamless bitrate downgrade.
pub const PERF_BITRATE_FACTOR: f64 = 0.7;

// ─────────────────────────────────────────────────────────────────────────────
// Audio
// ─────────────────────────────────────────────────────────────────────────────

/// Downstream playback queue capacity (packets, ≈3 s of 20 ms frames).
pub const AUDIO_QUEUE_CAPACITY: usize = 80;

/// Talkback capture sample rate (Hz).
pub const UPLINK_SAMPLE_RATE: u32 = 48_000;

/// Talkback capture frame duration (milliseconds).
pub const UPLINK_FRAME_MS: u32 = 20;

/// Target RMS level for talkback soft gain.
pub const UPLINK_TARGET_RMS: f64 = 1_800.0;

/// Maximum talkback soft gain.
pub const UPLINK_MAX_GAIN: f64 = 2.8;

/// Noise gate calibration window after unmute (milliseconds).
pub const NOISE_GATE_CALIBRATION_MS: u64 = 1_000;

/// Noise gate floor, below which the gate never drops.
pub const NOISE_GATE_MIN: f64 = 200.0;

/// Noise gate threshold multiplier over the measured noise floor.
pub const NOISE_GATE_FLOOR_FACTOR: f64 = 1.3;

/// Noise gate threshold offset over the measured noise floor.
pub const NOISE_GATE_FLOOR_OFFSET: f64 = 100.0;

/// Noise floor decay coefficient for below-gate samples.
pub const NOISE_FLOOR_DECAY: f64 = 0.995;

// ─────────────────────────────────────────────────────────────────────────────
// Byte Pool
// ─────────────────────────────────────────────────────────────────────────────

/// Soft cap on total bytes parked in pool free lists.
pub const POOL_SOFT_CAP_BYTES: usize = 8 * 1024 * 1024;

/// Maximum buffers parked per size class.
pub const POOL_PER_BUCKET_CAP: usize = 50;

/// Largest pooled allocation; larger requests bypass the pool.
pub const POOL_MAX_BUFFER_BYTES: usize = 2 * 1024 * 1024;
