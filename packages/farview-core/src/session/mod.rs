//! Session orchestrator: socket ownership, worker tasks, message routing.
//!
//! A [`ViewerSession`] owns one TCP connection to the primary plus the worker
//! set around it: the async reader, the single-writer task, the heartbeat/
//! watchdog task, the decode-feeder thread and both audio threads. The reader
//! never blocks on downstream consumers; every handoff is a bounded queue
//! with drop-oldest semantics.

mod handshake;
mod io;
mod watchdog;

pub use handshake::{auth_response, hello, negotiation_burst, resume_burst, CapsRetry, ViewerCaps};
pub use watchdog::{Health, WatchdogAction, Watchdogs};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioDownstream, AudioPacket, PlaybackQueue, Talkback, UplinkFrame};
use crate::error::{ViewerError, ViewerResult};
use crate::events::{ObserverDispatcher, ViewerEvent, ViewerObserver};
use crate::pool::{BytePool, Scratch};
use crate::profile::{start_profile, DeviceTier, ProfileStore, StreamProfile};
use crate::protocol_constants::{
    HEARTBEAT_INTERVAL_MS, POOL_MAX_BUFFER_BYTES, RECONFIGURE_GRACE_MS,
};
use crate::state::{ConnectionState, ReconnectBackoff, StateCell};
use crate::traits::{AacDecoder, AudioCapture, AudioSink, Clock, DecoderFactory, RenderSurface};
use crate::video::{
    BackpressureTracker, DecodeFeeder, FeederCommand, FeederConfig, FeederEvent, JitterBuffer,
    PerfAction, PerfController, PressureSignal, VideoFrame, VideoShared,
};
use crate::wire::{
    parse_line, should_drop_frame_by_epoch, AudioDir, Message, StreamStateCode, WireError,
};

use io::{open_socket, FrameReader, Outbound};

/// Connection parameters for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub tier: DeviceTier,
    pub caps: ViewerCaps,
    pub feeder: FeederConfig,
}

/// Everything platform-specific a session consumes.
pub struct SessionHooks {
    pub decoder_factory: Box<dyn DecoderFactory>,
    pub audio_sink: Box<dyn AudioSink>,
    pub aac_decoder: Option<Box<dyn AacDecoder>>,
    pub observer: Arc<dyn ViewerObserver>,
    pub clock: Arc<dyn Clock>,
    pub profile_store: Option<Box<dyn ProfileStore>>,
}

/// Point-in-time health snapshot for stats surfaces.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub frames_rx: u64,
    pub frames_dropped_rx: u64,
    pub frames_rendered: u64,
    pub jitter_backlog: usize,
    pub jitter_target: usize,
    pub jitter_deviation_ms: f64,
    pub audio_packets_rx: u64,
    pub audio_packets_played: u64,
    pub audio_queue_len: usize,
    pub backpressure_signals: u64,
    pub reconnects: u64,
    pub last_rtt_ms: i64,
    pub clock_offset_ms: i64,
    pub current_epoch: u64,
    pub pool_parked_bytes: usize,
}

#[derive(Default)]
struct Counters {
    frames_rx: AtomicU64,
    frames_dropped_rx: AtomicU64,
    frames_rendered: AtomicU64,
    audio_packets_rx: AtomicU64,
    audio_packets_played: AtomicU64,
    backpressure_signals: AtomicU64,
    reconnects: AtomicU64,
    last_rtt_ms: AtomicI64,
    clock_offset_ms: AtomicI64,
}

#[derive(Default)]
struct VideoDims {
    negotiated: Option<(u32, u32)>,
    coded: Option<(u32, u32)>,
}

/// How one connection attempt ended.
enum ConnEnd {
    /// Session-level cancellation (disconnect/shutdown).
    Cancelled,
    /// Hard authentication failure; auto-reconnect is disabled.
    AuthFailed,
    /// A watchdog asked for a fresh connection.
    WatchdogReconnect,
    /// I/O or protocol error; reconnect per backoff.
    Error(ViewerError),
}

struct Inner {
    config: SessionConfig,
    start_profile: StreamProfile,
    state: StateCell,
    health: Health,
    shared: Arc<VideoShared>,
    jitter: Arc<JitterBuffer>,
    audio_queue: Arc<PlaybackQueue>,
    pool: Arc<BytePool>,
    clock: Arc<dyn Clock>,
    dispatcher: ObserverDispatcher,
    surface: Arc<RwLock<Option<Arc<dyn RenderSurface>>>>,
    audio_clock: Arc<AtomicI64>,

    writer_tx: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    feeder_tx: std_mpsc::Sender<FeederCommand>,
    conn_cancel: Mutex<Option<CancellationToken>>,
    driver_cancel: Mutex<Option<CancellationToken>>,
    shutdown_token: CancellationToken,
    driver_running: AtomicBool,
    auto_reconnect: AtomicBool,
    shut_down: AtomicBool,

    session_id: Mutex<Option<String>>,
    requested_profile: Mutex<Option<StreamProfile>>,
    perf: Mutex<PerfController>,
    backpressure: Mutex<BackpressureTracker>,
    watchdogs: Mutex<Watchdogs>,
    caps_retry: Mutex<CapsRetry>,
    profile_store: Option<Box<dyn ProfileStore>>,
    talkback: Mutex<Option<Talkback>>,
    uplink_tx: mpsc::UnboundedSender<UplinkFrame>,

    counters: Counters,
    video_dims: Mutex<VideoDims>,

    feeder_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    audio_down: Mutex<Option<AudioDownstream>>,
}

/// Handle to a viewer streaming session.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct ViewerSession {
    inner: Arc<Inner>,
}

impl ViewerSession {
    /// Builds the session and spawns its long-lived workers (observer
    /// dispatch, decode feeder, audio playback, uplink forwarding).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: SessionConfig, hooks: SessionHooks) -> Self {
        let pool = BytePool::with_defaults();
        let jitter = Arc::new(JitterBuffer::new());
        let shared = Arc::new(VideoShared::new());
        let audio_queue = Arc::new(PlaybackQueue::new());
        let audio_clock = Arc::new(AtomicI64::new(0));
        let surface: Arc<RwLock<Option<Arc<dyn RenderSurface>>>> = Arc::new(RwLock::new(None));
        let dispatcher = ObserverDispatcher::spawn(Arc::clone(&hooks.observer));

        let stored = hooks.profile_store.as_ref().and_then(|s| s.load());
        let start = start_profile(config.tier, stored);

        let (feeder_tx, feeder_rx) = std_mpsc::channel();
        let (feeder_event_tx, feeder_event_rx) = mpsc::unbounded_channel();
        let feeder_handle = DecodeFeeder::spawn(
            config.feeder,
            Arc::clone(&jitter),
            Arc::clone(&shared),
            Arc::clone(&hooks.clock),
            hooks.decoder_factory,
            Arc::clone(&surface),
            Arc::clone(&audio_clock),
            feeder_rx,
            feeder_event_tx,
        );

        let counters = Counters::default();
        let audio_played = Arc::new(AtomicU64::new(0));
        let audio_down = AudioDownstream::spawn(
            Arc::clone(&audio_queue),
            hooks.audio_sink,
            hooks.aac_decoder,
            Arc::clone(&hooks.clock),
            Arc::clone(&audio_clock),
            Arc::clone(&audio_played),
        );

        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            start_profile: start,
            state: StateCell::new(),
            health: Health::new(),
            shared,
            jitter,
            audio_queue,
            pool,
            clock: hooks.clock,
            dispatcher,
            surface,
            audio_clock,
            writer_tx: Mutex::new(None),
            feeder_tx,
            conn_cancel: Mutex::new(None),
            driver_cancel: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            driver_running: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            session_id: Mutex::new(None),
            requested_profile: Mutex::new(None),
            perf: Mutex::new(PerfController::new(start)),
            backpressure: Mutex::new(BackpressureTracker::new()),
            watchdogs: Mutex::new(Watchdogs::new()),
            caps_retry: Mutex::new(CapsRetry::new()),
            profile_store: hooks.profile_store,
            talkback: Mutex::new(None),
            uplink_tx,
            counters,
            video_dims: Mutex::new(VideoDims::default()),
            feeder_handle: Mutex::new(Some(feeder_handle)),
            audio_down: Mutex::new(Some(audio_down)),
        });

        // Mirror the playback thread's counter into session stats.
        tokio::spawn({
            let inner = Arc::clone(&inner);
            let audio_played = Arc::clone(&audio_played);
            async move {
                let mut tick = tokio::time::interval(std::time::Duration::from_millis(500));
                loop {
                    tokio::select! {
                        _ = inner.shutdown_token.cancelled() => break,
                        _ = tick.tick() => {
                            inner.counters.audio_packets_played.store(
                                audio_played.load(Ordering::Relaxed),
                                Ordering::Relaxed,
                            );
                        }
                    }
                }
            }
        });

        tokio::spawn(Self::feeder_event_loop(Arc::clone(&inner), feeder_event_rx));
        tokio::spawn(Self::uplink_loop(Arc::clone(&inner), uplink_rx));

        Self { inner }
    }

    /// Starts the connection driver (no-op when already running).
    pub fn connect(&self) {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            log::warn!("[Session] connect() after shutdown ignored");
            return;
        }
        if inner.driver_running.swap(true, Ordering::AcqRel) {
            log::debug!("[Session] connect() while driver already running");
            return;
        }
        inner.auto_reconnect.store(true, Ordering::Release);
        let token = inner.shutdown_token.child_token();
        *inner.driver_cancel.lock() = Some(token.clone());
        tokio::spawn(Self::driver(Arc::clone(inner), token));
    }

    /// User-requested disconnect: no auto-reconnect, queues drained.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.auto_reconnect.store(false, Ordering::Release);
        if let Some(token) = inner.driver_cancel.lock().take() {
            token.cancel();
        }
        inner.jitter.clear();
        inner.post_state(ConnectionState::Disconnected);
    }

    /// Tears down every task and thread exactly once. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[Session] Shutting down");
        inner.auto_reconnect.store(false, Ordering::Release);
        inner.shutdown_token.cancel();
        if let Some(token) = inner.driver_cancel.lock().take() {
            token.cancel();
        }

        self.stop_talkback();
        let _ = inner.feeder_tx.send(FeederCommand::Shutdown);
        inner.jitter.close();

        let feeder = inner.feeder_handle.lock().take();
        let audio = inner.audio_down.lock().take();
        let _ = tokio::task::spawn_blocking(move || {
            if let Some(handle) = feeder {
                let _ = handle.join();
            }
            if let Some(mut audio) = audio {
                audio.shutdown();
            }
        })
        .await;

        inner.post_state(ConnectionState::Disconnected);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Point-in-time stats snapshot.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let inner = &self.inner;
        let c = &inner.counters;
        SessionStats {
            frames_rx: c.frames_rx.load(Ordering::Relaxed),
            frames_dropped_rx: c.frames_dropped_rx.load(Ordering::Relaxed),
            frames_rendered: c.frames_rendered.load(Ordering::Relaxed),
            jitter_backlog: inner.jitter.len(),
            jitter_target: inner.jitter.target(),
            jitter_deviation_ms: inner.jitter.deviation_ewma_ms(),
            audio_packets_rx: c.audio_packets_rx.load(Ordering::Relaxed),
            audio_packets_played: c.audio_packets_played.load(Ordering::Relaxed),
            audio_queue_len: inner.audio_queue.len(),
            backpressure_signals: c.backpressure_signals.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            last_rtt_ms: c.last_rtt_ms.load(Ordering::Relaxed),
            clock_offset_ms: c.clock_offset_ms.load(Ordering::Relaxed),
            current_epoch: inner.shared.current_epoch.load(Ordering::Acquire),
            pool_parked_bytes: inner.pool.parked_bytes(),
        }
    }

    /// Attaches the render surface. Idempotent.
    pub fn attach_surface(&self, surface: Arc<dyn RenderSurface>) {
        *self.inner.surface.write() = Some(surface);
    }

    /// Detaches the render surface. Idempotent; decode continues unrendered.
    pub fn detach_surface(&self) {
        self.inner.surface.write().take();
    }

    /// Gates the adaptive performance controller on real visibility.
    pub fn set_preview_visible(&self, visible: bool) {
        self.inner.perf.lock().set_preview_visible(visible);
    }

    /// Mutes or unmutes downstream audio playback.
    pub fn set_audio_muted(&self, muted: bool) {
        if let Some(down) = self.inner.audio_down.lock().as_ref() {
            down.set_muted(muted);
        }
    }

    /// Starts talkback capture. Returns `false` when one is already active.
    pub fn start_talkback(&self, capture: Box<dyn AudioCapture>) -> bool {
        let mut talkback = self.inner.talkback.lock();
        if talkback.as_ref().is_some_and(Talkback::is_active) {
            return false;
        }
        // Announce talkback before the first uplink frame can hit the wire.
        self.inner.send(Message::Comm { enabled: true });
        *talkback = Some(Talkback::start(capture, self.inner.uplink_tx.clone()));
        true
    }

    /// Stops talkback capture. Idempotent.
    pub fn stop_talkback(&self) {
        let stopped = {
            let mut talkback = self.inner.talkback.lock();
            match talkback.take() {
                Some(mut active) => {
                    active.stop();
                    true
                }
                None => false,
            }
        };
        if stopped {
            self.inner.send(Message::Comm { enabled: false });
        }
    }

    /// Asks the primary to switch cameras.
    pub fn switch_camera(&self) {
        self.inner.send(Message::SwitchCamera);
    }

    /// Sets the primary's zoom level.
    pub fn set_zoom(&self, level: f32) {
        self.inner.send(Message::Zoom { level });
    }

    /// Asks the primary to start recording.
    pub fn start_recording(&self) {
        self.inner.send(Message::StartRecording);
    }

    /// Asks the primary to stop recording.
    pub fn stop_recording(&self) {
        self.inner.send(Message::StopRecording);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection driver
    // ─────────────────────────────────────────────────────────────────────

    async fn driver(inner: Arc<Inner>, token: CancellationToken) {
        let mut backoff = ReconnectBackoff::new();
        loop {
            if token.is_cancelled() {
                break;
            }
            inner.post_state(ConnectionState::Connecting);
            inner.health.reset_for_connection(inner.clock.mono_ms());
            inner.caps_retry.lock().reset();

            let started = inner.clock.mono_ms();
            let end = Self::run_connection(&inner, &token).await;
            let lasted = inner.clock.mono_ms().saturating_sub(started);
            inner.writer_tx.lock().take();

            match end {
                ConnEnd::Cancelled => break,
                ConnEnd::AuthFailed => {
                    inner.auto_reconnect.store(false, Ordering::Release);
                    inner.post_state(ConnectionState::Disconnected);
                    inner
                        .dispatcher
                        .emit(ViewerEvent::Error(ViewerError::AuthFailed.user_message()));
                    break;
                }
                ConnEnd::WatchdogReconnect | ConnEnd::Error(_) => {
                    if let ConnEnd::Error(ref e) = end {
                        log::warn!("[Session] Connection ended: {}", e);
                        inner
                            .dispatcher
                            .emit(ViewerEvent::Error(e.user_message()));
                    }
                    inner.post_state(ConnectionState::Disconnected);
                    if !inner.auto_reconnect.load(Ordering::Acquire) {
                        break;
                    }
                    inner.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    backoff.note_connection_lasted(std::time::Duration::from_millis(lasted));
                    let delay = backoff.next_delay();
                    log::info!("[Session] Reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        inner.driver_running.store(false, Ordering::Release);
        log::debug!("[Session] Driver stopped");
    }

    async fn run_connection(inner: &Arc<Inner>, token: &CancellationToken) -> ConnEnd {
        let stream = match open_socket(&inner.config.host, inner.config.port).await {
            Ok(stream) => stream,
            Err(e) => return ConnEnd::Error(e),
        };
        log::info!(
            "[Session] Connected to {}:{}",
            inner.config.host,
            inner.config.port
        );

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        *inner.writer_tx.lock() = Some(writer_tx);

        let conn_cancel = token.child_token();
        *inner.conn_cancel.lock() = Some(conn_cancel.clone());

        let writer = io::spawn_writer(write_half, writer_rx, conn_cancel.clone());
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(inner),
            conn_cancel.clone(),
        ));

        inner.send(hello());

        let mut reader = FrameReader::new(read_half);
        let end = Self::reader_loop(inner, &mut reader, token, &conn_cancel).await;

        conn_cancel.cancel();
        *inner.conn_cancel.lock() = None;
        let _ = heartbeat.await;
        let _ = writer.await;
        end
    }

    async fn reader_loop(
        inner: &Arc<Inner>,
        reader: &mut FrameReader,
        token: &CancellationToken,
        conn_cancel: &CancellationToken,
    ) -> ConnEnd {
        let mut scratch = Scratch::new();
        let mut unknown_verb_reported = false;
        loop {
            let header = tokio::select! {
                _ = conn_cancel.cancelled() => {
                    return if token.is_cancelled() {
                        ConnEnd::Cancelled
                    } else {
                        ConnEnd::WatchdogReconnect
                    };
                }
                header = reader.read_header() => header,
            };

            let line = match header {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return ConnEnd::Error(ViewerError::TransientIo(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by primary",
                    )))
                }
                Err(e) => return ConnEnd::Error(e),
            };

            match parse_line(&line) {
                Ok(msg) => {
                    match Self::handle_message(inner, reader, &mut scratch, msg).await {
                        Ok(None) => {}
                        Ok(Some(end)) => return end,
                        Err(e) => return ConnEnd::Error(e),
                    }
                }
                Err(WireError::UnknownVerb {
                    verb,
                    declared_size,
                }) => {
                    let err = ViewerError::UnknownVerb(verb);
                    log::warn!("[Session] {}, skipping", err);
                    if !unknown_verb_reported {
                        // One observer notification per connection is enough;
                        // a chatty future primary would otherwise spam the UI.
                        unknown_verb_reported = true;
                        inner.dispatcher.emit(ViewerEvent::Error(err.user_message()));
                    }
                    if let Some(size) = declared_size {
                        // Defensive skip: the unknown verb declared a payload
                        // length, so framing can be preserved.
                        if let Err(e) = reader.read_exact_payload(scratch.space(size)).await {
                            return ConnEnd::Error(e);
                        }
                    }
                }
                Err(WireError::MalformedHeader(detail)) => {
                    return ConnEnd::Error(ViewerError::ProtocolMalformed(detail));
                }
            }
        }
    }

    /// Routes one parsed message. Payloads for binary verbs are consumed here
    /// so framing stays correct on every path.
    async fn handle_message(
        inner: &Arc<Inner>,
        reader: &mut FrameReader,
        scratch: &mut Scratch,
        msg: Message,
    ) -> ViewerResult<Option<ConnEnd>> {
        let now = inner.clock.mono_ms();
        match msg {
            Message::Hello { .. } => {}
            Message::AuthChallenge { salt } => {
                inner.send(auth_response(&inner.config.password, &salt));
            }
            Message::AuthOk => {
                inner.health.last_auth_ok_ms.store(now, Ordering::Release);
                inner.post_state(ConnectionState::Authenticated);
                let resumable = inner.session_id.lock().clone();
                match resumable {
                    Some(id) => {
                        log::info!("[Session] Resuming session {}", id);
                        for msg in resume_burst(&id) {
                            inner.send(msg);
                        }
                    }
                    None => inner.send_negotiation(),
                }
            }
            Message::AuthFail => return Ok(Some(ConnEnd::AuthFailed)),
            Message::Session { id } => {
                log::debug!("[Session] Session id {} stored for resume", id);
                *inner.session_id.lock() = Some(id);
            }
            Message::ResumeOk => log::info!("[Session] Resume accepted"),
            Message::ResumeFail => {
                log::info!("[Session] Resume rejected, renegotiating");
                *inner.session_id.lock() = None;
                inner.send_negotiation();
            }
            Message::StreamAccepted {
                epoch,
                width,
                height,
                bitrate,
                fps,
            } => {
                inner
                    .health
                    .last_stream_accepted_ms
                    .store(now, Ordering::Release);
                let current = inner.shared.current_epoch.load(Ordering::Acquire);
                if epoch > current && current > 0 {
                    // Mid-stream encoder restart: tolerate the brief stall and
                    // forget the previous era's dimensions.
                    inner.health.extend_grace(now, RECONFIGURE_GRACE_MS);
                    *inner.video_dims.lock() = VideoDims::default();
                    if inner.state.get() == ConnectionState::Streaming {
                        inner.post_state(ConnectionState::Recovering);
                    }
                }
                let requested = *inner.requested_profile.lock();
                inner
                    .perf
                    .lock()
                    .on_stream_accepted(requested, width, height, bitrate, fps);
                if let Some(store) = &inner.profile_store {
                    store.save(&inner.perf.lock().current_profile());
                }
                inner.video_dims.lock().negotiated = Some((width, height));
                let _ = inner.feeder_tx.send(FeederCommand::StreamAccepted {
                    epoch,
                    width,
                    height,
                    fps,
                });
            }
            Message::AdjustBitrate { .. } => {} // viewer → primary only
            Message::BitrateAdjusted { bitrate } => {
                log::debug!("[Session] Bitrate adjustment acknowledged at {}", bitrate);
            }
            Message::Csd {
                epoch,
                sps_len,
                pps_len,
            } => {
                let mut sps = vec![0u8; sps_len];
                reader.read_exact_payload(&mut sps).await?;
                let mut pps = vec![0u8; pps_len];
                reader.read_exact_payload(&mut pps).await?;
                inner.health.last_csd_ms.store(now, Ordering::Release);

                let current = inner.shared.current_epoch.load(Ordering::Acquire);
                if epoch > current && current > 0 {
                    inner.health.extend_grace(now, RECONFIGURE_GRACE_MS);
                    *inner.video_dims.lock() = VideoDims::default();
                    if inner.state.get() == ConnectionState::Streaming {
                        inner.post_state(ConnectionState::Recovering);
                    }
                }
                let _ = inner.feeder_tx.send(FeederCommand::Csd {
                    epoch,
                    sps: Bytes::from(sps),
                    pps: Bytes::from(pps),
                });
            }
            Message::Frame(header) => {
                Self::handle_frame(inner, reader, scratch, header).await?;
            }
            Message::AudioFrame(header) => match header.dir {
                AudioDir::Down => {
                    let mut payload = inner.pool.acquire(header.size);
                    reader.read_exact_payload(payload.as_mut_slice()).await?;
                    inner.health.last_audio_rx_ms.store(now, Ordering::Release);
                    inner.counters.audio_packets_rx.fetch_add(1, Ordering::Relaxed);
                    let dropped = inner.audio_queue.push(AudioPacket {
                        payload,
                        rate: header.rate,
                        channels: header.channels,
                        ts_us: header.ts_us,
                        format: header.format,
                    });
                    if dropped {
                        log::trace!("[Session] Audio queue full, dropped oldest packet");
                    }
                }
                AudioDir::Up => {
                    // Echo of our own uplink; consume and ignore.
                    reader.read_exact_payload(scratch.space(header.size)).await?;
                }
            },
            Message::Ping { ts_ms } => {
                inner.send(Message::Pong {
                    ts_ms,
                    srv_ms: inner.clock.wall_ms(),
                });
            }
            Message::Pong { ts_ms, srv_ms } => {
                inner.health.last_pong_ms.store(now, Ordering::Release);
                let wall_now = inner.clock.wall_ms();
                let rtt = (wall_now - ts_ms).max(0);
                inner.counters.last_rtt_ms.store(rtt, Ordering::Relaxed);
                if srv_ms > 0 {
                    let offset = srv_ms + rtt / 2 - wall_now;
                    inner.counters.clock_offset_ms.store(offset, Ordering::Relaxed);
                }
            }
            Message::ReqKeyframe
            | Message::Backpressure
            | Message::PressureClear
            | Message::Caps { .. }
            | Message::SetStream { .. }
            | Message::Resume { .. }
            | Message::AuthResponse { .. }
            | Message::StartRecording
            | Message::StopRecording
            | Message::SwitchCamera
            | Message::Zoom { .. } => {
                log::debug!("[Session] Ignoring viewer-direction message from primary");
            }
            Message::Recording { active } => {
                if active {
                    // Recording start briefly pauses the primary's video plane.
                    inner.health.extend_grace(now, RECONFIGURE_GRACE_MS);
                }
                inner.dispatcher.emit(ViewerEvent::Recording(active));
            }
            Message::Camera { facing } => {
                inner.dispatcher.emit(ViewerEvent::CameraFacing(facing));
            }
            Message::EncRot { deg } => {
                inner.dispatcher.emit(ViewerEvent::Rotation(deg));
            }
            Message::Comm { enabled } => {
                inner.dispatcher.emit(ViewerEvent::CommEnabled(enabled));
            }
            Message::StreamState { code, epoch } => {
                let current = inner.shared.current_epoch.load(Ordering::Acquire);
                if epoch > 0 && current > 0 && epoch < current {
                    log::debug!("[Session] Ignoring STREAM_STATE from stale epoch {}", epoch);
                } else {
                    Self::apply_stream_state(inner, code, now);
                }
            }
            Message::Error { reason } => {
                if reason == "caps_required" && inner.caps_retry.lock().take() {
                    log::info!("[Session] Primary demands caps, resending negotiation");
                    inner.send_negotiation();
                } else {
                    log::warn!("[Session] Primary reported error: {}", reason);
                }
            }
        }
        Ok(None)
    }

    async fn handle_frame(
        inner: &Arc<Inner>,
        reader: &mut FrameReader,
        scratch: &mut Scratch,
        header: crate::wire::FrameHeader,
    ) -> ViewerResult<()> {
        let now = inner.clock.mono_ms();
        inner.health.mark_frame_rx(now);
        inner.shared.last_rx_ms.store(now, Ordering::Release);
        inner.counters.frames_rx.fetch_add(1, Ordering::Relaxed);

        let current = inner.shared.current_epoch.load(Ordering::Acquire);
        let epoch_drop = should_drop_frame_by_epoch(current, header.epoch);
        let paused = inner.shared.paused.load(Ordering::Acquire);
        let overflow_nonkey = inner.jitter.is_full() && !header.key;

        if epoch_drop || paused || overflow_nonkey {
            // The payload must be consumed to keep framing; scratch avoids
            // allocating for data we are discarding.
            reader.read_exact_payload(scratch.space(header.size)).await?;
            inner
                .counters
                .frames_dropped_rx
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if header.size > POOL_MAX_BUFFER_BYTES {
            let err = ViewerError::ResourceExhausted(header.size);
            log::warn!("[Session] {}", err);
            inner.dispatcher.emit(ViewerEvent::Error(err.user_message()));
        }
        let mut payload = inner.pool.acquire(header.size);
        reader.read_exact_payload(payload.as_mut_slice()).await?;
        inner.jitter.push(
            VideoFrame {
                header,
                recv_ms: now,
                payload,
            },
            now,
        );
        Ok(())
    }

    fn apply_stream_state(inner: &Arc<Inner>, code: StreamStateCode, now: u64) {
        match code {
            StreamStateCode::Active => {
                inner.shared.paused.store(false, Ordering::Release);
                // STREAMING still requires a rendered frame; promotion happens
                // on the next render if none has landed yet.
                if inner.health.last_frame_render_ms.load(Ordering::Acquire) > 0 {
                    inner.post_state(ConnectionState::Streaming);
                }
            }
            StreamStateCode::Reconfiguring => {
                inner.shared.paused.store(false, Ordering::Release);
                inner.health.extend_grace(now, RECONFIGURE_GRACE_MS);
                inner.post_state(ConnectionState::Recovering);
            }
            StreamStateCode::Paused => {
                inner.shared.paused.store(true, Ordering::Release);
                inner.post_state(ConnectionState::Connected);
            }
            StreamStateCode::Stopped => {
                inner.shared.paused.store(true, Ordering::Release);
                inner.post_state(ConnectionState::Idle);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Heartbeat / watchdog task
    // ─────────────────────────────────────────────────────────────────────

    async fn heartbeat_loop(inner: Arc<Inner>, conn_cancel: CancellationToken) {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_rendered = inner.counters.frames_rendered.load(Ordering::Relaxed);

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let now = inner.clock.mono_ms();
            inner.send(Message::Ping {
                ts_ms: inner.clock.wall_ms(),
            });

            // Render-FPS sample for the performance controller.
            let state = inner.state.get();
            if state == ConnectionState::Streaming {
                let rendered = inner.counters.frames_rendered.load(Ordering::Relaxed);
                let fps = (rendered.saturating_sub(last_rendered)) as f64
                    / (HEARTBEAT_INTERVAL_MS as f64 / 1_000.0);
                last_rendered = rendered;
                let action = inner.perf.lock().on_fps_sample(now, fps);
                inner.apply_perf_action(action);
            } else {
                last_rendered = inner.counters.frames_rendered.load(Ordering::Relaxed);
            }

            let actions = inner.watchdogs.lock().tick(now, state, &inner.health);
            for action in actions {
                match action {
                    WatchdogAction::Reconnect => {
                        log::info!("[Session] Watchdog requested reconnect");
                        conn_cancel.cancel();
                    }
                    WatchdogAction::KickNegotiation => {
                        inner.health.last_kick_ms.store(now, Ordering::Release);
                        inner.send_negotiation();
                    }
                    WatchdogAction::RequestKeyframe => inner.send(Message::ReqKeyframe),
                    WatchdogAction::Renegotiate => {
                        inner.send_negotiation();
                        inner.post_state(ConnectionState::Recovering);
                    }
                    WatchdogAction::DowngradeToConnected => {
                        let err = ViewerError::StalledStream;
                        log::warn!("[Session] {}", err);
                        inner.dispatcher.emit(ViewerEvent::Error(err.user_message()));
                        inner.post_state(ConnectionState::Connected);
                    }
                    WatchdogAction::ExtendGrace => {
                        log::debug!("[Session] Watchdog extended reconfigure grace");
                    }
                }
            }
        }
        log::debug!("[Session] Heartbeat task stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Feeder / uplink event pumps
    // ─────────────────────────────────────────────────────────────────────

    async fn feeder_event_loop(
        inner: Arc<Inner>,
        mut events: mpsc::UnboundedReceiver<FeederEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let now = inner.clock.mono_ms();
            match event {
                FeederEvent::RequestKeyframe => inner.send(Message::ReqKeyframe),
                FeederEvent::FirstFrameRendered => {
                    inner.perf.lock().set_first_frame_rendered();
                    inner.dispatcher.emit(ViewerEvent::FirstFrameRendered);
                }
                FeederEvent::FrameRendered { .. } => {
                    inner.counters.frames_rendered.fetch_add(1, Ordering::Relaxed);
                    inner
                        .health
                        .last_frame_render_ms
                        .store(now, Ordering::Release);
                    if matches!(
                        inner.state.get(),
                        ConnectionState::Authenticated
                            | ConnectionState::Recovering
                            | ConnectionState::Connected
                    ) {
                        inner.post_state(ConnectionState::Streaming);
                    }
                }
                FeederEvent::FrameFed { late_ms } => {
                    let signal = inner.backpressure.lock().on_frame(now, late_ms);
                    match signal {
                        Some(PressureSignal::Backpressure) => {
                            inner
                                .counters
                                .backpressure_signals
                                .fetch_add(1, Ordering::Relaxed);
                            inner.send(Message::Backpressure);
                        }
                        Some(PressureSignal::Clear) => inner.send(Message::PressureClear),
                        None => {}
                    }
                }
                FeederEvent::VideoSize {
                    width,
                    height,
                    coded,
                } => {
                    let mut dims = inner.video_dims.lock();
                    if coded {
                        dims.coded = Some((width, height));
                    } else {
                        if dims.coded.is_some() {
                            // Coded size already known and preferred.
                            continue;
                        }
                        dims.negotiated = Some((width, height));
                    }
                    let crop = match (dims.negotiated, dims.coded) {
                        (Some((nw, nh)), Some((cw, ch))) if (nw, nh) != (cw, ch) => {
                            Some((nw, nh, cw, ch))
                        }
                        _ => None,
                    };
                    drop(dims);
                    inner
                        .dispatcher
                        .emit(ViewerEvent::VideoSize { width, height });
                    if let Some((nw, nh, cw, ch)) = crop {
                        inner.dispatcher.emit(ViewerEvent::VideoCrop {
                            width: nw,
                            height: nh,
                            coded_width: cw,
                            coded_height: ch,
                        });
                    }
                }
                FeederEvent::KeyframeGateSkips { total } => {
                    log::warn!("[Session] {} frames skipped at keyframe gate", total);
                    let action = inner.perf.lock().on_keyframe_gate_skips();
                    inner.apply_perf_action(action);
                }
                FeederEvent::DecoderTeardown => inner.perf.lock().on_decoder_reset(),
                FeederEvent::DecoderFault { detail } => {
                    let err = ViewerError::DecoderFailure(detail);
                    log::warn!("[Session] {}", err);
                    inner.dispatcher.emit(ViewerEvent::Error(err.user_message()));
                }
            }
        }
    }

    async fn uplink_loop(inner: Arc<Inner>, mut frames: mpsc::UnboundedReceiver<UplinkFrame>) {
        while let Some(frame) = frames.recv().await {
            inner.send_binary(Message::AudioFrame(frame.header), frame.payload);
        }
    }
}

impl Inner {
    /// Posts a state change and notifies the observer when it sticks.
    fn post_state(&self, new: ConnectionState) {
        if let Some(applied) = self.state.post(new) {
            if applied == ConnectionState::Connected {
                self.health
                    .connected_entered_ms
                    .store(self.clock.mono_ms(), Ordering::Release);
            }
            self.dispatcher.emit(ViewerEvent::State(applied));
        }
    }

    /// Queues a text message for the writer task.
    fn send(&self, msg: Message) {
        if let Some(tx) = self.writer_tx.lock().as_ref() {
            let _ = tx.send(Outbound::Line(msg));
        }
    }

    /// Queues a header + payload pair for the writer task.
    fn send_binary(&self, header: Message, payload: Bytes) {
        if let Some(tx) = self.writer_tx.lock().as_ref() {
            let _ = tx.send(Outbound::Binary { header, payload });
        }
    }

    /// Sends CAPS + SET_STREAM + REQ_KEYFRAME with the active profile.
    fn send_negotiation(&self) {
        let profile = {
            let mut requested = self.requested_profile.lock();
            let profile = requested.unwrap_or(self.start_profile);
            *requested = Some(profile);
            profile
        };
        for msg in negotiation_burst(self.config.caps, profile) {
            self.send(msg);
        }
    }

    /// Applies a performance-controller decision to the wire.
    fn apply_perf_action(&self, action: Option<PerfAction>) {
        match action {
            Some(PerfAction::AdjustBitrate(bitrate)) => {
                self.send(Message::AdjustBitrate { bitrate });
            }
            Some(PerfAction::RequestProfile(profile)) => {
                *self.requested_profile.lock() = Some(profile);
                self.send(Message::SetStream {
                    width: profile.width,
                    height: profile.height,
                    bitrate: profile.bitrate,
                    fps: profile.fps,
                });
                self.send(Message::ReqKeyframe);
            }
            None => {}
        }
    }
}
