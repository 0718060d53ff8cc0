//! Farview Viewer - headless viewer for a Farview surveillance link.
//!
//! Connects to a primary, drives the full streaming session with no-op
//! decode/audio sinks, and logs session health. Useful for soak-testing a
//! link (network, encoder restarts, watchdog behavior) without a UI.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use farview_core::{
    ConnectionState, DeviceTier, FeederConfig, JsonProfileStore, NullAudioSink,
    NullDecoderFactory, NullSurface, ProfileStore, SessionConfig, SessionHooks, SystemClock,
    ViewerCaps, ViewerObserver, ViewerSession,
};
use tokio::signal;

use crate::config::ViewerConfig;

/// Farview Viewer - headless surveillance link viewer.
#[derive(Parser, Debug)]
#[command(name = "farview-viewer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "FARVIEW_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Primary host (overrides config file).
    #[arg(short = 'H', long, env = "FARVIEW_HOST")]
    host: Option<String>,

    /// Primary port (overrides config file).
    #[arg(short = 'p', long, env = "FARVIEW_PORT")]
    port: Option<u16>,

    /// Link password (overrides config file).
    #[arg(short = 'P', long, env = "FARVIEW_PASSWORD")]
    password: Option<String>,
}

/// Observer that narrates session progress into the log.
struct LogObserver;

impl ViewerObserver for LogObserver {
    fn on_state(&self, state: ConnectionState) {
        log::info!("[Viewer] State: {:?}", state);
    }

    fn on_error(&self, message: &str) {
        log::warn!("[Viewer] {}", message);
    }

    fn on_video_size(&self, width: u32, height: u32) {
        log::info!("[Viewer] Video size {}x{}", width, height);
    }

    fn on_first_frame_rendered(&self) {
        log::info!("[Viewer] First frame rendered");
    }

    fn on_recording(&self, active: bool) {
        log::info!("[Viewer] Primary recording: {}", active);
    }

    fn on_camera_facing(&self, facing: &str) {
        log::info!("[Viewer] Camera facing: {}", facing);
    }

    fn on_rotation(&self, degrees: i32) {
        log::info!("[Viewer] Encoder rotation: {}°", degrees);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Farview Viewer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ViewerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if config.password.is_empty() {
        anyhow::bail!("no password configured; pass --password or set FARVIEW_PASSWORD");
    }

    log::info!("Connecting to {}:{}", config.host, config.port);

    let tier = if config.low_tier {
        DeviceTier::Low
    } else {
        DeviceTier::High
    };
    let profile_store: Option<Box<dyn ProfileStore>> = config
        .profile_file
        .as_ref()
        .map(|path| Box::new(JsonProfileStore::new(path.clone())) as Box<dyn ProfileStore>);

    let session = ViewerSession::new(
        SessionConfig {
            host: config.host,
            port: config.port,
            password: config.password,
            tier,
            caps: ViewerCaps::default(),
            feeder: FeederConfig::default(),
        },
        SessionHooks {
            decoder_factory: Box::new(NullDecoderFactory),
            audio_sink: Box::new(NullAudioSink),
            aac_decoder: None,
            observer: Arc::new(LogObserver),
            clock: SystemClock::new(),
            profile_store,
        },
    );
    session.attach_surface(Arc::new(NullSurface));
    session.set_preview_visible(true);
    session.connect();

    if config.stats_interval > 0 {
        let session = session.clone();
        let interval = std::time::Duration::from_secs(config.stats_interval);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                let stats = session.stats();
                log::info!(
                    "[Stats] state={:?} rx={} rendered={} dropped={} backlog={}/{} \
                     audio_rx={} audio_played={} rtt={}ms offset={}ms reconnects={}",
                    session.state(),
                    stats.frames_rx,
                    stats.frames_rendered,
                    stats.frames_dropped_rx,
                    stats.jitter_backlog,
                    stats.jitter_target,
                    stats.audio_packets_rx,
                    stats.audio_packets_played,
                    stats.last_rtt_ms,
                    stats.clock_offset_ms,
                    stats.reconnects,
                );
            }
        });
    }

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    log::info!("Shutting down");
    session.shutdown().await;
    Ok(())
}
