//! Farview Core - viewer-side streaming core for a point-to-point live
//! surveillance link.
//!
//! A Farview link has two peers: a PRIMARY (capture side) that encodes and
//! serves video/audio, and a VIEWER that decodes and renders. This crate is
//! the viewer's streaming engine, shared between embedding UIs and the
//! headless viewer binary.
//!
//! # Architecture
//!
//! - [`wire`]: line-oriented framed protocol parser/emitter
//! - [`session`]: connection driver, handshake, watchdogs, message routing
//! - [`video`]: adaptive jitter buffer, decode feeder, performance control
//! - [`audio`]: downstream playback (PCM/AAC) and talkback uplink
//! - [`pool`]: size-bucketed payload buffer reuse
//! - [`events`]: serialized observer callbacks for embedding UIs
//! - [`traits`]: seams for platform decoders, audio devices and surfaces
//! - [`error`]: centralized error types with standardized user messages
//!
//! # Abstraction Traits
//!
//! The core never touches hardware. Platform integrations implement
//! [`DecoderSink`](traits::DecoderSink), [`AudioSink`](traits::AudioSink),
//! [`AudioCapture`](traits::AudioCapture) and
//! [`RenderSurface`](traits::RenderSurface); the bundled `Null*`
//! implementations keep headless sessions running with no hardware at all.

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod audio;
pub mod auth;
pub mod error;
pub mod events;
pub mod pool;
pub mod profile;
pub mod protocol_constants;
pub mod session;
pub mod state;
pub mod traits;
pub mod utils;
pub mod video;
pub mod wire;

// Re-export commonly used types at the crate root
pub use error::{ViewerError, ViewerResult};
pub use events::{LoggingObserver, NoopObserver, ViewerEvent, ViewerObserver};
pub use profile::{start_profile, DeviceTier, JsonProfileStore, ProfileStore, StreamProfile};
pub use session::{
    Health, SessionConfig, SessionHooks, SessionStats, ViewerCaps, ViewerSession, WatchdogAction,
};
pub use state::{ConnectionState, ReconnectBackoff};
pub use traits::{
    AacDecoder, AudioCapture, AudioSink, Clock, DecoderFactory, DecoderSink, NullAudioSink,
    NullDecoderFactory, NullSurface, RenderSurface, SystemClock,
};
pub use utils::now_millis;
pub use video::FeederConfig;
pub use wire::{should_drop_frame_by_epoch, Message};
