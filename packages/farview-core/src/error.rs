//! Centralized error types for the viewer core.
//!
//! Every failure surfaced to an embedding UI goes through [`ViewerError`],
//! which maps to a machine-readable code and a standardized user-facing
//! message. Low-level I/O strings never reach the user directly.

use thiserror::Error;

/// Application-wide error type for the viewer session.
#[derive(Debug, Error)]
pub enum ViewerError {
    /// Socket read/write error or connect timeout; recoverable by reconnect.
    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    /// Unparseable header or impossible size field; session is reset.
    #[error("malformed protocol data: {0}")]
    ProtocolMalformed(String),

    /// Challenge-response failed; auto-reconnect is disabled.
    #[error("authentication failed")]
    AuthFailed,

    /// Decoder misbehaved; the session stays up while the decoder is rebuilt.
    #[error("decoder failure: {0}")]
    DecoderFailure(String),

    /// Byte pool soft cap hit; the single request was served off-pool.
    #[error("pool exhausted for {0} bytes")]
    ResourceExhausted(usize),

    /// No frames within the watchdog thresholds.
    #[error("stream stalled")]
    StalledStream,

    /// Unknown verb that declares a binary payload of unknowable length.
    #[error("unknown binary verb: {0}")]
    UnknownVerb(String),
}

impl ViewerError {
    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "transient_io",
            Self::ProtocolMalformed(_) => "protocol_malformed",
            Self::AuthFailed => "auth_failed",
            Self::DecoderFailure(_) => "decoder_failure",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::StalledStream => "stalled_stream",
            Self::UnknownVerb(_) => "unknown_verb",
        }
    }

    /// Returns the standardized user-facing message for this error.
    ///
    /// These strings are shown verbatim by embedding UIs; raw exception text
    /// must not leak into them.
    pub fn user_message(&self) -> String {
        match self {
            Self::TransientIo(io) => match io.kind() {
                std::io::ErrorKind::TimedOut => {
                    "Connection timed out. Please check the server IP and your network."
                        .to_string()
                }
                std::io::ErrorKind::ConnectionRefused => {
                    "Connection refused. Please make sure the server is running.".to_string()
                }
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::AddrNotAvailable => {
                    "Invalid server IP address. Please check the address and try again."
                        .to_string()
                }
                _ => "Connection lost. Reconnecting…".to_string(),
            },
            Self::AuthFailed => {
                "Authentication failed. Please check the password and try again.".to_string()
            }
            Self::ProtocolMalformed(_) | Self::UnknownVerb(_) => {
                "The server sent data this app could not understand.".to_string()
            }
            Self::DecoderFailure(_) => "Video decoding hiccup, recovering…".to_string(),
            Self::ResourceExhausted(_) => "Running low on memory for video buffers.".to_string(),
            Self::StalledStream => "No video received. Waiting for the camera…".to_string(),
        }
    }

    /// Whether the session may auto-reconnect after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::AuthFailed)
    }
}

/// Convenient Result alias for viewer-core operations.
pub type ViewerResult<T> = Result<T, ViewerError>;
