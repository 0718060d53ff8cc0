//! Handshake sequencing: HELLO, challenge-response, negotiation bursts.

use crate::auth::challenge_response;
use crate::profile::StreamProfile;
use crate::protocol_constants::{CLIENT_ID, PROTOCOL_VERSION};
use crate::wire::Message;

/// Viewer capabilities advertised in CAPS.
#[derive(Debug, Clone, Copy)]
pub struct ViewerCaps {
    pub max_width: u32,
    pub max_height: u32,
    pub max_bitrate: u32,
}

impl Default for ViewerCaps {
    fn default() -> Self {
        Self {
            max_width: 2_560,
            max_height: 1_920,
            max_bitrate: 8_000_000,
        }
    }
}

/// The opening message of every connection.
#[must_use]
pub fn hello() -> Message {
    Message::Hello {
        client: CLIENT_ID.to_string(),
        version: PROTOCOL_VERSION,
    }
}

/// Response to AUTH_CHALLENGE.
#[must_use]
pub fn auth_response(password: &str, salt: &str) -> Message {
    Message::AuthResponse {
        hash: challenge_response(password, salt),
    }
}

/// Full negotiation burst: CAPS, SET_STREAM, REQ_KEYFRAME.
#[must_use]
pub fn negotiation_burst(caps: ViewerCaps, profile: StreamProfile) -> Vec<Message> {
    vec![
        Message::Caps {
            max_width: caps.max_width,
            max_height: caps.max_height,
            max_bitrate: caps.max_bitrate,
        },
        Message::SetStream {
            width: profile.width,
            height: profile.height,
            bitrate: profile.bitrate,
            fps: profile.fps,
        },
        Message::ReqKeyframe,
    ]
}

/// Resume burst for a known session id.
#[must_use]
pub fn resume_burst(session_id: &str) -> Vec<Message> {
    vec![
        Message::Resume {
            session: session_id.to_string(),
        },
        Message::ReqKeyframe,
    ]
}

/// Tracks the one-shot retry allowed for `ERROR|reason=caps_required`.
pub struct CapsRetry {
    used: bool,
}

impl CapsRetry {
    #[must_use]
    pub fn new() -> Self {
        Self { used: false }
    }

    /// Whether a caps_required error may still trigger a resend.
    pub fn take(&mut self) -> bool {
        !std::mem::replace(&mut self.used, true)
    }

    /// Re-arms on a fresh connection.
    pub fn reset(&mut self) {
        self.used = false;
    }
}

impl Default for CapsRetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode;

    #[test]
    fn hello_line_is_canonical() {
        assert_eq!(encode(&hello()), "HELLO|client=viewer|version=1\n");
    }

    #[test]
    fn auth_response_carries_hex_hmac() {
        let Message::AuthResponse { hash } = auth_response("pw", "abc") else {
            panic!("expected AuthResponse");
        };
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, challenge_response("pw", "abc"));
    }

    #[test]
    fn negotiation_burst_order() {
        let burst = negotiation_burst(ViewerCaps::default(), StreamProfile::HIGH);
        assert!(matches!(burst[0], Message::Caps { .. }));
        assert!(matches!(
            burst[1],
            Message::SetStream {
                width: 1080,
                height: 1440,
                ..
            }
        ));
        assert_eq!(burst[2], Message::ReqKeyframe);
    }

    #[test]
    fn resume_burst_requests_keyframe_immediately() {
        let burst = resume_burst("s-1");
        assert_eq!(
            burst,
            vec![
                Message::Resume {
                    session: "s-1".into()
                },
                Message::ReqKeyframe
            ]
        );
    }

    #[test]
    fn caps_retry_is_single_shot() {
        let mut retry = CapsRetry::new();
        assert!(retry.take());
        assert!(!retry.take());
        retry.reset();
        assert!(retry.take());
    }
}
