//! Line header parser and emitter.
//!
//! The parser is tolerant: unknown keys are ignored, key order does not
//! matter, and a handful of legacy positional forms (`STREAM_STATE|4`) are
//! accepted. The emitter is canonical: fixed key order per verb, base-10
//! integers, lowercase `true`/`false`. Parsing a canonically emitted line and
//! re-emitting it yields byte-equal output.

use std::collections::HashMap;

use thiserror::Error;

use crate::protocol_constants::{MAX_HEADER_LINE_BYTES, MAX_PAYLOAD_BYTES};

use super::message::{
    AudioCodec, AudioDir, AudioFrameHeader, FrameHeader, Message, StreamStateCode,
};

/// Errors produced by the line parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Structurally unusable header (missing/invalid size fields, bad UTF-8
    /// framing, oversized line).
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Verb not in the protocol table. `declared_size` is the `size=` value if
    /// the header carried one, letting the reader skip a payload defensively.
    #[error("unknown verb: {verb}")]
    UnknownVerb {
        verb: String,
        declared_size: Option<usize>,
    },
}

struct Fields<'a> {
    verb: &'a str,
    params: HashMap<&'a str, &'a str>,
    bare: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn split(line: &'a str) -> Result<Self, WireError> {
        let mut parts = line.split('|');
        let verb = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WireError::MalformedHeader("empty line".into()))?;

        let mut params = HashMap::new();
        let mut bare = Vec::new();
        for part in parts {
            match part.split_once('=') {
                Some((key, value)) => {
                    params.insert(key, value);
                }
                None if !part.is_empty() => bare.push(part),
                None => {}
            }
        }
        Ok(Self { verb, params, bare })
    }

    fn str(&self, key: &str) -> Option<&'a str> {
        self.params.get(key).copied()
    }

    fn req_str(&self, key: &str) -> Result<String, WireError> {
        self.str(key)
            .map(str::to_string)
            .ok_or_else(|| WireError::MalformedHeader(format!("{}: missing {key}", self.verb)))
    }

    fn int<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn req_int<T: std::str::FromStr>(&self, key: &str) -> Result<T, WireError> {
        self.str(key)
            .ok_or_else(|| WireError::MalformedHeader(format!("{}: missing {key}", self.verb)))?
            .parse()
            .map_err(|_| WireError::MalformedHeader(format!("{}: bad {key}", self.verb)))
    }

    fn req_size(&self, key: &str) -> Result<usize, WireError> {
        let size: usize = self.req_int(key)?;
        if size > MAX_PAYLOAD_BYTES {
            return Err(WireError::MalformedHeader(format!(
                "{}: {key}={size} exceeds payload ceiling",
                self.verb
            )));
        }
        Ok(size)
    }

    fn bool(&self, key: &str) -> bool {
        self.str(key) == Some("true")
    }
}

/// Parses one header line into a typed message.
///
/// Accepts the line with or without the trailing `\n`/`\r\n`.
pub fn parse_line(line: &str) -> Result<Message, WireError> {
    if line.len() > MAX_HEADER_LINE_BYTES {
        return Err(WireError::MalformedHeader(format!(
            "header line of {} bytes",
            line.len()
        )));
    }
    let line = line.trim_end_matches('\n').trim_end_matches('\r');
    let f = Fields::split(line)?;

    let msg = match f.verb {
        "HELLO" => Message::Hello {
            client: f.req_str("client")?,
            version: f.int("version", 1),
        },
        "AUTH_CHALLENGE" => Message::AuthChallenge {
            salt: f.req_str("salt")?,
        },
        "AUTH_RESPONSE" => Message::AuthResponse {
            hash: f.req_str("hash")?,
        },
        "AUTH_OK" => Message::AuthOk,
        "AUTH_FAIL" => Message::AuthFail,
        "SESSION" => Message::Session { id: f.req_str("id")? },
        "RESUME" => Message::Resume {
            session: f.req_str("session")?,
        },
        "RESUME_OK" => Message::ResumeOk,
        "RESUME_FAIL" => Message::ResumeFail,
        "CAPS" => Message::Caps {
            max_width: f.req_int("maxWidth")?,
            max_height: f.req_int("maxHeight")?,
            max_bitrate: f.req_int("maxBitrate")?,
        },
        "SET_STREAM" => Message::SetStream {
            width: f.req_int("width")?,
            height: f.req_int("height")?,
            bitrate: f.req_int("bitrate")?,
            fps: f.req_int("fps")?,
        },
        "STREAM_ACCEPTED" => Message::StreamAccepted {
            epoch: f.int("epoch", 0),
            width: f.req_int("width")?,
            height: f.req_int("height")?,
            bitrate: f.int("bitrate", 0),
            fps: f.int("fps", 30),
        },
        "ADJUST_BITRATE" => Message::AdjustBitrate {
            bitrate: f.req_int("bitrate")?,
        },
        "BITRATE_ADJUSTED" => Message::BitrateAdjusted {
            bitrate: f.req_int("bitrate")?,
        },
        "CSD" => Message::Csd {
            epoch: f.int("epoch", 0),
            sps_len: f.req_size("sps")?,
            pps_len: f.req_size("pps")?,
        },
        "FRAME" => Message::Frame(FrameHeader {
            epoch: f.int("epoch", 0),
            seq: f.int("seq", 0),
            size: f.req_size("size")?,
            key: f.bool("key"),
            ts_us: f.int("tsUs", 0),
            srv_ms: f.int("srvMs", 0),
            cap_ms: f.int("capMs", 0),
            age_ms: f.int("ageMs", 0),
        }),
        "AUDIO_FRAME" => Message::AudioFrame(AudioFrameHeader {
            dir: match f.str("dir") {
                Some("up") => AudioDir::Up,
                Some("down") | None => AudioDir::Down,
                Some(other) => {
                    return Err(WireError::MalformedHeader(format!(
                        "AUDIO_FRAME: bad dir {other}"
                    )))
                }
            },
            size: f.req_size("size")?,
            rate: f.int("rate", 48_000),
            channels: f.int("ch", 1),
            format: match f.str("format") {
                Some("aac") => AudioCodec::Aac,
                _ => AudioCodec::Pcm,
            },
            ts_us: f.int("tsUs", 0),
        }),
        "PING" => Message::Ping {
            ts_ms: f.int("tsMs", 0),
        },
        "PONG" => Message::Pong {
            ts_ms: f.int("tsMs", 0),
            srv_ms: f.int("srvMs", 0),
        },
        "REQ_KEYFRAME" => Message::ReqKeyframe,
        "BACKPRESSURE" => Message::Backpressure,
        "PRESSURE_CLEAR" => Message::PressureClear,
        "START_RECORDING" => Message::StartRecording,
        "STOP_RECORDING" => Message::StopRecording,
        "RECORDING" => Message::Recording {
            active: f.bool("active"),
        },
        "SWITCH_CAMERA" => Message::SwitchCamera,
        "CAMERA" => Message::Camera {
            facing: f.req_str("facing")?,
        },
        "ZOOM" => Message::Zoom {
            level: f.str("level").and_then(|v| v.parse().ok()).unwrap_or(1.0),
        },
        "ENC_ROT" => Message::EncRot {
            deg: f.int("deg", 0),
        },
        "COMM" => Message::Comm {
            enabled: f.bool("enabled"),
        },
        "STREAM_STATE" => {
            // Older primaries send the code positionally: STREAM_STATE|4
            let code: u32 = match f.str("state") {
                Some(v) => v.parse().map_err(|_| {
                    WireError::MalformedHeader("STREAM_STATE: bad state".into())
                })?,
                None => f
                    .bare
                    .first()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        WireError::MalformedHeader("STREAM_STATE: missing state".into())
                    })?,
            };
            let code = StreamStateCode::from_code(code).ok_or_else(|| {
                WireError::MalformedHeader(format!("STREAM_STATE: unknown code {code}"))
            })?;
            Message::StreamState {
                code,
                epoch: f.int("epoch", 0),
            }
        }
        "ERROR" => Message::Error {
            reason: f.str("reason").unwrap_or("unknown").to_string(),
        },
        other => {
            return Err(WireError::UnknownVerb {
                verb: other.to_string(),
                declared_size: f.str("size").and_then(|v| v.parse().ok()),
            })
        }
    };
    Ok(msg)
}

/// Emits the canonical header line for a message, including the trailing `\n`.
///
/// For binary-bearing messages this is the header only; the caller writes the
/// payload immediately after, under the same writer lock.
#[must_use]
pub fn encode(msg: &Message) -> String {
    match msg {
        Message::Hello { client, version } => {
            format!("HELLO|client={client}|version={version}\n")
        }
        Message::AuthChallenge { salt } => format!("AUTH_CHALLENGE|salt={salt}\n"),
        Message::AuthResponse { hash } => format!("AUTH_RESPONSE|hash={hash}\n"),
        Message::AuthOk => "AUTH_OK\n".to_string(),
        Message::AuthFail => "AUTH_FAIL\n".to_string(),
        Message::Session { id } => format!("SESSION|id={id}\n"),
        Message::Resume { session } => format!("RESUME|session={session}\n"),
        Message::ResumeOk => "RESUME_OK\n".to_string(),
        Message::ResumeFail => "RESUME_FAIL\n".to_string(),
        Message::Caps {
            max_width,
            max_height,
            max_bitrate,
        } => format!("CAPS|maxWidth={max_width}|maxHeight={max_height}|maxBitrate={max_bitrate}\n"),
        Message::SetStream {
            width,
            height,
            bitrate,
            fps,
        } => format!("SET_STREAM|width={width}|height={height}|bitrate={bitrate}|fps={fps}\n"),
        Message::StreamAccepted {
            epoch,
            width,
            height,
            bitrate,
            fps,
        } => format!(
            "STREAM_ACCEPTED|epoch={epoch}|width={width}|height={height}|bitrate={bitrate}|fps={fps}\n"
        ),
        Message::AdjustBitrate { bitrate } => format!("ADJUST_BITRATE|bitrate={bitrate}\n"),
        Message::BitrateAdjusted { bitrate } => format!("BITRATE_ADJUSTED|bitrate={bitrate}\n"),
        Message::Csd {
            epoch,
            sps_len,
            pps_len,
        } => format!("CSD|epoch={epoch}|sps={sps_len}|pps={pps_len}\n"),
        Message::Frame(h) => format!(
            "FRAME|epoch={}|seq={}|size={}|key={}|tsUs={}|srvMs={}|capMs={}|ageMs={}\n",
            h.epoch, h.seq, h.size, h.key, h.ts_us, h.srv_ms, h.cap_ms, h.age_ms
        ),
        Message::AudioFrame(h) => format!(
            "AUDIO_FRAME|dir={}|size={}|rate={}|ch={}|format={}|tsUs={}\n",
            h.dir.as_str(),
            h.size,
            h.rate,
            h.channels,
            h.format.as_str(),
            h.ts_us
        ),
        Message::Ping { ts_ms } => format!("PING|tsMs={ts_ms}\n"),
        Message::Pong { ts_ms, srv_ms } => format!("PONG|tsMs={ts_ms}|srvMs={srv_ms}\n"),
        Message::ReqKeyframe => "REQ_KEYFRAME\n".to_string(),
        Message::Backpressure => "BACKPRESSURE\n".to_string(),
        Message::PressureClear => "PRESSURE_CLEAR\n".to_string(),
        Message::StartRecording => "START_RECORDING\n".to_string(),
        Message::StopRecording => "STOP_RECORDING\n".to_string(),
        Message::Recording { active } => format!("RECORDING|active={active}\n"),
        Message::SwitchCamera => "SWITCH_CAMERA\n".to_string(),
        Message::Camera { facing } => format!("CAMERA|facing={facing}\n"),
        Message::Zoom { level } => format!("ZOOM|level={level}\n"),
        Message::EncRot { deg } => format!("ENC_ROT|deg={deg}\n"),
        Message::Comm { enabled } => format!("COMM|enabled={enabled}\n"),
        Message::StreamState { code, epoch } => {
            format!("STREAM_STATE|state={}|epoch={epoch}\n", code.code())
        }
        Message::Error { reason } => format!("ERROR|reason={reason}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame_header() {
        let msg = parse_line(
            "FRAME|epoch=3|seq=41|size=1024|key=true|tsUs=99|srvMs=5|capMs=4|ageMs=1\n",
        )
        .unwrap();
        let Message::Frame(h) = msg else {
            panic!("expected Frame, got {msg:?}");
        };
        assert_eq!(h.epoch, 3);
        assert_eq!(h.seq, 41);
        assert_eq!(h.size, 1024);
        assert!(h.key);
        assert_eq!(h.ts_us, 99);
    }

    #[test]
    fn frame_without_size_is_malformed() {
        let err = parse_line("FRAME|epoch=3|seq=41|key=true").unwrap_err();
        assert!(matches!(err, WireError::MalformedHeader(_)));
    }

    #[test]
    fn csd_requires_both_size_fields() {
        assert!(parse_line("CSD|epoch=1|sps=12|pps=4").is_ok());
        assert!(matches!(
            parse_line("CSD|epoch=1|sps=12"),
            Err(WireError::MalformedHeader(_))
        ));
        assert!(matches!(
            parse_line("CSD|epoch=1|pps=4"),
            Err(WireError::MalformedHeader(_))
        ));
    }

    #[test]
    fn impossible_size_is_malformed() {
        let line = format!("FRAME|epoch=1|seq=0|size={}|key=false", usize::MAX);
        assert!(matches!(
            parse_line(&line),
            Err(WireError::MalformedHeader(_))
        ));
    }

    #[test]
    fn tolerates_unknown_keys_and_any_order() {
        let msg = parse_line("PONG|srvMs=7|futureKey=x|tsMs=3").unwrap();
        assert_eq!(msg, Message::Pong { ts_ms: 3, srv_ms: 7 });
    }

    #[test]
    fn tolerates_crlf() {
        assert_eq!(parse_line("AUTH_OK\r\n").unwrap(), Message::AuthOk);
    }

    #[test]
    fn unknown_verb_reports_declared_size() {
        let err = parse_line("FUTURE_BLOB|size=128|x=1").unwrap_err();
        assert_eq!(
            err,
            WireError::UnknownVerb {
                verb: "FUTURE_BLOB".into(),
                declared_size: Some(128),
            }
        );

        let err = parse_line("FUTURE_TEXT|x=1").unwrap_err();
        assert_eq!(
            err,
            WireError::UnknownVerb {
                verb: "FUTURE_TEXT".into(),
                declared_size: None,
            }
        );
    }

    #[test]
    fn stream_state_accepts_positional_code() {
        let msg = parse_line("STREAM_STATE|4").unwrap();
        assert_eq!(
            msg,
            Message::StreamState {
                code: StreamStateCode::Stopped,
                epoch: 0,
            }
        );
    }

    #[test]
    fn stream_state_accepts_keyed_code() {
        let msg = parse_line("STREAM_STATE|state=2|epoch=9").unwrap();
        assert_eq!(
            msg,
            Message::StreamState {
                code: StreamStateCode::Reconfiguring,
                epoch: 9,
            }
        );
    }

    #[test]
    fn audio_frame_defaults() {
        let msg = parse_line("AUDIO_FRAME|dir=down|size=640").unwrap();
        let Message::AudioFrame(h) = msg else {
            panic!("expected AudioFrame");
        };
        assert_eq!(h.rate, 48_000);
        assert_eq!(h.channels, 1);
        assert_eq!(h.format, AudioCodec::Pcm);
    }

    #[test]
    fn canonical_lines_round_trip_byte_equal() {
        let lines = [
            "HELLO|client=viewer|version=1\n",
            "AUTH_CHALLENGE|salt=abc123\n",
            "AUTH_RESPONSE|hash=deadbeef\n",
            "AUTH_OK\n",
            "AUTH_FAIL\n",
            "SESSION|id=s-42\n",
            "RESUME|session=s-42\n",
            "RESUME_OK\n",
            "RESUME_FAIL\n",
            "CAPS|maxWidth=2560|maxHeight=1920|maxBitrate=8000000\n",
            "SET_STREAM|width=1080|height=1440|bitrate=5000000|fps=30\n",
            "STREAM_ACCEPTED|epoch=1|width=1080|height=1440|bitrate=5000000|fps=30\n",
            "ADJUST_BITRATE|bitrate=3500000\n",
            "BITRATE_ADJUSTED|bitrate=3500000\n",
            "CSD|epoch=1|sps=12|pps=4\n",
            "FRAME|epoch=1|seq=0|size=20|key=true|tsUs=0|srvMs=1|capMs=2|ageMs=3\n",
            "AUDIO_FRAME|dir=up|size=1920|rate=48000|ch=1|format=pcm|tsUs=50\n",
            "PING|tsMs=1712345678901\n",
            "PONG|tsMs=1712345678901|srvMs=1712345679000\n",
            "REQ_KEYFRAME\n",
            "BACKPRESSURE\n",
            "PRESSURE_CLEAR\n",
            "START_RECORDING\n",
            "STOP_RECORDING\n",
            "RECORDING|active=true\n",
            "SWITCH_CAMERA\n",
            "CAMERA|facing=front\n",
            "ZOOM|level=2.5\n",
            "ENC_ROT|deg=90\n",
            "COMM|enabled=false\n",
            "STREAM_STATE|state=1|epoch=3\n",
            "ERROR|reason=caps_required\n",
        ];
        for line in lines {
            let msg = parse_line(line).unwrap_or_else(|e| panic!("{line:?}: {e}"));
            assert_eq!(encode(&msg), line, "round trip mismatch for {line:?}");
        }
    }

    #[test]
    fn negative_timestamps_parse() {
        let msg = parse_line("FRAME|epoch=1|seq=-1|size=5|key=false|tsUs=-20").unwrap();
        let Message::Frame(h) = msg else { panic!() };
        assert_eq!(h.seq, -1);
        assert_eq!(h.ts_us, -20);
    }
}
