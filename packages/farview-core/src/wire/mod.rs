//! Wire protocol: typed message model and line codec.
//!
//! Messages are UTF-8 text lines of the form `VERB|key=value|…` terminated by
//! `\n` (a trailing `\r` is tolerated and stripped). Three verbs — FRAME, CSD
//! and AUDIO_FRAME — are followed by a binary payload whose exact length is
//! declared in the header.

mod codec;
mod message;

pub use codec::{encode, parse_line, WireError};
pub use message::{
    should_drop_frame_by_epoch, AudioCodec, AudioDir, AudioFrameHeader, FrameHeader, Message,
    StreamStateCode,
};
