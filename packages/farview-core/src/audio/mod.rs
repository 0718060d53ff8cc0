//! Audio paths: downstream playback (PCM and ADTS-AAC) and talkback uplink.

mod aac;
mod downstream;
mod gate;
mod uplink;

pub use aac::{parse_adts_header, sample_rate_index, synthesize_asc, AdtsAacAdapter, AdtsInfo};
pub use downstream::{AudioDownstream, AudioPacket, PlaybackQueue};
pub use gate::{rms_i16le, GateDecision, NoiseGate};
pub use uplink::{Talkback, UplinkFrame};
