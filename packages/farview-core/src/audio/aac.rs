//! ADTS-AAC support: header parsing, AudioSpecificConfig synthesis, and the
//! lazy decoder adapter.
//!
//! The primary sends whole ADTS frames (7-byte headers included). The platform
//! AAC decoder wants an AudioSpecificConfig up front, which the wire never
//! carries, so one is synthesized for AAC-LC from the advertised rate and
//! channel count.

use crate::traits::AacDecoder;

/// ADTS fixed header length (no CRC variant).
pub const ADTS_HEADER_LEN: usize = 7;

/// MPEG-4 sampling frequency index table.
const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Sampling frequency index for a rate, if it is a standard one.
#[must_use]
pub fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|&r| r == rate).map(|i| i as u8)
}

/// Synthesizes a 2-byte AudioSpecificConfig for AAC-LC.
///
/// Layout: 5 bits object type (2 = LC), 4 bits sampling index, 4 bits channel
/// configuration, padding zeros.
#[must_use]
pub fn synthesize_asc(rate: u32, channels: u16) -> Option<[u8; 2]> {
    let index = sample_rate_index(rate)?;
    if channels == 0 || channels > 7 {
        return None;
    }
    let object_type = 2u8; // AAC-LC
    Some([
        (object_type << 3) | (index >> 1),
        ((index & 1) << 7) | ((channels as u8) << 3),
    ])
}

/// Fields pulled from an ADTS frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsInfo {
    /// Whole frame length, header included.
    pub frame_len: usize,
    pub rate: u32,
    pub channels: u16,
}

/// Parses an ADTS header, validating the syncword.
#[must_use]
pub fn parse_adts_header(data: &[u8]) -> Option<AdtsInfo> {
    if data.len() < ADTS_HEADER_LEN {
        return None;
    }
    if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
        return None;
    }
    let rate_index = (data[2] >> 2) & 0x0F;
    let rate = *SAMPLE_RATES.get(rate_index as usize)?;
    let channels = (((data[2] & 0x01) << 2) | (data[3] >> 6)) as u16;
    let frame_len =
        ((data[3] as usize & 0x03) << 11) | ((data[4] as usize) << 3) | (data[5] as usize >> 5);
    if frame_len < ADTS_HEADER_LEN {
        return None;
    }
    Some(AdtsInfo {
        frame_len,
        rate,
        channels,
    })
}

/// Wraps a platform [`AacDecoder`], configuring it lazily on the first frame.
pub struct AdtsAacAdapter {
    decoder: Box<dyn AacDecoder>,
    configured: bool,
}

impl AdtsAacAdapter {
    #[must_use]
    pub fn new(decoder: Box<dyn AacDecoder>) -> Self {
        Self {
            decoder,
            configured: false,
        }
    }

    /// Decodes one ADTS frame into PCM chunks.
    ///
    /// `rate`/`channels` come from the AUDIO_FRAME header and are used for the
    /// one-time configuration; malformed frames are dropped.
    pub fn decode(
        &mut self,
        rate: u32,
        channels: u16,
        adts: &[u8],
        ts_us: i64,
    ) -> Vec<(Vec<u8>, i64)> {
        if parse_adts_header(adts).is_none() {
            log::warn!("[Audio] Dropping AAC packet without valid ADTS header");
            return Vec::new();
        }
        if !self.configured {
            match synthesize_asc(rate, channels) {
                Some(asc) => {
                    log::info!(
                        "[Audio] Configuring AAC decoder: {} Hz, {} ch",
                        rate,
                        channels
                    );
                    self.decoder.configure_adts(rate, channels, &asc);
                    self.configured = true;
                }
                None => {
                    log::warn!(
                        "[Audio] Unsupported AAC format {} Hz / {} ch, dropping",
                        rate,
                        channels
                    );
                    return Vec::new();
                }
            }
        }
        // The decoder receives the entire ADTS frame, header included.
        self.decoder.feed(adts, ts_us);
        self.decoder.drain_pcm()
    }
}
