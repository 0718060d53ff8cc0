//! Stream profiles and start-profile selection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A requested video stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    pub width: u32,
    pub height: u32,
    /// Bits per second.
    pub bitrate: u32,
    pub fps: u32,
}

impl StreamProfile {
    /// High-tier start profile.
    pub const HIGH: Self = Self {
        width: 1080,
        height: 1440,
        bitrate: 5_000_000,
        fps: 30,
    };

    /// Low-tier start profile.
    pub const LOW: Self = Self {
        width: 720,
        height: 960,
        bitrate: 3_000_000,
        fps: 30,
    };

    /// First performance fallback: mid resolution at reduced frame rate.
    pub const PERF_MID: Self = Self {
        width: 720,
        height: 960,
        bitrate: 2_000_000,
        fps: 20,
    };

    /// Final performance fallback.
    pub const PERF_FLOOR: Self = Self {
        width: 480,
        height: 640,
        bitrate: 900_000,
        fps: 15,
    };
}

/// Rough device capability hint used to pick the start profile.
///
/// A hint, not an allowlist: unknown devices start high and rely on the
/// performance controller to back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceTier {
    #[default]
    High,
    Low,
}

/// Picks the profile for the initial SET_STREAM.
///
/// A persisted override may bias the choice, but an override below the
/// low-tier floor is ignored so a transient downgrade can't become sticky
/// across restarts.
#[must_use]
pub fn start_profile(tier: DeviceTier, stored_override: Option<StreamProfile>) -> StreamProfile {
    let base = match tier {
        DeviceTier::High => StreamProfile::HIGH,
        DeviceTier::Low => StreamProfile::LOW,
    };
    match stored_override {
        Some(p) if p.width >= StreamProfile::LOW.width && p.height >= StreamProfile::LOW.height => {
            p
        }
        Some(p) => {
            log::info!(
                "[Profile] Ignoring stored downgrade override {}x{}",
                p.width,
                p.height
            );
            base
        }
        None => base,
    }
}

/// Persistence for the start-profile override.
pub trait ProfileStore: Send + Sync {
    /// Loads the stored override, if any.
    fn load(&self) -> Option<StreamProfile>;

    /// Stores an override, replacing any previous value.
    fn save(&self, profile: &StreamProfile);
}

/// JSON-file-backed [`ProfileStore`].
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ProfileStore for JsonProfileStore {
    fn load(&self) -> Option<StreamProfile> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&data) {
            Ok(profile) => Some(profile),
            Err(e) => {
                log::warn!("[Profile] Discarding unreadable override file: {}", e);
                None
            }
        }
    }

    fn save(&self, profile: &StreamProfile) {
        let json = match serde_json::to_string_pretty(profile) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("[Profile] Failed to serialize override: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, json) {
            log::warn!("[Profile] Failed to persist override: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tier_starts_high() {
        assert_eq!(start_profile(DeviceTier::High, None), StreamProfile::HIGH);
    }

    #[test]
    fn low_tier_starts_low() {
        assert_eq!(start_profile(DeviceTier::Low, None), StreamProfile::LOW);
    }

    #[test]
    fn override_applies_when_at_or_above_floor() {
        let stored = StreamProfile {
            width: 720,
            height: 960,
            bitrate: 4_000_000,
            fps: 30,
        };
        assert_eq!(start_profile(DeviceTier::High, Some(stored)), stored);
    }

    #[test]
    fn downgrade_override_is_ignored() {
        let stored = StreamProfile {
            width: 480,
            height: 640,
            bitrate: 900_000,
            fps: 15,
        };
        assert_eq!(
            start_profile(DeviceTier::High, Some(stored)),
            StreamProfile::HIGH
        );
        assert_eq!(
            start_profile(DeviceTier::Low, Some(stored)),
            StreamProfile::LOW
        );
    }

    #[test]
    fn json_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("profile.json"));
        assert!(store.load().is_none());

        store.save(&StreamProfile::PERF_MID);
        assert_eq!(store.load(), Some(StreamProfile::PERF_MID));
    }

    #[test]
    fn json_store_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonProfileStore::new(path);
        assert!(store.load().is_none());
    }
}
