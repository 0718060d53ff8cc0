//! Viewer configuration.
//!
//! Supports loading from YAML files with CLI/environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Viewer configuration loaded from YAML with CLI overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Primary host to connect to.
    /// Override: `FARVIEW_HOST`
    pub host: String,

    /// Primary port.
    /// Override: `FARVIEW_PORT`
    pub port: u16,

    /// Link password for challenge-response auth.
    /// Override: `FARVIEW_PASSWORD`
    pub password: String,

    /// Treat this machine as a low-tier device (start at 720×960).
    pub low_tier: bool,

    /// Interval in seconds between stats log lines (0 disables).
    pub stats_interval: u64,

    /// File used to persist the start-profile override.
    pub profile_file: Option<PathBuf>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.2".to_string(),
            port: 49152,
            password: String::new(),
            low_tier: false,
            stats_interval: 10,
            profile_file: None,
        }
    }
}

impl ViewerConfig {
    /// Loads configuration from a YAML file, or defaults when no file given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = ViewerConfig::load(None).unwrap();
        assert_eq!(config.port, 49152);
        assert_eq!(config.stats_interval, 10);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer.yaml");
        std::fs::write(&path, "host: 10.0.0.9\npassword: secret\n").unwrap();
        let config = ViewerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.host, "10.0.0.9");
        assert_eq!(config.password, "secret");
        assert_eq!(config.port, 49152);
    }

    #[test]
    fn bad_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer.yaml");
        std::fs::write(&path, "port: [not a port]").unwrap();
        assert!(ViewerConfig::load(Some(&path)).is_err());
    }
}
