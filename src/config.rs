//! Emulator configuration.
//!
//! Loaded from a TOML file (default `~/.config/ocpp-emulator/config.toml`,
//! overridable via the `OCPP_EMULATOR_CONFIG` environment variable) and
//! lists the set of stations this process should run, plus process-wide
//! logging and reconnect defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::station::StationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Hard cap on reconnect attempts before a station gives up and moves
    /// to a permanent error state. `0` means retry forever.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 60,
            max_attempts: 0,
        }
    }
}

/// Process-wide defaults that aren't tied to any single station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Cadence of the station manager's config/runtime sync sweep.
    pub sync_interval_secs: u64,
    /// Default deadline for an outbound `Call` awaiting a reply.
    pub pending_request_timeout_secs: u64,
    /// How long a rejected idTag is remembered before re-authorizing.
    pub auth_rejection_ttl_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 30,
            pending_request_timeout_secs: 10,
            auth_rejection_ttl_secs: 60,
        }
    }
}

/// Top-level configuration for the emulator process: one or more
/// stations plus process-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            reconnect: ReconnectConfig::default(),
            global: GlobalConfig::default(),
            stations: Vec::new(),
        }
    }
}

impl EmulatorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Default config path: `~/.config/ocpp-emulator/config.toml` (or the
/// platform equivalent via `dirs_next`).
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-emulator")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_stations() {
        let cfg = EmulatorConfig::default();
        assert!(cfg.stations.is_empty());
        assert_eq!(cfg.reconnect.base_delay_secs, 1);
    }

    #[test]
    fn load_missing_file_errors() {
        let result = EmulatorConfig::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }
}
