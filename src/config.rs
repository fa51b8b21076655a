use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::whitelist::WhitelistConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub whitelist: WhitelistConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowsentry/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("flowsentry/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

/// Detector thresholds and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Seconds before a connection is considered long
    #[serde(default = "default_long_connection_threshold")]
    pub long_connection_threshold: f64,

    /// Bytes above which an unflagged SSH session is inferred successful
    #[serde(default = "default_ssh_successful_detection_threshold")]
    pub ssh_successful_detection_threshold: u64,

    /// MB sent to one destination before exfiltration alerting
    #[serde(default = "default_data_exfiltration_threshold")]
    pub data_exfiltration_threshold: u64,

    /// Delay before a deferred detector re-checks, in seconds
    #[serde(default = "default_recheck_delay_secs")]
    pub recheck_delay_secs: u64,

    /// Warm-up before connections without DNS are reported on a live
    /// interface; resolutions may predate the capture
    #[serde(default = "default_conn_without_dns_warmup_secs")]
    pub conn_without_dns_warmup_secs: u64,

    /// Reading from a live interface rather than offline input
    #[serde(default)]
    pub live_capture: bool,
}

fn default_long_connection_threshold() -> f64 {
    1500.0
}

fn default_ssh_successful_detection_threshold() -> u64 {
    4290
}

fn default_data_exfiltration_threshold() -> u64 {
    700
}

fn default_recheck_delay_secs() -> u64 {
    15
}

fn default_conn_without_dns_warmup_secs() -> u64 {
    180
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            long_connection_threshold: default_long_connection_threshold(),
            ssh_successful_detection_threshold: default_ssh_successful_detection_threshold(),
            data_exfiltration_threshold: default_data_exfiltration_threshold(),
            recheck_delay_secs: default_recheck_delay_secs(),
            conn_without_dns_warmup_secs: default_conn_without_dns_warmup_secs(),
            live_capture: false,
        }
    }
}

/// Event loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Event channel capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Optional CSV of known `port/proto,service` pairs loaded at start
    #[serde(default)]
    pub ports_info_path: Option<PathBuf>,
}

fn default_buffer_size() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            ports_info_path: None,
        }
    }
}
