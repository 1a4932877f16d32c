use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::partition::{PartitionDescriptor, PartitionTable};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "espvault.toml";

/// Tool configuration: serial link parameters, transfer tuning and the
/// backup storage location. Every field has a default so the tool runs
/// without a config file; CLI flags override individual fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: String,
    pub baud_rate: u32,
    /// Bytes per read/write transfer, sized to respect protocol buffers.
    pub chunk_size: usize,
    /// Total attempts per transfer before the failure becomes terminal.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub timeout_ms: u64,
    pub backup_dir: PathBuf,
    /// Replaces the built-in partition layout when non-empty.
    pub partitions: Vec<PartitionDescriptor>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 921_600,
            chunk_size: 4096,
            retry_attempts: 3,
            retry_backoff_ms: 100,
            timeout_ms: 3000,
            backup_dir: PathBuf::from("backups"),
            partitions: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the given file, or `espvault.toml` if present, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => Config::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);

                if fallback.exists() {
                    Config::from_file(fallback)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Config> {
        log::debug!("loading config from {}", path.display());

        let text = fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// The partition layout in effect: the configured one, or the built-in
    /// ESP32 4 MiB layout when the config names none.
    pub fn partition_table(&self) -> PartitionTable {
        if self.partitions.is_empty() {
            PartitionTable::esp32_4m()
        } else {
            PartitionTable::new(self.partitions.clone())
        }
    }
}
