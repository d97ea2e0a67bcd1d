//! Sink configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shiplog_core::encryption::parse_public_key_hex;
use shiplog_core::{DEFAULT_BUFFER_CAPACITY, DEFAULT_COMPRESSION_LEVEL};

use crate::error::{SinkError, SinkResult};

/// Settings for a [`DurableSink`](crate::DurableSink).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Target directory, created if absent.
    pub dir: PathBuf,
    /// Log file name prefix.
    pub prefix: String,
    /// Receiver's long-term P-256 public key, hex SEC1.
    pub peer_public_key: String,
    /// Seconds between retention sweeps.
    pub eviction_interval_secs: u64,
    /// Size above which the current log file is rotated.
    pub max_file_bytes: u64,
    /// Total size budget for all log files in `dir`.
    pub max_total_bytes: u64,
    /// Minimum capacity of each mapped buffer.
    pub buffer_capacity: usize,
    /// Fill ratio that triggers a buffer swap.
    pub flush_ratio: f64,
    /// zstd level.
    pub compression_level: i32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            prefix: String::from("shiplog"),
            peer_public_key: String::new(),
            eviction_interval_secs: 300,
            max_file_bytes: 4 * 1024 * 1024,
            max_total_bytes: 100 * 1024 * 1024,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_ratio: 0.8,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl SinkConfig {
    /// Default settings writing to `dir` for the given receiver key.
    pub fn new(dir: impl Into<PathBuf>, peer_public_key: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            peer_public_key: peer_public_key.into(),
            ..Self::default()
        }
    }

    /// Loads settings from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> SinkResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SinkError::Config(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| SinkError::Config(e.to_string())),
            _ => Err(SinkError::Config(format!(
                "Unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Rejects settings the sink cannot run with.
    pub fn validate(&self) -> SinkResult<()> {
        if self.prefix.is_empty() {
            return Err(SinkError::Config("prefix must not be empty".into()));
        }
        if self.prefix.contains(std::path::is_separator) {
            return Err(SinkError::Config(format!(
                "prefix {:?} must not contain a path separator",
                self.prefix
            )));
        }
        // Buffers grow before they overflow, so the ratio never exceeds 1.0.
        if !(self.flush_ratio > 0.0 && self.flush_ratio < 1.0) {
            return Err(SinkError::Config(format!(
                "flush_ratio {} is outside (0, 1)",
                self.flush_ratio
            )));
        }
        if self.eviction_interval_secs == 0 {
            return Err(SinkError::Config("eviction_interval_secs must be positive".into()));
        }
        parse_public_key_hex(&self.peer_public_key)
            .map_err(|e| SinkError::Config(format!("peer_public_key: {}", e)))?;
        Ok(())
    }

    /// Retention sweep interval.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}
