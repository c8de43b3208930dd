//! Configuration management for adb-backup.
//!
//! Loads configuration from a TOML file. Every field has a default, so a
//! missing file, a missing section or a missing key are all fine;
//! command-line flags override whatever the file says.

use crate::transfer::{BatchLimits, StallPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub transfer: TransferConfig,
    pub manifest: ManifestConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path to the adb executable
    #[serde(default = "default_adb_path")]
    pub adb_path: PathBuf,

    /// Device serial, for hosts with more than one device attached
    #[serde(default)]
    pub serial: Option<String>,

    /// Directory on the device to back up
    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    /// Seconds to wait for the device before giving up
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Files below this size are grouped into shared tasks (bytes)
    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold: u64,

    /// Upper bound on the bytes of one grouped task
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,

    /// Upper bound on the files of one grouped task
    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,

    /// Seconds without progress before a task counts as stalled
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// Extra stall periods to wait out before retrying a task
    #[serde(default = "default_stall_wait_periods")]
    pub stall_wait_periods: u32,

    /// Retries of a stalled task before its remaining files fail
    #[serde(default = "default_stall_retries")]
    pub stall_retries: u32,

    /// Seconds between progress log lines
    #[serde(default = "default_progress_log_interval_secs")]
    pub progress_log_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Checkpoint after this many completed files
    #[serde(default = "default_checkpoint_every_files")]
    pub checkpoint_every_files: usize,

    /// Checkpoint at least this often while files complete (seconds)
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// What to do when the stored manifest cannot be read
    #[serde(default)]
    pub on_corrupt: CorruptPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Handling of a manifest that exists but cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptPolicy {
    /// Start from an empty manifest and fetch everything again
    #[default]
    Rebuild,
    /// Refuse to run
    Abort,
}

// Default values
fn default_adb_path() -> PathBuf {
    PathBuf::from("adb")
}

fn default_remote_root() -> String {
    "/sdcard".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_small_file_threshold() -> u64 {
    256 * 1024 // 256 KiB
}

fn default_max_batch_bytes() -> u64 {
    2 * 1024 * 1024 // 2 MiB
}

fn default_max_batch_files() -> usize {
    200
}

fn default_stall_timeout_secs() -> u64 {
    90
}

fn default_stall_wait_periods() -> u32 {
    1
}

fn default_stall_retries() -> u32 {
    1
}

fn default_progress_log_interval_secs() -> u64 {
    5
}

fn default_checkpoint_every_files() -> usize {
    100
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            serial: None,
            remote_root: default_remote_root(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: default_small_file_threshold(),
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_files: default_max_batch_files(),
            stall_timeout_secs: default_stall_timeout_secs(),
            stall_wait_periods: default_stall_wait_periods(),
            stall_retries: default_stall_retries(),
            progress_log_interval_secs: default_progress_log_interval_secs(),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_files: default_checkpoint_every_files(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            on_corrupt: CorruptPolicy::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl TransferConfig {
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            small_file_threshold: self.small_file_threshold,
            max_batch_bytes: self.max_batch_bytes,
            max_batch_files: self.max_batch_files,
        }
    }

    pub fn stall_policy(&self) -> StallPolicy {
        StallPolicy {
            wait_periods: self.stall_wait_periods,
            max_retries: self.stall_retries,
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }
}

impl ManifestConfig {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the run could not work with.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| Err(crate::BackupError::Config(msg.to_string()));

        if !self.device.remote_root.starts_with('/') {
            return invalid("device.remote_root must be an absolute path");
        }
        if self.transfer.max_batch_files == 0 {
            return invalid("transfer.max_batch_files must be at least 1");
        }
        if self.transfer.max_batch_bytes == 0 {
            return invalid("transfer.max_batch_bytes must be at least 1");
        }
        if self.transfer.stall_timeout_secs == 0 {
            return invalid("transfer.stall_timeout_secs must be at least 1");
        }
        if self.manifest.checkpoint_every_files == 0 {
            return invalid("manifest.checkpoint_every_files must be at least 1");
        }
        Ok(())
    }
}
