//! Custom error types for adb-backup.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The device could not be reached, or the listing could not be produced.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A manifest exists but cannot be read back.
    #[error("Manifest corrupt at {path}: {reason}")]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("Transfer of {path} failed: {reason}")]
    FileTransferFailed { path: String, reason: String },

    #[error("Transfer stalled: no progress for {idle_secs}s")]
    Stalled { idle_secs: u64 },

    #[error("Invalid exclude pattern: {0}")]
    Pattern(String),

    /// Another run holds the destination lock.
    #[error("Backup destination is locked by {owner} ({path})")]
    Locked { path: PathBuf, owner: String },
}

pub type Result<T> = std::result::Result<T, BackupError>;
