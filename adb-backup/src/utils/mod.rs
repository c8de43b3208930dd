//! Utility modules for adb-backup.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
