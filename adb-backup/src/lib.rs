//! adb-backup library
//!
//! Incremental, resumable backup of an Android device's storage over adb.
//! A manifest of what was already copied lets each run fetch only new and
//! changed files, and an interrupted run resumes where it stopped.

pub mod config;
pub mod exclude;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod planner;
pub mod remote;
pub mod shutdown;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
