//! Single-run lock for a backup destination.
//!
//! Two runs against the same manifest would plan against the same state
//! and transfer everything twice. The lock is a file created with
//! `create_new`, holding `pid@hostname` of its owner, and removed on drop.
//! A lock left behind by a dead process on this host is reclaimed.

use crate::{BackupError, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = "lock";

#[derive(Debug)]
pub struct DestinationLock {
    path: PathBuf,
}

impl DestinationLock {
    pub fn acquire(meta_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(meta_dir)?;
        let path = meta_dir.join(LOCK_FILE);
        let owner = format!("{}@{}", std::process::id(), local_hostname());

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(owner.as_bytes())?;
                    file.sync_all()?;
                    debug!("Acquired lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(&path).unwrap_or_default();
                    let holder = holder.trim().to_string();
                    if is_stale(&holder) {
                        warn!("Removing stale lock held by {}", holder);
                        std::fs::remove_file(&path)?;
                        continue;
                    }
                    return Err(BackupError::Locked { path, owner: holder });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BackupError::Locked { path, owner: "unknown".to_string() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// A lock is stale when its owner ran on this host and is gone.
fn is_stale(holder: &str) -> bool {
    let Some((pid, host)) = holder.split_once('@') else {
        return false;
    };
    let Ok(pid) = pid.parse::<i32>() else {
        return false;
    };
    host == local_hostname() && !process_alive(pid)
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 only checks for existence
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}
