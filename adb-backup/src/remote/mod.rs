//! Remote device capabilities.
//!
//! The sync engine only needs two things from a device:
//! - [`RemoteLister`]: enumerate the remote tree with metadata
//! - [`BatchPull`]: fetch a group of remote files into local paths,
//!   reporting per-file completion as a stream of [`PullEvent`]s
//!
//! [`adb::AdbBridge`] implements both over the `adb` binary.

pub mod adb;
#[cfg(test)]
pub(crate) mod fake;
pub mod listing;

use crate::transfer::BatchTask;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Kind of a remote filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One object found on the device during listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Path relative to the remote root, `/`-separated, no leading slash
    pub path: String,

    pub kind: EntryKind,

    /// Size in bytes (0 for directories)
    pub size: u64,

    /// Last modification time, nanoseconds since the Unix epoch
    pub mtime_ns: i64,

    /// Creation time, when the device can report it
    pub created_ns: Option<i64>,

    /// Link target for symlinks
    pub link_target: Option<String>,
}

impl RemoteEntry {
    pub fn file(path: impl Into<String>, size: u64, mtime_ns: i64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            mtime_ns,
            created_ns: None,
            link_target: None,
        }
    }

    pub fn directory(path: impl Into<String>, mtime_ns: i64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            mtime_ns,
            created_ns: None,
            link_target: None,
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>, mtime_ns: i64) -> Self {
        let target = target.into();
        Self {
            path: path.into(),
            kind: EntryKind::Symlink,
            size: target.len() as u64,
            mtime_ns,
            created_ns: None,
            link_target: Some(target),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Enumerates the remote tree.
#[async_trait]
pub trait RemoteLister: Send + Sync {
    /// List every object below `root` (the root itself excluded).
    ///
    /// Fails with [`crate::BackupError::TransportUnavailable`] when the
    /// device cannot be reached.
    async fn list(&self, root: &str) -> Result<Vec<RemoteEntry>>;
}

/// Progress and completion signals emitted while a batch is pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    /// Bytes received so far for one file
    Progress { path: String, bytes_transferred: u64 },

    /// File fully written to its local path
    Done { path: String },

    /// File could not be transferred; the rest of the batch continues
    Failed { path: String, reason: String },

    /// The device went away; nothing else in the batch will complete
    Disconnected { reason: String },
}

/// Fetches batches of remote files.
pub trait BatchPull: Send + Sync {
    /// Start pulling every item of `task` into its local path.
    ///
    /// The work runs in the background and reports through the returned
    /// channel, which closes once the transport invocation has ended.
    /// Cancelling `cancel` must stop the underlying transfer promptly.
    fn pull(&self, task: BatchTask, cancel: CancellationToken) -> mpsc::Receiver<PullEvent>;
}
