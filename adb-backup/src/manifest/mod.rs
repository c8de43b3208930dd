//! Manifest types for incremental backup support.
//!
//! A manifest records every file of the backup with its kind, size and
//! mtime, plus whether its transfer was confirmed complete. Diffing the
//! next listing against it yields the files that must be fetched again.

pub mod store;

pub use store::ManifestStore;

use crate::remote::{EntryKind, RemoteEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANIFEST_VERSION: u32 = 1;

/// Whether the persisted manifest describes a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestState {
    /// Checkpoint of a run in progress, or of one that ended early
    #[default]
    Partial,
    /// Every entry was confirmed complete
    Complete,
}

/// Backup manifest, serialized as `.adb-backup/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,

    #[serde(default)]
    pub state: ManifestState,

    /// Serial of the device the files came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_root: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    pub files: BTreeMap<String, ManifestEntry>,
}

/// Metadata for a single file in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_ns: i64,
    pub complete: bool,
}

impl ManifestEntry {
    pub fn from_remote(entry: &RemoteEntry, complete: bool) -> Self {
        Self {
            kind: entry.kind,
            size: entry.size,
            mtime_ns: entry.mtime_ns,
            complete,
        }
    }

    /// Same kind, size and mtime as `entry`
    pub fn matches(&self, entry: &RemoteEntry) -> bool {
        self.kind == entry.kind && self.size == entry.size && self.mtime_ns == entry.mtime_ns
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            state: ManifestState::Partial,
            device: None,
            remote_root: None,
            updated_at: None,
            files: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.get(path)
    }

    /// Record `entry` as about to be (re)fetched.
    ///
    /// Whatever was known about the path before is replaced: once a
    /// transfer starts writing over the local copy, it no longer reflects
    /// a confirmed backup.
    pub fn mark_pending(&mut self, entry: &RemoteEntry) {
        self.files
            .insert(entry.path.clone(), ManifestEntry::from_remote(entry, false));
    }

    /// Record `entry` as durably transferred.
    pub fn mark_complete(&mut self, entry: &RemoteEntry) {
        self.files
            .insert(entry.path.clone(), ManifestEntry::from_remote(entry, true));
    }

    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.files.remove(path)
    }

    /// Paths whose transfer has not been confirmed
    pub fn pending_paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|(_, entry)| !entry.complete)
            .map(|(path, _)| path.as_str())
    }

    pub fn is_fully_complete(&self) -> bool {
        self.files.values().all(|entry| entry.complete)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files
            .values()
            .filter(|entry| entry.complete)
            .map(|entry| entry.size)
            .sum()
    }
}
