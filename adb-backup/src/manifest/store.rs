//! Durable storage of the manifest.
//!
//! Every write goes through [`write_atomic`], so a crash at any point
//! leaves either the previous record or the new one, never a torn file.

use super::{Manifest, ManifestState, MANIFEST_VERSION};
use crate::fs::atomic::write_atomic;
use crate::{BackupError, Result};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the manifest inside the metadata directory
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store located in the metadata directory of a backup destination
    pub fn in_dir(meta_dir: &Path) -> Self {
        Self::new(meta_dir.join(MANIFEST_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest of the previous run.
    ///
    /// A missing record yields an empty manifest: a first run is not an
    /// error. A record that exists but cannot be parsed is reported as
    /// [`BackupError::ManifestCorrupt`].
    pub fn load(&self) -> Result<Manifest> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No manifest at {}, starting a full backup", self.path.display());
                return Ok(Manifest::new());
            }
            Err(e) => return Err(self.corrupt(e.to_string())),
        };

        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;

        if manifest.version > MANIFEST_VERSION {
            return Err(self.corrupt(format!(
                "unsupported manifest version {} (newest known is {})",
                manifest.version, MANIFEST_VERSION
            )));
        }

        let pending = manifest.pending_paths().count();
        match manifest.state {
            ManifestState::Complete => info!(
                "Loaded manifest: {} files from a completed run",
                manifest.len()
            ),
            ManifestState::Partial => info!(
                "Loaded manifest from an unfinished run: {} files, {} not yet confirmed",
                manifest.len(),
                pending
            ),
        }

        Ok(manifest)
    }

    /// Commit the manifest at the end of a run.
    ///
    /// The record is only marked complete when every entry is; files that
    /// failed this run keep the record partial so they are retried.
    pub fn persist(&self, manifest: &mut Manifest) -> Result<()> {
        let state = if manifest.is_fully_complete() {
            ManifestState::Complete
        } else {
            ManifestState::Partial
        };
        self.write(manifest, state)?;
        info!(
            "Committed manifest: {} files ({:?})",
            manifest.len(),
            manifest.state
        );
        Ok(())
    }

    /// Checkpoint the manifest while a run is in progress.
    pub fn persist_incremental(&self, manifest: &mut Manifest) -> Result<()> {
        self.write(manifest, ManifestState::Partial)?;
        debug!("Checkpointed manifest: {} files", manifest.len());
        Ok(())
    }

    /// Delete the record, forcing the next load to start empty.
    pub fn discard(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Discarded manifest {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, manifest: &mut Manifest, state: ManifestState) -> Result<()> {
        manifest.version = MANIFEST_VERSION;
        manifest.state = state;
        manifest.updated_at = Some(Utc::now());

        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }

    fn corrupt(&self, reason: String) -> BackupError {
        BackupError::ManifestCorrupt {
            path: self.path.clone(),
            reason,
        }
    }
}
