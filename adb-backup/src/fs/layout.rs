//! Mapping of remote paths onto the local backup tree.
//!
//! Android allows names that some host filesystems reject (`:` or `?` on
//! Windows and exFAT drives, trailing dots, reserved device names). Such
//! names are rewritten, and every rewrite is recorded in a rename index
//! next to the manifest so the original name can always be recovered.

use super::atomic::write_atomic;
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding the manifest, rename index and lock
pub const META_DIR: &str = ".adb-backup";

const RENAME_INDEX_FILE: &str = "rename_index.txt";
const RENAME_SEPARATOR: &str = " --> ";

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make one path component safe on common host filesystems.
pub fn sanitize_component(component: &str) -> String {
    let mut out: String = component
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed_len = out.trim_end_matches(['.', ' ']).len();
    out.truncate(trimmed_len);

    if out.is_empty() {
        return "_".to_string();
    }

    let stem = out.split('.').next().unwrap_or_default();
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        out.insert(0, '_');
    }

    out
}

/// Sanitize every component of a relative remote path.
pub fn sanitize_relative(remote: &str) -> String {
    remote
        .split('/')
        .filter(|c| !c.is_empty())
        .map(|c| if c == "." || c == ".." { "_".to_string() } else { sanitize_component(c) })
        .collect::<Vec<_>>()
        .join("/")
}

/// Layout of a backup destination on the host.
#[derive(Debug, Clone)]
pub struct LocalLayout {
    root: PathBuf,
}

impl LocalLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    /// Absolute path of a relative local name.
    pub fn path_of(&self, local: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(local.split('/').filter(|c| !c.is_empty()));
        path
    }

    /// Create the local directory for a remote directory.
    pub fn ensure_dir(&self, remote: &str) -> std::io::Result<PathBuf> {
        let path = self.path_of(&sanitize_relative(remote));
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Remove a symlink left where a regular file is about to be written,
    /// so the write cannot land on the link's target.
    pub fn clear_link(&self, local: &str) -> std::io::Result<bool> {
        let path = self.path_of(local);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(&path)?;
                debug!("Removed stale symlink {}", path.display());
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the file stored under the local name `local`, then prune
    /// parent directories left empty, stopping at the backup root.
    ///
    /// Returns `false` when there was nothing to remove.
    pub fn remove_file(&self, local: &str) -> std::io::Result<bool> {
        let path = self.path_of(local);

        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                warn!("Not deleting {}: it is a directory", path.display());
                return Ok(false);
            }
            Ok(_) => std::fs::remove_file(&path)?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }

        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the pruning
            if std::fs::remove_dir(current).is_err() {
                break;
            }
            debug!("Pruned empty directory {}", current.display());
            dir = current.parent();
        }

        Ok(true)
    }
}

/// Record of remote names that were stored under a different local name.
#[derive(Debug, Clone, Default)]
pub struct RenameIndex {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl RenameIndex {
    /// Load the index from the metadata directory.
    ///
    /// Unparseable lines are skipped; the index is informational and is
    /// rebuilt from the paths touched by each run.
    pub fn load(meta_dir: &Path) -> Result<Self> {
        let path = meta_dir.join(RENAME_INDEX_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut entries = BTreeMap::new();
        for line in text.lines() {
            match line.split_once(RENAME_SEPARATOR) {
                Some((remote, local)) => {
                    entries.insert(remote.to_string(), local.to_string());
                }
                None if line.trim().is_empty() => {}
                None => warn!("Ignoring malformed rename index line: {}", line),
            }
        }

        Ok(Self { path, entries, dirty: false })
    }

    /// Local name of `remote`: the recorded one, or its sanitized form.
    pub fn local_name(&self, remote: &str) -> String {
        match self.entries.get(remote) {
            Some(local) => local.clone(),
            None => sanitize_relative(remote),
        }
    }

    /// Remember that `remote` is stored as `local`.
    pub fn record(&mut self, remote: &str, local: &str) {
        if local == remote {
            self.forget(remote);
            return;
        }
        if self.entries.get(remote).map(String::as_str) != Some(local) {
            self.entries.insert(remote.to_string(), local.to_string());
            self.dirty = true;
        }
    }

    pub fn forget(&mut self, remote: &str) {
        if self.entries.remove(remote).is_some() {
            self.dirty = true;
        }
    }

    pub fn get(&self, remote: &str) -> Option<&str> {
        self.entries.get(remote).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the index if it changed since it was loaded.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let mut text = String::new();
        for (remote, local) in &self.entries {
            text.push_str(remote);
            text.push_str(RENAME_SEPARATOR);
            text.push_str(local);
            text.push('\n');
        }

        write_atomic(&self.path, text.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

/// Which remote path owns each local name.
///
/// Sanitizing is not injective (`x:y` and `x?y` both become `x_y`), so a
/// name already owned by another path is made unique with a `~N` suffix.
#[derive(Debug, Clone, Default)]
pub struct LocalNames {
    owners: HashMap<String, String>,
}

impl LocalNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an existing mapping. Returns `false` if the name was already
    /// owned by another path.
    pub fn insert(&mut self, remote: &str, local: String) -> bool {
        match self.owners.get(&local) {
            Some(owner) if owner != remote => false,
            _ => {
                self.owners.insert(local, remote.to_string());
                true
            }
        }
    }

    /// Claim `preferred` for `remote`, or the first free `~N` variant of it.
    pub fn claim(&mut self, remote: &str, preferred: &str) -> String {
        let mut candidate = preferred.to_string();
        let mut n = 1u32;
        while !self.insert(remote, candidate.clone()) {
            candidate = with_suffix(preferred, n);
            n += 1;
        }
        candidate
    }

    pub fn owner(&self, local: &str) -> Option<&str> {
        self.owners.get(local).map(String::as_str)
    }
}

/// `dir/name.ext` -> `dir/name~N.ext`
fn with_suffix(local: &str, n: u32) -> String {
    let (dir, name) = match local.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, local),
    };
    let name = match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}~{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}~{}", name, n),
    };
    match dir {
        Some(dir) => format!("{}/{}", dir, name),
        None => name,
    }
}
