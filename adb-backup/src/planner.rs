//! Diffing of the remote listing against the manifest.
//!
//! Change detection uses kind + size + mtime, the same heuristic rsync
//! uses by default. File contents are never compared.

use crate::exclude::PathFilter;
use crate::manifest::Manifest;
use crate::remote::RemoteEntry;
use std::collections::BTreeMap;

/// What this run has to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    /// New, changed, retyped or previously unfinished files
    pub to_fetch: Vec<RemoteEntry>,

    /// Backed-up paths that are gone remotely or now excluded
    pub to_delete: Vec<String>,

    /// Backed-up paths whose metadata is unchanged
    pub unchanged: Vec<String>,

    /// Unfinished manifest paths that are gone remotely or now excluded
    pub abandoned: Vec<String>,

    /// Remote directories to create locally
    pub directories: Vec<String>,
}

impl TransferPlan {
    pub fn fetch_bytes(&self) -> u64 {
        self.to_fetch.iter().map(|e| e.size).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.to_fetch.is_empty() && self.to_delete.is_empty() && self.abandoned.is_empty()
    }
}

/// Build the transfer plan for `remote` against `manifest`.
///
/// All output lists are sorted by path. If the listing reports the same
/// path twice, the last occurrence wins.
pub fn plan(remote: &[RemoteEntry], manifest: &Manifest, filter: &dyn PathFilter) -> TransferPlan {
    let mut current: BTreeMap<&str, &RemoteEntry> = BTreeMap::new();
    for entry in remote {
        if filter.is_excluded(&entry.path) {
            continue;
        }
        current.insert(entry.path.as_str(), entry);
    }

    let mut plan = TransferPlan::default();

    for (path, entry) in &current {
        if entry.is_directory() {
            plan.directories.push(path.to_string());
            continue;
        }

        match manifest.get(path) {
            Some(known) if known.complete && known.matches(entry) => {
                plan.unchanged.push(path.to_string());
            }
            // Unfinished, retyped, resized or touched
            Some(_) | None => plan.to_fetch.push((*entry).clone()),
        }
    }

    for (path, known) in &manifest.files {
        let still_a_file = current
            .get(path.as_str())
            .is_some_and(|entry| !entry.is_directory());
        if still_a_file {
            continue;
        }

        if known.complete {
            plan.to_delete.push(path.clone());
        } else {
            plan.abandoned.push(path.clone());
        }
    }

    tracing::debug!(
        "Plan: {} to fetch, {} unchanged, {} to delete, {} abandoned, {} directories",
        plan.to_fetch.len(),
        plan.unchanged.len(),
        plan.to_delete.len(),
        plan.abandoned.len(),
        plan.directories.len()
    );

    plan
}
