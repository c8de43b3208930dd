//! Grouping of planned files into transport invocations.
//!
//! Every `adb` invocation pays a fixed round-trip cost, which dominates
//! when a device holds tens of thousands of small files. Small files are
//! therefore packed together, while large files get a task of their own so
//! a failure or retry never drags unrelated files along.

use crate::remote::{EntryKind, RemoteEntry};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Size limits used when packing files into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Files strictly below this size are packed together
    pub small_file_threshold: u64,

    /// Maximum cumulative bytes of one packed task
    pub max_batch_bytes: u64,

    /// Maximum number of files in one packed task
    pub max_batch_files: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            small_file_threshold: 256 * 1024,
            max_batch_bytes: 2 * 1024 * 1024,
            max_batch_files: 200,
        }
    }
}

/// A remote file paired with the local path it is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub entry: RemoteEntry,
    pub local_path: PathBuf,
}

impl TransferItem {
    pub fn new(entry: RemoteEntry, local_path: PathBuf) -> Self {
        Self { entry, local_path }
    }

    fn is_small(&self, limits: &BatchLimits) -> bool {
        self.entry.kind == EntryKind::Symlink || self.entry.size < limits.small_file_threshold
    }
}

/// Files handed to a single batch-pull invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTask {
    pub id: usize,
    pub items: Vec<TransferItem>,
}

impl BatchTask {
    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|item| item.entry.size).sum()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.entry.path.as_str())
    }
}

/// Split `items` into tasks.
///
/// Items are ordered by path first so consecutive small files tend to
/// share a directory. A packed task is closed as soon as adding the next
/// file would exceed either cap.
pub fn partition(mut items: Vec<TransferItem>, limits: &BatchLimits) -> Vec<BatchTask> {
    items.sort_by(|a, b| a.entry.path.cmp(&b.entry.path));

    let max_files = limits.max_batch_files.max(1);
    let mut tasks: Vec<BatchTask> = Vec::new();
    let mut open: Vec<TransferItem> = Vec::new();
    let mut open_bytes = 0u64;

    for item in items {
        if !item.is_small(limits) {
            close(&mut tasks, &mut open, &mut open_bytes);
            tasks.push(BatchTask { id: tasks.len(), items: vec![item] });
            continue;
        }

        let size = item.entry.size;
        if open.len() >= max_files || (!open.is_empty() && open_bytes + size > limits.max_batch_bytes) {
            close(&mut tasks, &mut open, &mut open_bytes);
        }

        open_bytes += size;
        open.push(item);
    }
    close(&mut tasks, &mut open, &mut open_bytes);

    tasks
}

fn close(tasks: &mut Vec<BatchTask>, open: &mut Vec<TransferItem>, open_bytes: &mut u64) {
    if !open.is_empty() {
        tasks.push(BatchTask { id: tasks.len(), items: std::mem::take(open) });
        *open_bytes = 0;
    }
}
