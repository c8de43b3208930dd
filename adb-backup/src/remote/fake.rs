//! In-memory device for tests.
//!
//! Serves a fixed listing and answers batch pulls according to per-path
//! behaviours, recording every batch it was asked to pull.

use super::{BatchPull, EntryKind, PullEvent, RemoteEntry, RemoteLister};
use crate::transfer::BatchTask;
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How the fake answers a pull for one path. Paths without a behaviour
/// succeed.
#[derive(Debug, Clone)]
pub(crate) enum FakeBehavior {
    Fail(String),
    /// Never mention the file, then end the batch normally
    Silent,
    /// Go quiet until cancelled
    Hang,
    /// Hang on the first pull only
    HangOnce,
    /// Report the device as gone
    Disconnect,
}

#[derive(Debug, Clone)]
enum Action {
    Succeed,
    Fail(String),
    Silent,
    Hang,
    Disconnect,
}

#[derive(Debug, Default)]
struct FakeDeviceInner {
    entries: Vec<RemoteEntry>,
    list_error: Option<String>,
    behaviors: HashMap<String, FakeBehavior>,
    hung_once: HashSet<String>,
    pulled: Vec<Vec<String>>,
    write_files: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDevice {
    inner: Arc<Mutex<FakeDeviceInner>>,
}

impl FakeDevice {
    pub(crate) fn new(entries: Vec<RemoteEntry>) -> Self {
        let device = Self::default();
        device.set_entries(entries);
        device
    }

    /// Also write pulled files to their local paths.
    pub(crate) fn writing_files(self) -> Self {
        self.inner.lock().unwrap().write_files = true;
        self
    }

    pub(crate) fn set_entries(&self, entries: Vec<RemoteEntry>) {
        self.inner.lock().unwrap().entries = entries;
    }

    pub(crate) fn set_behavior(&self, path: &str, behavior: FakeBehavior) {
        self.inner.lock().unwrap().behaviors.insert(path.to_string(), behavior);
    }

    pub(crate) fn clear_behaviors(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.behaviors.clear();
        inner.hung_once.clear();
    }

    pub(crate) fn fail_listing(&self, error: &str) {
        self.inner.lock().unwrap().list_error = Some(error.to_string());
    }

    pub(crate) fn pulled_batches(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().pulled.clone()
    }

    pub(crate) fn pulled_paths(&self) -> Vec<String> {
        self.pulled_batches().into_iter().flatten().collect()
    }

    pub(crate) fn reset_pulls(&self) {
        self.inner.lock().unwrap().pulled.clear();
    }
}

#[async_trait]
impl RemoteLister for FakeDevice {
    async fn list(&self, _root: &str) -> Result<Vec<RemoteEntry>> {
        let inner = self.inner.lock().unwrap();
        match &inner.list_error {
            Some(error) => Err(BackupError::TransportUnavailable(error.clone())),
            None => Ok(inner.entries.clone()),
        }
    }
}

impl BatchPull for FakeDevice {
    fn pull(&self, task: BatchTask, cancel: CancellationToken) -> mpsc::Receiver<PullEvent> {
        let (tx, rx) = mpsc::channel(64);

        let (plan, write_files) = {
            let mut inner = self.inner.lock().unwrap();
            inner.pulled.push(task.paths().map(str::to_string).collect());

            let mut plan = Vec::with_capacity(task.items.len());
            for item in task.items {
                let action = match inner.behaviors.get(&item.entry.path).cloned() {
                    None => Action::Succeed,
                    Some(FakeBehavior::Fail(reason)) => Action::Fail(reason),
                    Some(FakeBehavior::Silent) => Action::Silent,
                    Some(FakeBehavior::Hang) => Action::Hang,
                    Some(FakeBehavior::Disconnect) => Action::Disconnect,
                    Some(FakeBehavior::HangOnce) => {
                        if inner.hung_once.insert(item.entry.path.clone()) {
                            Action::Hang
                        } else {
                            Action::Succeed
                        }
                    }
                };
                plan.push((item, action));
            }
            (plan, inner.write_files)
        };

        tokio::spawn(async move {
            for (item, action) in plan {
                if cancel.is_cancelled() {
                    return;
                }
                let path = item.entry.path.clone();
                match action {
                    Action::Succeed => {
                        if write_files {
                            write_local(&item.entry, &item.local_path);
                        }
                        let _ = tx
                            .send(PullEvent::Progress { path: path.clone(), bytes_transferred: item.entry.size / 2 })
                            .await;
                        let _ = tx.send(PullEvent::Done { path }).await;
                    }
                    Action::Fail(reason) => {
                        let _ = tx.send(PullEvent::Failed { path, reason }).await;
                    }
                    Action::Silent => {}
                    Action::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                    Action::Disconnect => {
                        let _ = tx.send(PullEvent::Disconnected { reason: "device offline".to_string() }).await;
                        return;
                    }
                }
            }
        });

        rx
    }
}

/// Mimic what `adb pull -a` leaves on disk: plain writes for files, which
/// follow an existing link, and a fresh link for symlinks.
fn write_local(entry: &RemoteEntry, local: &Path) {
    if let Some(parent) = local.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if entry.kind == EntryKind::Symlink {
        relink(entry.link_target.as_deref().unwrap_or_default(), local);
        return;
    }
    let _ = std::fs::write(local, vec![b'x'; entry.size as usize]);
}

#[cfg(unix)]
fn relink(target: &str, local: &Path) {
    if matches!(std::fs::symlink_metadata(local), Ok(meta) if !meta.is_dir()) {
        let _ = std::fs::remove_file(local);
    }
    let _ = std::os::unix::fs::symlink(target, local);
}

#[cfg(not(unix))]
fn relink(_target: &str, _local: &Path) {}
