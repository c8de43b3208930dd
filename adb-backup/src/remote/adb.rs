//! Device access through the `adb` command-line tool.
//!
//! Listing runs `find` on the device through `adb exec-out`. Pulling runs
//! one `adb pull -a` per local target directory, following its
//! `[ nn%] /remote/path` progress lines on stdout to learn which file is
//! being written. adb reports no per-file completion, so a file is taken
//! as done once progress moves on to the next one, or once the whole
//! invocation succeeds.

use super::listing::{parse_listing, FIND_PRINTF};
use super::{BatchPull, EntryKind, PullEvent, RemoteEntry, RemoteLister};
use crate::transfer::{BatchTask, TransferItem};
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// stderr fragments meaning the device is gone rather than one file failing.
/// Matched against lines with quoted text blanked out, so a file name can
/// never trigger them.
const DEVICE_LOST_MARKERS: &[&str] = &[
    "no devices",
    "device offline",
    "device unauthorized",
    "device '' not found",
    "protocol fault",
    "connection reset",
];

#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb: PathBuf,
    serial: Option<String>,
    remote_root: String,
    connect_timeout: Duration,
}

impl AdbBridge {
    pub fn new(
        adb: impl Into<PathBuf>,
        serial: Option<String>,
        remote_root: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            adb: adb.into(),
            serial,
            remote_root: remote_root.into(),
            connect_timeout,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn remote_path(&self, relative: &str) -> String {
        format!("{}/{}", self.remote_root.trim_end_matches('/'), relative)
    }

    /// Block until the device is attached, bounded by the connect timeout.
    pub async fn wait_for_device(&self) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("wait-for-device").stdout(Stdio::null()).stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.connect_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BackupError::TransportUnavailable(format!(
                    "cannot run {}: {}",
                    self.adb.display(),
                    e
                )));
            }
            Err(_) => {
                return Err(BackupError::TransportUnavailable(format!(
                    "no device after {}s",
                    self.connect_timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::TransportUnavailable(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn run_pull(&self, task: BatchTask, cancel: CancellationToken, tx: mpsc::Sender<PullEvent>) {
        let mut files: Vec<TransferItem> = Vec::with_capacity(task.items.len());

        for item in task.items {
            if item.entry.kind != EntryKind::Symlink {
                files.push(item);
                continue;
            }
            let event = match link_locally(&item.entry, &item.local_path) {
                Ok(()) => PullEvent::Done { path: item.entry.path },
                Err(e) => PullEvent::Failed {
                    path: item.entry.path,
                    reason: format!("cannot create symlink: {}", e),
                },
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }

        for (target, items) in group_by_target(files) {
            if cancel.is_cancelled() {
                return;
            }

            if let Some(dir) = pull_dir(&target) {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    for item in items {
                        let event = PullEvent::Failed {
                            path: item.entry.path,
                            reason: format!("cannot create {}: {}", dir.display(), e),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
            }

            if let GroupEnd::Stop = self.pull_group(&target, items, &cancel, &tx).await {
                return;
            }
        }
    }

    async fn pull_group(
        &self,
        target: &PullTarget,
        items: Vec<TransferItem>,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<PullEvent>,
    ) -> GroupEnd {
        let mut cmd = self.command();
        cmd.arg("pull").arg("-a");
        for item in &items {
            cmd.arg(self.remote_path(&item.entry.path));
        }
        cmd.arg(target.path()).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("adb pull: {} files into {}", items.len(), target.path().display());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("cannot run {}: {}", self.adb.display(), e);
                let _ = tx.send(PullEvent::Disconnected { reason }).await;
                return GroupEnd::Stop;
            }
        };

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let mut tracker = GroupProgress::new(
            items
                .iter()
                .map(|item| (self.remote_path(&item.entry.path), item.entry.path.clone(), item.entry.size)),
        );

        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = [0u8; 8192];
            let mut line = Vec::new();
            loop {
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return GroupEnd::Stop;
                    }
                    read = stdout.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };

                for &byte in &buf[..n] {
                    if byte != b'\r' && byte != b'\n' {
                        line.push(byte);
                        continue;
                    }
                    if line.is_empty() {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    line.clear();
                    for event in tracker.observe(&text) {
                        if tx.send(event).await.is_err() {
                            let _ = child.start_kill();
                            return GroupEnd::Stop;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return GroupEnd::Stop;
            }
            status = child.wait() => status,
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();

        let succeeded = status.as_ref().is_ok_and(|s| s.success());
        if succeeded {
            for path in tracker.unreported() {
                if tx.send(PullEvent::Done { path }).await.is_err() {
                    return GroupEnd::Stop;
                }
            }
            return GroupEnd::Continue;
        }

        let device_lost = is_device_lost(&stderr);
        let reason = match (&status, stderr.lines().last()) {
            (_, Some(last)) => last.to_string(),
            (Ok(status), None) => format!("adb pull exited with {}", status),
            (Err(e), None) => format!("adb pull failed: {}", e),
        };
        warn!("adb pull into {} failed: {}", target.path().display(), reason);

        // Files may have landed before the failure; trust them only if
        // their size is right.
        let expected: HashMap<&str, (&Path, u64)> = items
            .iter()
            .map(|item| (item.entry.path.as_str(), (item.local_path.as_path(), item.entry.size)))
            .collect();
        for path in tracker.unreported() {
            let verified = expected
                .get(path.as_str())
                .is_some_and(|(local, size)| local_size(local) == Some(*size));

            let event = if verified {
                PullEvent::Done { path }
            } else if device_lost {
                continue;
            } else {
                PullEvent::Failed { path, reason: reason.clone() }
            };
            if tx.send(event).await.is_err() {
                return GroupEnd::Stop;
            }
        }

        if device_lost {
            let _ = tx.send(PullEvent::Disconnected { reason }).await;
            return GroupEnd::Stop;
        }
        GroupEnd::Continue
    }
}

#[async_trait]
impl RemoteLister for AdbBridge {
    async fn list(&self, root: &str) -> Result<Vec<RemoteEntry>> {
        self.wait_for_device().await?;
        info!("Listing {} on device", root);

        let script = format!("find -H {} -mindepth 1 -printf '{}'", shell_quote(root), FIND_PRINTF);
        let output = self
            .command()
            .arg("exec-out")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::TransportUnavailable(format!("cannot run {}: {}", self.adb.display(), e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_device_lost(&stderr) {
            return Err(BackupError::TransportUnavailable(stderr.trim().to_string()));
        }
        if !output.status.success() {
            // find exits non-zero on unreadable subdirectories but still
            // lists everything it could read
            if output.stdout.is_empty() {
                return Err(BackupError::TransportUnavailable(format!(
                    "listing {} failed: {}",
                    root,
                    stderr.trim()
                )));
            }
            warn!("Listing finished with errors: {}", stderr.trim());
        }

        let entries = parse_listing(&output.stdout, root)?;
        info!("Device reported {} objects", entries.len());
        Ok(entries)
    }
}

impl BatchPull for AdbBridge {
    fn pull(&self, task: BatchTask, cancel: CancellationToken) -> mpsc::Receiver<PullEvent> {
        let (tx, rx) = mpsc::channel(256);
        let bridge = self.clone();
        tokio::spawn(async move {
            bridge.run_pull(task, cancel, tx).await;
        });
        rx
    }
}

enum GroupEnd {
    Continue,
    Stop,
}

/// Destination argument of one `adb pull` invocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum PullTarget {
    /// Files keep their remote names inside this directory
    Directory(PathBuf),
    /// A single file stored under a sanitized name
    File(PathBuf),
}

impl PullTarget {
    fn path(&self) -> &Path {
        match self {
            PullTarget::Directory(path) | PullTarget::File(path) => path,
        }
    }
}

fn pull_dir(target: &PullTarget) -> Option<&Path> {
    match target {
        PullTarget::Directory(dir) => Some(dir),
        PullTarget::File(file) => file.parent(),
    }
}

fn group_by_target(items: Vec<TransferItem>) -> BTreeMap<PullTarget, Vec<TransferItem>> {
    let mut groups: BTreeMap<PullTarget, Vec<TransferItem>> = BTreeMap::new();
    for item in items {
        let remote_name = item.entry.path.rsplit('/').next().unwrap_or_default();
        let local_name = item.local_path.file_name().and_then(|n| n.to_str());
        let target = match item.local_path.parent() {
            Some(parent) if local_name == Some(remote_name) => PullTarget::Directory(parent.to_path_buf()),
            _ => PullTarget::File(item.local_path.clone()),
        };
        groups.entry(target).or_default().push(item);
    }
    groups
}

/// Follows the progress output of one invocation.
#[derive(Debug)]
struct GroupProgress {
    /// remote absolute path -> (relative path, size)
    files: HashMap<String, (String, u64)>,
    order: Vec<String>,
    current: Option<String>,
    reported: HashSet<String>,
}

impl GroupProgress {
    fn new(files: impl Iterator<Item = (String, String, u64)>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for (remote, relative, size) in files {
            order.push(relative.clone());
            map.insert(remote, (relative, size));
        }
        Self { files: map, order, current: None, reported: HashSet::new() }
    }

    fn observe(&mut self, line: &str) -> Vec<PullEvent> {
        let Some((percent, remote)) = parse_progress_line(line) else {
            return Vec::new();
        };
        let Some((relative, size)) = self.files.get(remote) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(previous) = self.current.take() {
            if previous != *relative && self.reported.insert(previous.clone()) {
                events.push(PullEvent::Done { path: previous });
            }
        }
        self.current = Some(relative.clone());

        if !self.reported.contains(relative) {
            events.push(PullEvent::Progress {
                path: relative.clone(),
                bytes_transferred: size.saturating_mul(u64::from(percent)) / 100,
            });
        }
        events
    }

    /// Files without a terminal event yet, in invocation order.
    fn unreported(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        for path in &self.order {
            if self.reported.insert(path.clone()) {
                out.push(path.clone());
            }
        }
        out
    }
}

/// Parse `[ 42%] /sdcard/path` into the percentage and the remote path.
fn parse_progress_line(line: &str) -> Option<(u8, &str)> {
    let rest = line.strip_prefix('[')?;
    let (percent, path) = rest.split_once("%]")?;
    let percent: u8 = percent.trim().parse().ok()?;
    let path = path.strip_prefix(' ').unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    Some((percent.min(100), path))
}

fn is_device_lost(stderr: &str) -> bool {
    stderr.lines().any(|line| {
        let line = blank_quoted(&line.to_ascii_lowercase());
        DEVICE_LOST_MARKERS.iter().any(|marker| line.contains(marker))
    })
}

/// `device 'R58M' not found` -> `device '' not found`
fn blank_quoted(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut quoted = false;
    for c in line.chars() {
        if c == '\'' {
            quoted = !quoted;
            out.push(c);
        } else if !quoted {
            out.push(c);
        }
    }
    out
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn local_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

#[cfg(unix)]
fn link_locally(entry: &RemoteEntry, local: &Path) -> std::io::Result<()> {
    let target = entry.link_target.as_deref().unwrap_or_default();
    if let Some(parent) = local.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::symlink_metadata(local) {
        Ok(meta) if !meta.is_dir() => std::fs::remove_file(local)?,
        _ => {}
    }
    std::os::unix::fs::symlink(target, local)
}

#[cfg(not(unix))]
fn link_locally(_entry: &RemoteEntry, _local: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}
