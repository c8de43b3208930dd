//! Sequential execution of batch tasks against one device.
//!
//! Tasks run one at a time: `adb` gives no guarantee that concurrent sync
//! sessions against the same device are safe. Within a task the bridge
//! drives the subprocess in its own tokio task while this module consumes
//! its event channel, bounding each wait by the stall timeout.
//!
//! `adb` is known to go quiet for long stretches while still working, and
//! to occasionally hang for real. A quiet period is therefore reported to
//! the [`TransferObserver`] as a stall and the observer decides what to do
//! with it; the coordinator never retries on its own.

use super::{BatchTask, FileOutcome, TransferItem};
use crate::remote::{BatchPull, PullEvent};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A period without any event from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallNotice {
    pub task_id: usize,

    /// Retry attempt of the task, starting at 0
    pub attempt: u32,

    /// Consecutive stall timeouts observed in this attempt
    pub consecutive: u32,

    /// Time since the last event
    pub idle: Duration,

    /// Files of the task that have not reported yet
    pub pending_files: usize,
}

/// What to do about a stalled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDecision {
    /// The transfer may still be progressing; wait another period
    KeepWaiting,

    /// Cancel the invocation and re-issue it for the files not yet reported
    Retry,

    /// Give up on the remaining files of this task
    FailTask,

    /// Stop the run; unfinished files stay pending for the next one
    Abort,
}

/// Default stall handling: wait, then retry, then fail the remaining files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallPolicy {
    /// Extra stall periods to wait out before retrying
    pub wait_periods: u32,

    /// Retries per task before its remaining files are failed
    pub max_retries: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self { wait_periods: 1, max_retries: 1 }
    }
}

impl StallPolicy {
    pub fn decide(&self, notice: &StallNotice) -> StallDecision {
        if notice.consecutive <= self.wait_periods {
            StallDecision::KeepWaiting
        } else if notice.attempt < self.max_retries {
            StallDecision::Retry
        } else {
            StallDecision::FailTask
        }
    }
}

/// Receives everything the coordinator observes.
pub trait TransferObserver {
    fn on_task_started(&mut self, _task: &BatchTask, _attempt: u32) {}

    fn on_progress(&mut self, _path: &str, _bytes_transferred: u64) {}

    /// A file reached its final status for this run.
    ///
    /// An error stops the transfer; the current task is cancelled.
    fn on_outcome(&mut self, outcome: FileOutcome) -> Result<()>;

    fn on_stall(&mut self, notice: &StallNotice) -> StallDecision;
}

/// How the transfer phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEnd {
    /// Every task ran; individual files may still have failed
    Completed,

    /// Cancelled, aborted or disconnected before all tasks ran
    Interrupted { reason: String },
}

enum TaskEnd {
    Finished,
    Interrupted(String),
}

enum AttemptEnd {
    Finished,
    Retry,
    GaveUp(Duration),
}

pub struct BatchCoordinator<'a> {
    bridge: &'a dyn BatchPull,
    stall_timeout: Duration,
    cancel: CancellationToken,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(bridge: &'a dyn BatchPull, stall_timeout: Duration, cancel: CancellationToken) -> Self {
        Self { bridge, stall_timeout, cancel }
    }

    /// Run `tasks` in order, reporting every file exactly once.
    ///
    /// Files that were not attempted because the run stopped early are
    /// reported as skipped.
    pub async fn run<O: TransferObserver>(
        &self,
        tasks: Vec<BatchTask>,
        observer: &mut O,
    ) -> Result<TransferEnd> {
        let task_count = tasks.len();
        let mut tasks = tasks.into_iter();

        while let Some(task) = tasks.next() {
            if self.cancel.is_cancelled() {
                skip_all(std::iter::once(task).chain(tasks), observer)?;
                return Ok(TransferEnd::Interrupted { reason: "cancelled".to_string() });
            }

            debug!(
                "Starting task {}/{}: {} files, {} bytes",
                task.id + 1,
                task_count,
                task.len(),
                task.total_bytes()
            );

            if let TaskEnd::Interrupted(reason) = self.run_task(task, observer).await? {
                skip_all(tasks, observer)?;
                return Ok(TransferEnd::Interrupted { reason });
            }
        }

        Ok(TransferEnd::Completed)
    }

    async fn run_task<O: TransferObserver>(&self, task: BatchTask, observer: &mut O) -> Result<TaskEnd> {
        let task_id = task.id;
        let mut pending: BTreeMap<String, TransferItem> = task
            .items
            .into_iter()
            .map(|item| (item.entry.path.clone(), item))
            .collect();
        let mut attempt = 0u32;

        loop {
            let attempt_task = BatchTask { id: task_id, items: pending.values().cloned().collect() };
            observer.on_task_started(&attempt_task, attempt);

            let token = self.cancel.child_token();
            let result = self
                .run_attempt(attempt_task, attempt, &token, &mut pending, observer)
                .await;
            // Whatever happened, the invocation must not outlive its attempt
            token.cancel();

            let end = match result {
                Ok(Ok(end)) => end,
                Ok(Err(reason)) => {
                    for path in std::mem::take(&mut pending).into_keys() {
                        observer.on_outcome(FileOutcome::skipped(path))?;
                    }
                    return Ok(TaskEnd::Interrupted(reason));
                }
                Err(e) => return Err(e),
            };

            match end {
                AttemptEnd::Finished => {
                    for path in std::mem::take(&mut pending).into_keys() {
                        observer.on_outcome(FileOutcome::failed(
                            path,
                            "transport finished without reporting this file",
                        ))?;
                    }
                    return Ok(TaskEnd::Finished);
                }
                AttemptEnd::Retry => {
                    attempt += 1;
                    if pending.is_empty() {
                        return Ok(TaskEnd::Finished);
                    }
                    info!("Retrying task {} ({} files left, attempt {})", task_id, pending.len(), attempt);
                }
                AttemptEnd::GaveUp(idle) => {
                    let reason = BackupError::Stalled { idle_secs: idle.as_secs() }.to_string();
                    for path in std::mem::take(&mut pending).into_keys() {
                        observer.on_outcome(FileOutcome::failed(path, reason.clone()))?;
                    }
                    return Ok(TaskEnd::Finished);
                }
            }
        }
    }

    /// Drive one invocation of the bridge.
    ///
    /// The inner `Err` carries the reason the run was interrupted.
    async fn run_attempt<O: TransferObserver>(
        &self,
        task: BatchTask,
        attempt: u32,
        token: &CancellationToken,
        pending: &mut BTreeMap<String, TransferItem>,
        observer: &mut O,
    ) -> Result<std::result::Result<AttemptEnd, String>> {
        let task_id = task.id;
        let mut events = self.bridge.pull(task, token.clone());
        let mut last_event = Instant::now();
        let mut consecutive = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = tokio::time::timeout(self.stall_timeout, events.recv()) => Some(next),
            };
            let Some(next) = next else {
                drain(task_id, &mut events, pending, observer)?;
                return Ok(Err("cancelled".to_string()));
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(Ok(AttemptEnd::Finished)),
                Err(_) => {
                    consecutive += 1;
                    let notice = StallNotice {
                        task_id,
                        attempt,
                        consecutive,
                        idle: last_event.elapsed(),
                        pending_files: pending.len(),
                    };
                    warn!(
                        "Task {} stalled: no progress for {}s ({} files pending)",
                        task_id,
                        notice.idle.as_secs(),
                        notice.pending_files
                    );

                    match observer.on_stall(&notice) {
                        StallDecision::KeepWaiting => continue,
                        StallDecision::Retry => return Ok(Ok(AttemptEnd::Retry)),
                        StallDecision::FailTask => return Ok(Ok(AttemptEnd::GaveUp(notice.idle))),
                        StallDecision::Abort => {
                            return Ok(Err(format!("aborted after task {} stalled", task_id)));
                        }
                    }
                }
            };

            last_event = Instant::now();
            consecutive = 0;

            if let Some(reason) = apply_event(task_id, event, pending, observer)? {
                drain(task_id, &mut events, pending, observer)?;
                return Ok(Err(format!("device disconnected: {}", reason)));
            }
        }
    }
}

/// Credit one transport event. Returns the reason if the device is gone.
fn apply_event<O: TransferObserver>(
    task_id: usize,
    event: PullEvent,
    pending: &mut BTreeMap<String, TransferItem>,
    observer: &mut O,
) -> Result<Option<String>> {
    match event {
        PullEvent::Progress { path, bytes_transferred } => {
            if pending.contains_key(&path) {
                observer.on_progress(&path, bytes_transferred);
            }
        }
        PullEvent::Done { path } => {
            if pending.remove(&path).is_some() {
                observer.on_outcome(FileOutcome::ok(path))?;
            }
        }
        PullEvent::Failed { path, reason } => {
            if pending.remove(&path).is_some() {
                let reason = BackupError::FileTransferFailed { path: path.clone(), reason }.to_string();
                observer.on_outcome(FileOutcome::failed(path, reason))?;
            }
        }
        PullEvent::Disconnected { reason } => {
            warn!("Device disconnected during task {}: {}", task_id, reason);
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

/// Credit events the transport had already queued when the attempt
/// stopped, so finished files are not reported as skipped.
fn drain<O: TransferObserver>(
    task_id: usize,
    events: &mut mpsc::Receiver<PullEvent>,
    pending: &mut BTreeMap<String, TransferItem>,
    observer: &mut O,
) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        if let Some(reason) = apply_event(task_id, event, pending, observer)? {
            debug!("Ignoring repeated disconnect for task {}: {}", task_id, reason);
        }
    }
    Ok(())
}

fn skip_all<O: TransferObserver>(
    tasks: impl Iterator<Item = BatchTask>,
    observer: &mut O,
) -> Result<()> {
    for task in tasks {
        for item in task.items {
            observer.on_outcome(FileOutcome::skipped(item.entry.path))?;
        }
    }
    Ok(())
}
