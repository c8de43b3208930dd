//! Backup run controller - Orchestrates one incremental backup.
//!
//! A run moves through `Init → Listing → Planning → Transferring →
//! Finalizing → Done`. Cancellation or device loss during the transfer
//! ends it in `Interrupted`, which is not an error: the manifest is
//! checkpointed and the next run picks up the unfinished files.
//!
//! The manifest on disk never credits a file that is not fully written.
//! Files about to be fetched are marked incomplete and checkpointed before
//! the transport touches them, and only an explicit success event from the
//! transport marks them complete again.

pub mod summary;

pub use summary::RunSummary;

use crate::config::{Config, CorruptPolicy};
use crate::exclude::PathFilter;
use crate::fs::layout::sanitize_relative;
use crate::fs::{DestinationLock, LocalLayout, LocalNames, RenameIndex};
use crate::manifest::{Manifest, ManifestStore};
use crate::planner::{self, TransferPlan};
use crate::remote::{BatchPull, EntryKind, RemoteEntry, RemoteLister};
use crate::transfer::progress::ProgressTracker;
use crate::transfer::{
    partition, BatchCoordinator, BatchLimits, BatchTask, FileOutcome, FileStatus, StallDecision,
    StallNotice, StallPolicy, TransferEnd, TransferItem, TransferObserver,
};
use crate::{BackupError, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Phase of a backup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Init,
    Listing,
    Planning,
    Transferring,
    Finalizing,
    Done,
    Interrupted,
}

/// Run settings
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub remote_root: String,

    /// Serial recorded in the manifest
    pub device: Option<String>,

    /// Ignore the stored manifest and fetch everything
    pub fresh: bool,

    pub on_corrupt: CorruptPolicy,
    pub batch_limits: BatchLimits,
    pub stall_timeout: Duration,
    pub stall_policy: StallPolicy,
    pub checkpoint_every_files: usize,
    pub checkpoint_interval: Duration,
    pub progress_log_interval: Duration,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            remote_root: config.device.remote_root.clone(),
            device: config.device.serial.clone(),
            fresh: false,
            on_corrupt: config.manifest.on_corrupt,
            batch_limits: config.transfer.batch_limits(),
            stall_timeout: config.transfer.stall_timeout(),
            stall_policy: config.transfer.stall_policy(),
            checkpoint_every_files: config.manifest.checkpoint_every_files,
            checkpoint_interval: config.manifest.checkpoint_interval(),
            progress_log_interval: config.transfer.progress_log_interval(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Main backup run controller
pub struct RunController {
    lister: Arc<dyn RemoteLister>,
    puller: Arc<dyn BatchPull>,
    filter: Box<dyn PathFilter>,
    layout: LocalLayout,
    store: ManifestStore,
    options: RunOptions,
    cancel: CancellationToken,
    state: RunState,
}

impl RunController {
    pub fn new(
        lister: Arc<dyn RemoteLister>,
        puller: Arc<dyn BatchPull>,
        filter: Box<dyn PathFilter>,
        destination: impl Into<PathBuf>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        let layout = LocalLayout::new(destination);
        let store = ManifestStore::in_dir(&layout.meta_dir());
        Self {
            lister,
            puller,
            filter,
            layout,
            store,
            options,
            cancel,
            state: RunState::Init,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn enter(&mut self, state: RunState) {
        debug!("Run state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Execute one backup run.
    ///
    /// Errors are fatal conditions before or outside the transfer: the
    /// destination is locked, the manifest is unusable, the device cannot
    /// be listed, or a checkpoint cannot be written. Per-file failures are
    /// reported in the summary instead.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        self.enter(RunState::Init);
        let meta_dir = self.layout.meta_dir();
        let _lock = DestinationLock::acquire(&meta_dir)?;
        let mut manifest = self.load_manifest()?;
        let mut renames = RenameIndex::load(&meta_dir)?;

        if let Some(previous) = manifest.remote_root.as_deref() {
            if previous != self.options.remote_root {
                warn!(
                    "Manifest was built from {} but this run backs up {}; files outside the new root will be deleted",
                    previous, self.options.remote_root
                );
            }
        }
        manifest.remote_root = Some(self.options.remote_root.clone());
        if self.options.device.is_some() {
            manifest.device = self.options.device.clone();
        }

        self.enter(RunState::Listing);
        let listing = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            listing = self.lister.list(&self.options.remote_root) => Some(listing),
        };
        let Some(listing) = listing else {
            info!("Cancelled while listing; nothing was changed");
            self.enter(RunState::Interrupted);
            summary.state = RunState::Interrupted;
            summary.interrupted_reason = Some("cancelled".to_string());
            summary.duration = started.elapsed();
            return Ok(summary);
        };
        let remote = listing.map_err(|e| match e {
            BackupError::TransportUnavailable(_) => e,
            other => BackupError::TransportUnavailable(other.to_string()),
        })?;

        self.enter(RunState::Planning);
        let plan = planner::plan(&remote, &manifest, self.filter.as_ref());
        info!(
            "Plan: {} to fetch ({}), {} unchanged, {} to delete",
            plan.to_fetch.len(),
            crate::transfer::progress::format_bytes(plan.fetch_bytes()),
            plan.unchanged.len(),
            plan.to_delete.len()
        );
        summary.unchanged = plan.unchanged.len();

        self.enter(RunState::Transferring);
        self.apply_removals(&plan, &mut manifest, &mut renames, &mut summary)?;
        self.create_directories(&plan, &mut renames, &mut summary);
        let tasks = self.prepare_fetch(&plan, &mut manifest, &mut renames)?;

        let end = {
            let coordinator = BatchCoordinator::new(
                self.puller.as_ref(),
                self.options.stall_timeout,
                self.cancel.clone(),
            );
            let mut sink = ManifestSink::new(&mut manifest, &self.store, &plan.to_fetch, &self.options, &mut summary);
            coordinator.run(tasks, &mut sink).await?
        };

        match end {
            TransferEnd::Completed => {
                self.enter(RunState::Finalizing);
                self.store.persist(&mut manifest)?;
                renames.save()?;
                self.enter(RunState::Done);
            }
            TransferEnd::Interrupted { reason } => {
                warn!("Transfer interrupted: {}", reason);
                self.store.persist_incremental(&mut manifest)?;
                renames.save()?;
                self.enter(RunState::Interrupted);
                summary.interrupted_reason = Some(reason);
            }
        }

        summary.state = self.state;
        summary.duration = started.elapsed();
        Ok(summary)
    }

    fn load_manifest(&self) -> Result<Manifest> {
        if self.options.fresh {
            info!("Starting a fresh backup, ignoring any previous manifest");
            self.store.discard()?;
            return Ok(Manifest::new());
        }

        match self.store.load() {
            Ok(manifest) => Ok(manifest),
            Err(BackupError::ManifestCorrupt { path, reason })
                if self.options.on_corrupt == CorruptPolicy::Rebuild =>
            {
                warn!(
                    "Manifest {} is unreadable ({}); rebuilding from a full backup",
                    path.display(),
                    reason
                );
                Ok(Manifest::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Forget deleted and abandoned paths, checkpoint, then remove their
    /// local copies.
    fn apply_removals(
        &self,
        plan: &TransferPlan,
        manifest: &mut Manifest,
        renames: &mut RenameIndex,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if plan.to_delete.is_empty() && plan.abandoned.is_empty() {
            return Ok(());
        }

        let removed: Vec<&String> = plan.to_delete.iter().chain(&plan.abandoned).collect();
        for path in &removed {
            manifest.remove(path);
        }
        self.store.persist_incremental(manifest)?;

        let live = live_names(manifest, renames, |_| false);
        for path in removed {
            let local = renames.local_name(path);
            match live.owner(&local) {
                Some(owner) => warn!("Keeping {}: it still holds {}", local, owner),
                None => match self.layout.remove_file(&local) {
                    Ok(true) => debug!("Deleted {}", local),
                    Ok(false) => debug!("Nothing to delete for {}", path),
                    Err(e) => warn!("Failed to delete local copy of {}: {}", path, e),
                },
            }
            renames.forget(path);
        }

        summary.deleted = plan.to_delete.len();
        summary.abandoned = plan.abandoned.len();
        info!("Removed {} files no longer on the device", plan.to_delete.len());
        Ok(())
    }

    fn create_directories(&self, plan: &TransferPlan, renames: &mut RenameIndex, summary: &mut RunSummary) {
        for dir in &plan.directories {
            match self.layout.ensure_dir(dir) {
                Ok(_) => {
                    renames.record(dir, &sanitize_relative(dir));
                    summary.directories += 1;
                }
                Err(e) => warn!("Failed to create directory {}: {}", dir, e),
            }
        }
    }

    /// Mark every planned file incomplete, checkpoint, and pack the files
    /// into tasks.
    fn prepare_fetch(
        &self,
        plan: &TransferPlan,
        manifest: &mut Manifest,
        renames: &mut RenameIndex,
    ) -> Result<Vec<BatchTask>> {
        if plan.to_fetch.is_empty() {
            return Ok(Vec::new());
        }

        let fetching: HashSet<&str> = plan.to_fetch.iter().map(|e| e.path.as_str()).collect();
        let mut names = live_names(manifest, renames, |path| fetching.contains(path));

        // Paths that need no rewriting claim their names before renamed ones
        let (natural, rewritten): (Vec<&RemoteEntry>, Vec<&RemoteEntry>) = plan
            .to_fetch
            .iter()
            .partition(|e| renames.local_name(&e.path) == e.path);

        let mut items = Vec::with_capacity(plan.to_fetch.len());
        for entry in natural.into_iter().chain(rewritten) {
            manifest.mark_pending(entry);
            let local = names.claim(&entry.path, &renames.local_name(&entry.path));
            if local != sanitize_relative(&entry.path) {
                debug!("Storing {} as {}", entry.path, local);
            }
            renames.record(&entry.path, &local);
            items.push((local, entry));
        }
        self.store.persist_incremental(manifest)?;

        let items = items
            .into_iter()
            .map(|(local, entry)| {
                if entry.kind == EntryKind::File {
                    if let Err(e) = self.layout.clear_link(&local) {
                        warn!("Failed to remove stale link at {}: {}", local, e);
                    }
                }
                TransferItem::new(entry.clone(), self.layout.path_of(&local))
            })
            .collect();

        let tasks = partition(items, &self.options.batch_limits);
        info!("Fetching {} files in {} tasks", plan.to_fetch.len(), tasks.len());
        Ok(tasks)
    }
}

/// Local names held by manifest entries, except those `skip` selects.
fn live_names(manifest: &Manifest, renames: &RenameIndex, skip: impl Fn(&str) -> bool) -> LocalNames {
    let mut names = LocalNames::new();
    for path in manifest.files.keys().filter(|p| !skip(p.as_str())) {
        let local = renames.local_name(path);
        if !names.insert(path, local.clone()) {
            warn!("{} shares local name {} with another backed-up file", path, local);
        }
    }
    names
}

/// Credits transfer outcomes to the manifest and checkpoints it.
struct ManifestSink<'a> {
    manifest: &'a mut Manifest,
    store: &'a ManifestStore,
    planned: HashMap<&'a str, &'a RemoteEntry>,
    summary: &'a mut RunSummary,
    policy: StallPolicy,
    progress: ProgressTracker,
    checkpoint_every_files: usize,
    checkpoint_interval: Duration,
    since_checkpoint: usize,
    last_checkpoint: Instant,
}

impl<'a> ManifestSink<'a> {
    fn new(
        manifest: &'a mut Manifest,
        store: &'a ManifestStore,
        to_fetch: &'a [RemoteEntry],
        options: &RunOptions,
        summary: &'a mut RunSummary,
    ) -> Self {
        let total_bytes = to_fetch.iter().map(|e| e.size).sum();
        Self {
            manifest,
            store,
            planned: to_fetch.iter().map(|e| (e.path.as_str(), e)).collect(),
            summary,
            policy: options.stall_policy,
            progress: ProgressTracker::new(total_bytes, to_fetch.len(), options.progress_log_interval),
            checkpoint_every_files: options.checkpoint_every_files.max(1),
            checkpoint_interval: options.checkpoint_interval,
            since_checkpoint: 0,
            last_checkpoint: Instant::now(),
        }
    }

    fn checkpoint_if_due(&mut self) -> Result<()> {
        if self.since_checkpoint == 0 {
            return Ok(());
        }
        if self.since_checkpoint < self.checkpoint_every_files
            && self.last_checkpoint.elapsed() < self.checkpoint_interval
        {
            return Ok(());
        }

        self.store.persist_incremental(self.manifest)?;
        self.since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
        Ok(())
    }
}

impl TransferObserver for ManifestSink<'_> {
    fn on_task_started(&mut self, task: &BatchTask, attempt: u32) {
        if attempt > 0 {
            debug!("Task {} attempt {}: {} files", task.id, attempt, task.len());
        }
    }

    fn on_progress(&mut self, path: &str, bytes_transferred: u64) {
        self.progress.record_progress(path, bytes_transferred);
        self.progress.log_if_due();
    }

    fn on_outcome(&mut self, outcome: FileOutcome) -> Result<()> {
        let FileOutcome { path, status } = outcome;

        match status {
            FileStatus::Ok => {
                let Some(entry) = self.planned.get(path.as_str()).copied() else {
                    warn!("Transport reported unplanned file {}", path);
                    return Ok(());
                };
                self.manifest.mark_complete(entry);
                self.progress.record_finished(&path, entry.size);
                self.summary.fetched += 1;
                self.summary.fetched_bytes += entry.size;
                self.since_checkpoint += 1;
                debug!("Fetched {}", path);
            }
            FileStatus::Failed(reason) => {
                warn!("Failed to fetch {}: {}", path, reason);
                self.progress.record_finished(&path, 0);
                self.summary.failed.push((path, reason));
            }
            FileStatus::Skipped => {
                self.progress.record_finished(&path, 0);
                self.summary.skipped += 1;
            }
        }

        self.progress.log_if_due();
        self.checkpoint_if_due()
    }

    fn on_stall(&mut self, notice: &StallNotice) -> StallDecision {
        let decision = self.policy.decide(notice);
        info!(
            "Task {} stalled (attempt {}, period {}): {:?}",
            notice.task_id, notice.attempt, notice.consecutive, decision
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclude::ExcludeSet;
    use crate::fs::layout::META_DIR;
    use crate::manifest::ManifestState;
    use crate::remote::fake::{FakeBehavior, FakeDevice};
    use std::path::Path;
    use tempfile::TempDir;

    fn options() -> RunOptions {
        RunOptions {
            stall_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn controller_with(
        device: &FakeDevice,
        dest: &Path,
        filter: Box<dyn PathFilter>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> RunController {
        RunController::new(
            Arc::new(device.clone()),
            Arc::new(device.clone()),
            filter,
            dest,
            options,
            cancel,
        )
    }

    fn controller(device: &FakeDevice, dest: &Path) -> RunController {
        controller_with(device, dest, Box::new(|_: &str| false), options(), CancellationToken::new())
    }

    fn stored_manifest(dest: &Path) -> Manifest {
        ManifestStore::in_dir(&dest.join(META_DIR)).load().unwrap()
    }

    fn two_files() -> Vec<RemoteEntry> {
        vec![RemoteEntry::file("a.txt", 3, 100), RemoteEntry::file("b.txt", 5, 200)]
    }

    #[tokio::test]
    async fn test_first_and_second_run() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.fetched_bytes, 8);
        assert!(summary.is_clean());
        assert_eq!(std::fs::read(dest.path().join("b.txt")).unwrap().len(), 5);

        let manifest = stored_manifest(dest.path());
        assert_eq!(manifest.state, ManifestState::Complete);
        assert_eq!(manifest.len(), 2);
        assert!(manifest.is_fully_complete());
        assert_eq!(manifest.remote_root.as_deref(), Some("/sdcard"));

        device.reset_pulls();
        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.unchanged, 2);
        assert!(device.pulled_paths().is_empty());
    }

    #[tokio::test]
    async fn test_changed_file_is_refetched() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        controller(&device, dest.path()).run().await.unwrap();

        device.reset_pulls();
        device.set_entries(vec![RemoteEntry::file("a.txt", 3, 100), RemoteEntry::file("b.txt", 9, 300)]);
        let summary = controller(&device, dest.path()).run().await.unwrap();

        assert_eq!(device.pulled_paths(), vec!["b.txt"]);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(stored_manifest(dest.path()).get("b.txt").unwrap().size, 9);
    }

    #[tokio::test]
    async fn test_remote_deletion_removes_local_copy() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(vec![
            RemoteEntry::directory("docs", 1),
            RemoteEntry::file("docs/old.txt", 4, 1),
            RemoteEntry::file("keep.txt", 4, 1),
        ])
        .writing_files();
        controller(&device, dest.path()).run().await.unwrap();
        assert!(dest.path().join("docs/old.txt").exists());

        device.set_entries(vec![RemoteEntry::file("keep.txt", 4, 1)]);
        let summary = controller(&device, dest.path()).run().await.unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(!dest.path().join("docs/old.txt").exists());
        assert!(!dest.path().join("docs").exists());
        assert!(dest.path().join("keep.txt").exists());
        assert!(stored_manifest(dest.path()).get("docs/old.txt").is_none());
    }

    #[tokio::test]
    async fn test_failed_file_is_retried_next_run() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        device.set_behavior("b.txt", FakeBehavior::Fail("permission denied".into()));

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "b.txt");
        assert!(summary.failed[0].1.contains("permission denied"));

        let manifest = stored_manifest(dest.path());
        assert_eq!(manifest.state, ManifestState::Partial);
        assert!(manifest.get("a.txt").unwrap().complete);
        assert!(!manifest.get("b.txt").unwrap().complete);

        device.clear_behaviors();
        device.reset_pulls();
        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(device.pulled_paths(), vec!["b.txt"]);
        assert!(summary.is_clean());
        assert_eq!(stored_manifest(dest.path()).state, ManifestState::Complete);
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_and_resumes() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(vec![
            RemoteEntry::file("a.txt", 1, 1),
            RemoteEntry::file("b.txt", 1, 1),
            RemoteEntry::file("c.txt", 1, 1),
        ])
        .writing_files();
        device.set_behavior("b.txt", FakeBehavior::Disconnect);

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.state, RunState::Interrupted);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.skipped, 2);
        assert!(summary.interrupted_reason.unwrap().contains("disconnected"));

        let manifest = stored_manifest(dest.path());
        assert_eq!(manifest.state, ManifestState::Partial);
        let pending: Vec<&str> = manifest.pending_paths().collect();
        assert_eq!(pending, vec!["b.txt", "c.txt"]);

        device.clear_behaviors();
        device.reset_pulls();
        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(device.pulled_paths(), vec!["b.txt", "c.txt"]);
        assert_eq!(summary.unchanged, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_listing_changes_nothing() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut run = controller_with(&device, dest.path(), Box::new(|_: &str| false), options(), cancel);
        let summary = run.run().await.unwrap();

        assert_eq!(summary.state, RunState::Interrupted);
        assert_eq!(run.state(), RunState::Interrupted);
        assert!(device.pulled_batches().is_empty());
        assert!(stored_manifest(dest.path()).is_empty());
    }

    #[tokio::test]
    async fn test_hung_task_is_cancelled_by_shutdown() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(vec![RemoteEntry::file("big.bin", 10, 1)]).writing_files();
        device.set_behavior("big.bin", FakeBehavior::Hang);
        let cancel = CancellationToken::new();
        let opts = RunOptions { stall_timeout: Duration::from_secs(60), ..Default::default() };

        let mut run = controller_with(&device, dest.path(), Box::new(|_: &str| false), opts, cancel.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let summary = run.run().await.unwrap();
        trigger.await.unwrap();

        assert_eq!(summary.state, RunState::Interrupted);
        assert_eq!(summary.skipped, 1);
        assert!(!stored_manifest(dest.path()).get("big.bin").unwrap().complete);
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files());
        device.fail_listing("no devices/emulators found");

        let mut run = controller(&device, dest.path());
        let err = run.run().await.unwrap_err();
        assert!(matches!(err, BackupError::TransportUnavailable(_)));
        assert_eq!(run.state(), RunState::Listing);
        assert!(!dest.path().join(META_DIR).join("lock").exists());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_policies() {
        let dest = TempDir::new().unwrap();
        let meta = dest.path().join(META_DIR);
        std::fs::create_dir_all(&meta).unwrap();
        std::fs::write(meta.join("manifest.json"), b"{ not json").unwrap();
        let device = FakeDevice::new(two_files()).writing_files();

        let abort = RunOptions { on_corrupt: CorruptPolicy::Abort, ..options() };
        let err = controller_with(&device, dest.path(), Box::new(|_: &str| false), abort, CancellationToken::new())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ManifestCorrupt { .. }));
        assert!(device.pulled_batches().is_empty());

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.fetched, 2);
        assert_eq!(stored_manifest(dest.path()).state, ManifestState::Complete);
    }

    #[tokio::test]
    async fn test_fresh_run_fetches_everything() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        controller(&device, dest.path()).run().await.unwrap();

        device.reset_pulls();
        let fresh = RunOptions { fresh: true, ..options() };
        let summary = controller_with(&device, dest.path(), Box::new(|_: &str| false), fresh, CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.fetched, 2);
        assert_eq!(device.pulled_paths(), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_locked_destination() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files());
        let _held = DestinationLock::acquire(&dest.path().join(META_DIR)).unwrap();

        let err = controller(&device, dest.path()).run().await.unwrap_err();
        assert!(matches!(err, BackupError::Locked { .. }));
    }

    #[tokio::test]
    async fn test_exclusions_skip_and_delete() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(vec![
            RemoteEntry::file("app.log", 2, 1),
            RemoteEntry::file("photo.jpg", 2, 1),
        ])
        .writing_files();
        controller(&device, dest.path()).run().await.unwrap();
        assert!(dest.path().join("app.log").exists());

        device.reset_pulls();
        let excludes = ExcludeSet::new(["*.log"]).unwrap();
        let summary = controller_with(&device, dest.path(), Box::new(excludes), options(), CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(device.pulled_paths().is_empty());
        assert!(!dest.path().join("app.log").exists());
        assert!(stored_manifest(dest.path()).get("app.log").is_none());
    }

    #[tokio::test]
    async fn test_stalled_file_retried_once() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        device.set_behavior("b.txt", FakeBehavior::HangOnce);

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert!(summary.is_clean());
        assert_eq!(device.pulled_batches(), vec![vec!["a.txt", "b.txt"], vec!["b.txt"]]);
    }

    #[tokio::test]
    async fn test_persistently_stalled_file_fails() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        device.set_behavior("b.txt", FakeBehavior::Hang);

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].1.contains("stalled"));
        assert!(!stored_manifest(dest.path()).get("b.txt").unwrap().complete);
    }

    #[tokio::test]
    async fn test_unsafe_names_are_renamed_and_indexed() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(vec![
            RemoteEntry::directory("Music/AC:DC", 1),
            RemoteEntry::file("Music/AC:DC/song?.mp3", 4, 1),
        ])
        .writing_files();

        controller(&device, dest.path()).run().await.unwrap();

        assert!(dest.path().join("Music/AC_DC/song_.mp3").exists());
        let index = RenameIndex::load(&dest.path().join(META_DIR)).unwrap();
        assert_eq!(index.get("Music/AC:DC/song?.mp3"), Some("Music/AC_DC/song_.mp3"));
        assert_eq!(index.get("Music/AC:DC"), Some("Music/AC_DC"));
        assert!(stored_manifest(dest.path()).get("Music/AC:DC/song?.mp3").is_some());
    }

    #[tokio::test]
    async fn test_colliding_names_get_distinct_local_files() {
        let dest = TempDir::new().unwrap();
        let device =
            FakeDevice::new(vec![RemoteEntry::file("x:y", 3, 1), RemoteEntry::file("x?y", 5, 1)]).writing_files();

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.fetched, 2);

        let index = RenameIndex::load(&dest.path().join(META_DIR)).unwrap();
        let first = index.get("x:y").unwrap().to_string();
        let second = index.get("x?y").unwrap().to_string();
        let mut names = vec![first.clone(), second.clone()];
        names.sort();
        assert_eq!(names, vec!["x_y", "x_y~1"]);
        assert_eq!(std::fs::metadata(dest.path().join(&first)).unwrap().len(), 3);
        assert_eq!(std::fs::metadata(dest.path().join(&second)).unwrap().len(), 5);

        // dropping one path leaves the other's copy alone
        device.reset_pulls();
        device.set_entries(vec![RemoteEntry::file("x?y", 5, 1)]);
        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(!dest.path().join(&first).exists());
        assert_eq!(std::fs::metadata(dest.path().join(&second)).unwrap().len(), 5);

        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.unchanged, 1);
        assert!(device.pulled_paths().is_empty());
    }

    #[tokio::test]
    async fn test_shared_local_file_survives_deletion() {
        let dest = TempDir::new().unwrap();
        let store = ManifestStore::in_dir(&dest.path().join(META_DIR));
        let mut manifest = Manifest::new();
        manifest.mark_complete(&RemoteEntry::file("x:y", 3, 1));
        manifest.mark_complete(&RemoteEntry::file("x?y", 5, 1));
        store.persist(&mut manifest).unwrap();
        std::fs::write(dest.path().join("x_y"), b"xxxxx").unwrap();

        let device = FakeDevice::new(vec![RemoteEntry::file("x?y", 5, 1)]).writing_files();
        let summary = controller(&device, dest.path()).run().await.unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(dest.path().join("x_y").exists());
        let manifest = stored_manifest(dest.path());
        assert!(manifest.get("x:y").is_none());
        assert!(manifest.get("x?y").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_replaced_by_file_leaves_target_intact() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(vec![
            RemoteEntry::file("b.txt", 3, 1),
            RemoteEntry::symlink("x", "b.txt", 1),
        ])
        .writing_files();
        controller(&device, dest.path()).run().await.unwrap();
        let meta = std::fs::symlink_metadata(dest.path().join("x")).unwrap();
        assert!(meta.file_type().is_symlink());

        device.set_entries(vec![RemoteEntry::file("b.txt", 3, 1), RemoteEntry::file("x", 7, 2)]);
        let summary = controller(&device, dest.path()).run().await.unwrap();
        assert_eq!(summary.fetched, 1);

        assert_eq!(std::fs::metadata(dest.path().join("b.txt")).unwrap().len(), 3);
        let meta = std::fs::symlink_metadata(dest.path().join("x")).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(meta.len(), 7);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_keeps_local_copies() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        controller(&device, dest.path()).run().await.unwrap();

        device.set_entries(vec![RemoteEntry::file("a.txt", 3, 100)]);
        // a directory where the temporary manifest goes makes the write fail
        let blocker = dest
            .path()
            .join(META_DIR)
            .join(format!("manifest.json.tmp.{}", std::process::id()));
        std::fs::create_dir_all(&blocker).unwrap();

        let result = controller(&device, dest.path()).run().await;
        assert!(result.is_err());
        assert!(dest.path().join("b.txt").exists());
        assert!(stored_manifest(dest.path()).get("b.txt").is_some());
    }

    #[tokio::test]
    async fn test_vanished_unfinished_file_is_abandoned() {
        let dest = TempDir::new().unwrap();
        let device = FakeDevice::new(two_files()).writing_files();
        device.set_behavior("b.txt", FakeBehavior::Silent);
        controller(&device, dest.path()).run().await.unwrap();
        assert!(!stored_manifest(dest.path()).get("b.txt").unwrap().complete);

        device.clear_behaviors();
        device.set_entries(vec![RemoteEntry::file("a.txt", 3, 100)]);
        let summary = controller(&device, dest.path()).run().await.unwrap();

        assert_eq!(summary.abandoned, 1);
        assert_eq!(summary.deleted, 0);
        let manifest = stored_manifest(dest.path());
        assert!(manifest.get("b.txt").is_none());
        assert_eq!(manifest.state, ManifestState::Complete);
    }
}
