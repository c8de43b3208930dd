//! Batched, resumable transfer of planned files.

pub mod batch;
pub mod coordinator;
pub mod progress;

pub use batch::{partition, BatchLimits, BatchTask, TransferItem};
pub use coordinator::{
    BatchCoordinator, StallDecision, StallNotice, StallPolicy, TransferEnd, TransferObserver,
};

/// Final status of one planned file in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Ok,
    Failed(String),
    /// Not attempted because the run was interrupted
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub path: String,
    pub status: FileStatus,
}

impl FileOutcome {
    pub fn ok(path: impl Into<String>) -> Self {
        Self { path: path.into(), status: FileStatus::Ok }
    }

    pub fn failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { path: path.into(), status: FileStatus::Failed(reason.into()) }
    }

    pub fn skipped(path: impl Into<String>) -> Self {
        Self { path: path.into(), status: FileStatus::Skipped }
    }
}
