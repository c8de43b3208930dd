//! Result of one backup run.

use super::RunState;
use crate::transfer::progress::{format_bytes, format_duration, format_speed};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub state: RunState,
    pub fetched: usize,
    pub fetched_bytes: u64,
    pub unchanged: usize,
    pub deleted: usize,
    pub abandoned: usize,
    pub directories: usize,
    /// Planned files not attempted because the run stopped early
    pub skipped: usize,
    /// Path and reason of every file that failed this run
    pub failed: Vec<(String, String)>,
    pub interrupted_reason: Option<String>,
    pub duration: Duration,
}

impl RunSummary {
    /// Every planned file made it
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Done && self.failed.is_empty() && self.skipped == 0
    }

    pub fn average_speed(&self) -> u64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.fetched_bytes as f64 / secs) as u64
        } else {
            0
        }
    }

    pub fn log(&self) {
        match self.state {
            RunState::Interrupted => warn!(
                "Backup interrupted ({}); run again to resume",
                self.interrupted_reason.as_deref().unwrap_or("unknown reason")
            ),
            _ => info!("Backup finished in {}", format_duration(self.duration.as_secs())),
        }

        info!(
            "Fetched {} files ({}, {}), {} unchanged, {} deleted, {} skipped, {} failed",
            self.fetched,
            format_bytes(self.fetched_bytes),
            format_speed(self.average_speed()),
            self.unchanged,
            self.deleted,
            self.skipped,
            self.failed.len()
        );

        if self.abandoned > 0 {
            info!("Dropped {} unfinished files that no longer exist on the device", self.abandoned);
        }

        for (path, reason) in &self.failed {
            warn!("  failed: {} ({})", path, reason);
        }
    }
}
