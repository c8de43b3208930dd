//! Byte-level progress tracking across a whole transfer.
//!
//! The transport reports progress per file; this module folds those
//! reports into run-wide byte and file counts, transfer speed and ETA.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Aggregate progress of the fetch phase
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes to transfer
    pub total_bytes: u64,

    /// Bytes transferred so far (finished files plus in-flight bytes)
    pub transferred_bytes: u64,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    /// Number of files that reached a final status
    pub files_processed: usize,

    /// Total number of files
    pub total_files: usize,

    /// Most recent file reported by the transport
    pub current_file: Option<String>,
}

impl TransferProgress {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete: 0.0,
            files_processed: 0,
            total_files,
            current_file: None,
        }
    }

    /// Update progress with new transferred bytes
    pub fn update(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = transferred_bytes;
        self.percent_complete = if self.total_bytes > 0 {
            ((self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else if self.total_files == 0 || self.files_processed >= self.total_files {
            100.0
        } else {
            0.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.files_processed >= self.total_files
    }
}

/// Folds per-file progress reports into a [`TransferProgress`]
pub struct ProgressTracker {
    start_time: Instant,
    last_sample_time: Instant,
    last_sample_bytes: u64,
    last_log: Option<Instant>,
    log_interval: Duration,
    completed_bytes: u64,
    in_flight: HashMap<String, u64>,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_files: usize, log_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_sample_time: now,
            last_sample_bytes: 0,
            last_log: None,
            log_interval,
            completed_bytes: 0,
            in_flight: HashMap::new(),
            progress: TransferProgress::new(total_bytes, total_files),
        }
    }

    /// Record bytes received so far for a file still in flight
    pub fn record_progress(&mut self, path: &str, bytes: u64) {
        self.in_flight.insert(path.to_string(), bytes);
        self.progress.current_file = Some(path.to_string());
        self.refresh();
    }

    /// Record a file reaching its final status.
    ///
    /// `credited_bytes` is the file size for a success and 0 otherwise.
    pub fn record_finished(&mut self, path: &str, credited_bytes: u64) {
        self.in_flight.remove(path);
        self.completed_bytes += credited_bytes;
        self.progress.files_processed += 1;
        self.refresh();
    }

    fn refresh(&mut self) {
        let in_flight: u64 = self.in_flight.values().sum();
        self.progress.update(self.completed_bytes + in_flight);
    }

    /// Recompute speed and ETA from the bytes seen since the last sample
    pub fn sample(&mut self) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_time).as_secs_f64();
        let transferred = self.progress.transferred_bytes;

        if elapsed > 0.0 {
            let bytes_diff = transferred.saturating_sub(self.last_sample_bytes);
            self.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        self.progress.eta_seconds = if self.progress.bytes_per_second > 0 {
            self.progress.total_bytes.saturating_sub(transferred) / self.progress.bytes_per_second
        } else {
            0
        };

        self.last_sample_time = now;
        self.last_sample_bytes = transferred;

        &self.progress
    }

    /// Emit a progress line if the log interval has passed since the last one
    pub fn log_if_due(&mut self) {
        let due = self
            .last_log
            .map_or(true, |last| last.elapsed() >= self.log_interval);
        if !due {
            return;
        }
        self.last_log = Some(Instant::now());

        let progress = self.sample().clone();
        tracing::info!(
            "Progress: {:.1}% ({}/{} files, {} of {}) at {}, ETA {}",
            progress.percent_complete,
            progress.files_processed,
            progress.total_files,
            format_bytes(progress.transferred_bytes),
            format_bytes(progress.total_bytes),
            format_speed(progress.bytes_per_second),
            format_duration(progress.eta_seconds),
        );
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_transfer_progress_update() {
        let mut progress = TransferProgress::new(1000, 10);
        progress.update(500);
        assert_eq!(progress.transferred_bytes, 500);
        assert!((progress.percent_complete - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_nothing_to_transfer_is_complete() {
        let mut progress = TransferProgress::new(0, 0);
        progress.update(0);
        assert!(progress.is_complete());
        assert!((progress.percent_complete - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_tracker_counts_in_flight_bytes() {
        let mut tracker = ProgressTracker::new(1000, 2, Duration::from_secs(5));

        tracker.record_progress("a", 300);
        tracker.record_progress("b", 100);
        assert_eq!(tracker.progress().transferred_bytes, 400);
        assert_eq!(tracker.progress().current_file.as_deref(), Some("b"));

        // Finishing "a" replaces its in-flight bytes with the full size
        tracker.record_finished("a", 600);
        assert_eq!(tracker.progress().transferred_bytes, 700);
        assert_eq!(tracker.progress().files_processed, 1);
    }

    #[test]
    fn test_failed_file_credits_nothing() {
        let mut tracker = ProgressTracker::new(1000, 1, Duration::from_secs(5));
        tracker.record_progress("a", 300);
        tracker.record_finished("a", 0);

        assert_eq!(tracker.progress().transferred_bytes, 0);
        assert!(tracker.progress().is_complete());
    }

    #[test]
    fn test_sample_computes_speed() {
        let mut tracker = ProgressTracker::new(10_000, 5, Duration::from_secs(5));
        tracker.sample();

        thread::sleep(Duration::from_millis(100));
        tracker.record_progress("a", 500);
        let progress = tracker.sample();
        assert!(progress.bytes_per_second > 0);
        assert!(progress.eta_seconds > 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
