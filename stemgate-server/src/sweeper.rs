//! Retention sweeper
//!
//! Reclaims files left behind by abandoned or crashed jobs. Runs on its own
//! timer, independent of request handling:
//!
//! ```text
//! Idle -> Sleeping(interval) -> Scanning -> Idle -> ...
//! ```
//!
//! The loop ends only when its cancellation token fires. A scan in progress
//! may be abandoned at that point; the sweeper only ever deletes, so stopping
//! mid-scan leaves nothing inconsistent.

use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::remove_path;

/// Outcome of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
    pub kept: usize,
}

/// Background remover of entries older than the retention window
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    dirs: Vec<PathBuf>,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(dirs: Vec<PathBuf>, retention: Duration, interval: Duration) -> Self {
        Self {
            dirs,
            retention,
            interval,
        }
    }

    /// Remove every direct entry of the managed directories modified before
    /// `now - retention`
    ///
    /// Failures on individual entries are logged and counted; the scan always
    /// continues with the next entry.
    pub fn sweep_once(&self, now: SystemTime) -> SweepReport {
        let cutoff = now.checked_sub(self.retention).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut report = SweepReport::default();

        for dir in &self.dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Cannot list managed directory");
                    report.failed += 1;
                    continue;
                }
            };

            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Cannot read directory entry");
                        report.failed += 1;
                        continue;
                    }
                };
                let path = entry.path();

                let modified = match entry.metadata().and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Cannot read modification time");
                        report.failed += 1;
                        continue;
                    }
                };

                if modified >= cutoff {
                    report.kept += 1;
                    continue;
                }

                match remove_path(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), "Removed expired file");
                        report.removed += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove expired file");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Sleep, scan, repeat until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Retention sweeper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let sweeper = self.clone();
            let scan = tokio::task::spawn_blocking(move || sweeper.sweep_once(SystemTime::now()));
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = scan => match result {
                    Ok(report) => debug!(
                        removed = report.removed,
                        failed = report.failed,
                        kept = report.kept,
                        "Retention sweep finished"
                    ),
                    Err(e) => warn!(error = %e, "Retention sweep task failed"),
                },
            }
        }

        info!("Retention sweeper stopped");
    }
}
