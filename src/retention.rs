#![forbid(unsafe_code)]

//! Age-based cleanup of the output directory.
//!
//! Streamed downloads delete themselves once the response body is dropped.
//! Everything else (URL-reference downloads, files whose delete failed,
//! leftovers from a crash) is reclaimed here once it is older than the
//! configured maximum age. The sweeper does not know which files are being
//! streamed right now; the age threshold is what keeps it off them.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

use crate::config::RetentionPolicy;
use crate::error::{JobError, JobResult};

/// Outcome of one pass. `deleted + remaining` equals the number of entries
/// that were listed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    dir: PathBuf,
    max_age: Duration,
}

impl Sweeper {
    pub fn new(dir: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            dir: dir.into(),
            max_age: policy.max_age(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn sweep(&self) -> JobResult<SweepReport> {
        self.sweep_at(SystemTime::now()).await
    }

    /// Deletes every regular file whose age at `now` exceeds the maximum.
    /// Per-file failures are counted and logged; only a failure to list the
    /// directory itself is returned as an error.
    pub async fn sweep_at(&self, now: SystemTime) -> JobResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(dir = %self.dir.display(), "output directory missing, nothing to sweep");
                return Ok(report);
            }
            Err(err) => {
                return Err(JobError::filesystem(
                    format!("listing {}", self.dir.display()),
                    err,
                ));
            }
        };

        let mut listed = 0usize;
        while let Some(entry) = entries.next_entry().await.map_err(|err| {
            JobError::filesystem(format!("listing {}", self.dir.display()), err)
        })? {
            listed += 1;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    report.failed += 1;
                    warn!(file = %name, error = %err, "could not stat file during sweep");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= self.max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    report.deleted += 1;
                    info!(file = %name, age_minutes = age.as_secs() / 60, "deleted expired file");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(file = %name, error = %err, "failed to delete expired file");
                }
            }
        }

        report.remaining = listed - report.deleted;
        info!(
            deleted = report.deleted,
            failed = report.failed,
            remaining = report.remaining,
            "sweep complete"
        );
        Ok(report)
    }
}

/// Sweeps once right away, then every `interval` if one is given. With no
/// interval the task ends after the first pass.
pub fn spawn_sweeper(sweeper: Arc<Sweeper>, interval: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_logged(&sweeper).await;
        let Some(period) = interval else {
            info!("periodic cleanup disabled (set FILE_CLEANUP_INTERVAL > 0 to enable)");
            return;
        };
        info!(every_minutes = period.as_secs() / 60, "periodic cleanup enabled");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_logged(&sweeper).await;
        }
    })
}

async fn run_logged(sweeper: &Sweeper) {
    if let Err(err) = sweeper.sweep().await {
        warn!(error = %err, "cleanup sweep failed");
    }
}
