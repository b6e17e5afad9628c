//! Background retention: age limits, count ceilings and optional archival.
//!
//! Every tick runs, in order:
//! 1. Archive spans older than the age cutoff (when an archive dir is set)
//! 2. Delete spans and logs older than the cutoff
//! 3. Trim spans and logs above their ceilings down to `target_ratio × max`
//!
//! Trimming to a fraction of the ceiling leaves headroom, so a store hovering
//! at its limit is not trimmed again on every tick.
//!
//! # Example
//!
//! ```ignore
//! let handle = RetentionService::new(store.clone(), RetentionPolicy::default()).spawn();
//! // ...
//! handle.shutdown().await;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::storage::{StorageError, TelemetryStore, unix_nanos_ago};

// =============================================================================
// Constants
// =============================================================================

pub const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_MAX_SPAN_COUNT: u64 = 1_000_000;
pub const DEFAULT_MAX_LOG_COUNT: u64 = 1_000_000;
pub const DEFAULT_TARGET_RATIO: f64 = 0.9;

/// How long [`RetentionHandle::shutdown`] waits for an in-flight tick.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Policy & report
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Time between ticks.
    pub interval: Duration,
    /// Records older than this are archived (if configured) and deleted.
    pub max_age: Option<Duration>,
    pub max_span_count: Option<u64>,
    pub max_log_count: Option<u64>,
    /// Fraction of a ceiling kept after trimming, in `(0, 1]`.
    pub target_ratio: f64,
    /// Destination for Parquet exports of aged-out spans.
    pub archive_dir: Option<PathBuf>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETENTION_INTERVAL,
            max_age: Some(DEFAULT_MAX_AGE),
            max_span_count: Some(DEFAULT_MAX_SPAN_COUNT),
            max_log_count: Some(DEFAULT_MAX_LOG_COUNT),
            target_ratio: DEFAULT_TARGET_RATIO,
            archive_dir: None,
        }
    }
}

impl RetentionPolicy {
    /// Number of rows to delete so `current` lands on the trim target.
    fn excess(&self, current: u64, max: u64) -> u64 {
        if current <= max {
            return 0;
        }
        let target = (max as f64 * self.target_ratio.clamp(0.0, 1.0)).floor() as u64;
        current.saturating_sub(target)
    }
}

/// What one retention tick removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub spans_archived: usize,
    pub archive_path: Option<PathBuf>,
    pub spans_deleted_by_age: usize,
    pub logs_deleted_by_age: usize,
    pub spans_deleted_by_count: usize,
    pub logs_deleted_by_count: usize,
}

impl CleanupReport {
    /// Rows removed from the store, archived ones included.
    pub fn total_removed(&self) -> usize {
        self.spans_archived
            + self.spans_deleted_by_age
            + self.logs_deleted_by_age
            + self.spans_deleted_by_count
            + self.logs_deleted_by_count
    }
}

// =============================================================================
// Service
// =============================================================================

/// Applies a [`RetentionPolicy`] to a store, once or on an interval.
#[derive(Debug, Clone)]
pub struct RetentionService {
    store: TelemetryStore,
    policy: RetentionPolicy,
}

impl RetentionService {
    pub fn new(store: TelemetryStore, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Run a single cleanup pass. Every deletion goes through the write pipeline.
    ///
    /// A failed archive aborts the pass before anything is deleted.
    pub async fn run_once(&self) -> Result<CleanupReport, StorageError> {
        let mut report = CleanupReport::default();

        if let Some(max_age) = self.policy.max_age {
            let cutoff = unix_nanos_ago(max_age);
            if let Some(dir) = &self.policy.archive_dir {
                let archived = self.store.archive_before(dir, cutoff).await?;
                report.spans_archived = archived.rows;
                report.archive_path = archived.path;
            }
            report.spans_deleted_by_age = self.store.delete_spans_before(cutoff).await?;
            report.logs_deleted_by_age = self.store.delete_logs_before(cutoff).await?;
        }

        if let Some(max) = self.policy.max_span_count {
            let excess = self.policy.excess(self.store.span_count().await?, max);
            if excess > 0 {
                report.spans_deleted_by_count = self.store.delete_oldest_spans(excess).await?;
            }
        }
        if let Some(max) = self.policy.max_log_count {
            let excess = self.policy.excess(self.store.log_count().await?, max);
            if excess > 0 {
                report.logs_deleted_by_count = self.store.delete_oldest_logs(excess).await?;
            }
        }

        Ok(report)
    }

    /// Start the periodic loop. The first tick fires one interval from now.
    pub fn spawn(self) -> RetentionHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run_loop(shutdown_rx));
        RetentionHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run_loop(self, mut shutdown: oneshot::Receiver<()>) {
        let period = self.policy.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval = ?period,
            max_age = ?self.policy.max_age,
            max_span_count = ?self.policy.max_span_count,
            max_log_count = ?self.policy.max_log_count,
            "Retention service started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(report) if report.total_removed() > 0 => {
                    tracing::info!(
                        archived = report.spans_archived,
                        spans_by_age = report.spans_deleted_by_age,
                        logs_by_age = report.logs_deleted_by_age,
                        spans_by_count = report.spans_deleted_by_count,
                        logs_by_count = report.logs_deleted_by_count,
                        "Retention tick completed"
                    );
                }
                Ok(_) => tracing::debug!("Retention tick: nothing to remove"),
                Err(StorageError::Disposed) => {
                    tracing::info!("Store closed, stopping retention service");
                    break;
                }
                Err(e) => tracing::error!(error = %e, "Retention tick failed"),
            }
        }
        tracing::info!("Retention service stopped");
    }
}

/// Handle to a running retention loop.
#[derive(Debug)]
pub struct RetentionHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RetentionHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop, letting an in-flight tick finish within a bounded wait.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let abort = self.task.abort_handle();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Retention task panicked"),
            Err(_) => {
                tracing::warn!("Retention service shutdown timed out, aborting");
                abort.abort();
            }
        }
    }
}
