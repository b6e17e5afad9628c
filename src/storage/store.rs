//! Telemetry store facade.
//!
//! Every operation is one of two shapes:
//! - a write job queued on the [`WritePipeline`] (awaited or fire-and-forget)
//! - a read on a [`ReadLease`](crate::storage::pool::ReadLease) borrowed from the [`ReadPool`]
//!
//! Operations are grouped per domain area in the child modules; they all
//! share the primitives defined here.

mod agents;
mod identity;
mod issues;
mod logs;
mod maintenance;
mod search;
mod spans;
mod workflows;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use duckdb::{Connection, Transaction};

use crate::live::{LiveBroadcaster, LiveMessage};
use crate::storage::StorageError;
use crate::storage::batch::BatchInsert;
use crate::storage::builder::StoreLocation;
use crate::storage::pipeline::{PipelineCounters, WritePipeline};
use crate::storage::pool::ReadPool;

pub use issues::IssueQuery;
pub use logs::LogQuery;
pub use maintenance::{ArchiveResult, validate_archive_dir};
pub use spans::SpanQuery;

// =============================================================================
// Constants
// =============================================================================

pub(crate) const DEFAULT_LIMIT: u32 = 100;
pub(crate) const MAX_LIMIT: u32 = 10_000;

/// Clamp a caller-provided limit into `1..=MAX_LIMIT`.
pub(crate) fn effective_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Run `f` inside one transaction on the writer connection.
pub(crate) fn in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Pre-sized insert compilers shared by all write jobs.
pub(crate) struct Statements {
    pub spans: BatchInsert,
    pub logs: BatchInsert,
}

// =============================================================================
// Store
// =============================================================================

pub(crate) struct StoreParts {
    pub location: StoreLocation,
    pub pipeline: WritePipeline,
    pub pool: ReadPool,
    pub live: Option<LiveBroadcaster>,
    pub shutdown_grace: Duration,
}

struct StoreInner {
    location: StoreLocation,
    pipeline: WritePipeline,
    pool: ReadPool,
    statements: Arc<Statements>,
    live: Option<LiveBroadcaster>,
    shutdown_grace: Duration,
    disposed: AtomicBool,
}

/// Handle to an open store. Cheap to clone; clones share one writer and one pool.
///
/// Built with [`StoreBuilder`](crate::storage::StoreBuilder). Call
/// [`shutdown`](Self::shutdown) before exit so queued writes are drained.
#[derive(Clone)]
pub struct TelemetryStore {
    inner: Arc<StoreInner>,
}

impl TelemetryStore {
    pub(crate) fn from_parts(parts: StoreParts) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                location: parts.location,
                pipeline: parts.pipeline,
                pool: parts.pool,
                statements: Arc::new(Statements {
                    spans: spans::span_insert(),
                    logs: logs::log_insert(),
                }),
                live: parts.live,
                shutdown_grace: parts.shutdown_grace,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Write pipeline counters (queue depth, drops, completions).
    pub fn counters(&self) -> PipelineCounters {
        self.inner.pipeline.counters()
    }

    /// Number of read leases currently held.
    pub fn reads_in_flight(&self) -> usize {
        self.inner.pool.in_use()
    }

    pub fn broadcaster(&self) -> Option<&LiveBroadcaster> {
        self.inner.live.as_ref()
    }

    /// Drain queued writes and stop the writer. Idempotent.
    ///
    /// Every later call fails with [`StorageError::Disposed`]. The database
    /// file is released once the last clone of this handle is dropped.
    pub async fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(location = %self.inner.location, "Shutting down telemetry store");
        self.inner.pool.close();
        self.inner.pipeline.shutdown(self.inner.shutdown_grace).await;
        let counters = self.inner.pipeline.counters();
        tracing::info!(
            completed = counters.completed_jobs,
            failed = counters.failed_jobs,
            dropped = counters.dropped_jobs,
            cancelled = counters.cancelled_jobs,
            "Telemetry store closed"
        );
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_disposed() {
            Err(StorageError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn statements(&self) -> Arc<Statements> {
        Arc::clone(&self.inner.statements)
    }

    pub(crate) fn live(&self) -> Option<LiveBroadcaster> {
        self.inner.live.clone()
    }

    pub(crate) fn publish(&self, message: LiveMessage) {
        if let Some(live) = &self.inner.live {
            live.publish(message);
        }
    }

    /// Borrow a read lease and run `f` on a blocking thread.
    ///
    /// The lease is released when `f` returns, even if the caller stopped
    /// waiting. A connection that hit an engine error is discarded.
    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        self.ensure_open()?;
        let mut lease = self.inner.pool.acquire().await?;
        tokio::task::spawn_blocking(move || {
            let result = f(&lease);
            if let Err(StorageError::Database(e)) = &result
                && !matches!(e, duckdb::Error::QueryReturnedNoRows)
            {
                lease.discard();
            }
            result
        })
        .await?
    }

    /// Queue a write job and wait for its result.
    ///
    /// Dropping the returned future before the writer reaches the job
    /// cancels it.
    pub(crate) async fn write<T, F>(&self, label: &'static str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.pipeline.submit(label, f).await
    }

    /// Queue a fire-and-forget write job carrying `records` telemetry records.
    pub(crate) fn write_detached<F>(
        &self,
        label: &'static str,
        records: usize,
        f: F,
    ) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<(), StorageError> + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.pipeline.enqueue(label, records, f)
    }
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore")
            .field("location", &self.inner.location)
            .field("pipeline", &self.inner.pipeline)
            .field("pool", &self.inner.pool)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn test_effective_limit_bounds() {
        assert_eq!(effective_limit(None), DEFAULT_LIMIT);
        assert_eq!(effective_limit(Some(0)), 1);
        assert_eq!(effective_limit(Some(u32::MAX)), MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_disposed() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store.shutdown().await;
        store.shutdown().await;

        assert!(store.is_disposed());
        assert!(matches!(store.span_count().await, Err(StorageError::Disposed)));
        assert!(matches!(
            store.insert_spans(Vec::new()),
            Err(StorageError::Disposed)
        ));
        assert!(matches!(
            store.clear_all_telemetry().await,
            Err(StorageError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_read_failure_discards_connection_but_pool_recovers() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let err = store
            .read(|conn| {
                conn.execute_batch("SELECT * FROM no_such_table")?;
                Ok(())
            })
            .await;
        assert!(matches!(err, Err(StorageError::Database(_))));
        assert_eq!(store.span_count().await.unwrap(), 0);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let result: Result<(), _> = store
            .write("probe", |conn| {
                in_transaction(conn, |tx| {
                    tx.execute(
                        "INSERT INTO projects VALUES ('p1', 'w1', 'n', NULL, 1, 1)",
                        [],
                    )?;
                    Err(StorageError::Internal("abort".into()))
                })
            })
            .await;
        assert!(result.is_err());
        let n: i64 = store
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 0);
        store.shutdown().await;
    }
}
