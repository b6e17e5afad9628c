//! Store builder.
//!
//! Opens the database, applies the schema, and wires the write pipeline and
//! read pool around it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use duckdb::Connection;

use crate::live::LiveBroadcaster;
use crate::storage::StorageError;
use crate::storage::pipeline::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_GRACE, WritePipeline, WriterOptions,
};
use crate::storage::pool::{
    DEFAULT_MAX_CONCURRENT_READS, DEFAULT_READ_IDLE_TIMEOUT, ReadPolicy, ReadPool, ReadPoolOptions,
};
use crate::storage::schema::{BuiltinSchema, SchemaProvider, init_schema};
use crate::storage::store::{StoreParts, TelemetryStore};

/// Path value selecting a memory-resident database.
pub const MEMORY_PATH: &str = ":memory:";

/// Default idle `CHECKPOINT` interval for file-backed stores.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl StoreLocation {
    /// `:memory:` (or an empty path) selects memory-resident mode.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.as_os_str().is_empty() || path.as_os_str() == MEMORY_PATH {
            StoreLocation::Memory
        } else {
            StoreLocation::File(path.to_path_buf())
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, StoreLocation::Memory)
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            StoreLocation::File(path) => Some(path),
            StoreLocation::Memory => None,
        }
    }

    /// Reads go through a shared connection in memory-resident mode.
    pub fn read_policy(&self) -> ReadPolicy {
        match self {
            StoreLocation::File(_) => ReadPolicy::Pooled,
            StoreLocation::Memory => ReadPolicy::Shared,
        }
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLocation::File(path) => write!(f, "{}", path.display()),
            StoreLocation::Memory => f.write_str(MEMORY_PATH),
        }
    }
}

/// Builder for [`TelemetryStore`].
pub struct StoreBuilder {
    location: StoreLocation,
    queue_capacity: usize,
    max_concurrent_reads: usize,
    checkpoint_interval: Duration,
    shutdown_grace: Duration,
    read_idle_timeout: Duration,
    schema: Box<dyn SchemaProvider>,
    live: Option<LiveBroadcaster>,
}

impl StoreBuilder {
    /// Builder for a store at `path`; `:memory:` selects memory-resident mode.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            location: StoreLocation::from_path(path),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            read_idle_timeout: DEFAULT_READ_IDLE_TIMEOUT,
            schema: Box::new(BuiltinSchema),
            live: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MEMORY_PATH)
    }

    /// Pending write jobs kept before drop-oldest eviction kicks in.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn max_concurrent_reads(mut self, max: usize) -> Self {
        self.max_concurrent_reads = max;
        self
    }

    /// Idle `CHECKPOINT` interval. Ignored in memory-resident mode.
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// How long shutdown waits for queued writes before cancelling them.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.read_idle_timeout = timeout;
        self
    }

    /// Replace the built-in DDL.
    pub fn schema(mut self, provider: impl SchemaProvider + 'static) -> Self {
        self.schema = Box::new(provider);
        self
    }

    /// Publish committed batches and issue changes to `live`.
    pub fn broadcaster(mut self, live: LiveBroadcaster) -> Self {
        self.live = Some(live);
        self
    }

    /// Open the database and start the writer thread.
    pub fn build(self) -> Result<TelemetryStore, StorageError> {
        let conn = match &self.location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::Internal(format!(
                            "Failed to create database directory '{}': {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                Connection::open(path)?
            }
            StoreLocation::Memory => Connection::open_in_memory()?,
        };

        init_schema(&conn, self.schema.as_ref())?;

        // Readers share the writer's database instance, so every committed
        // write is visible without a second open of the file.
        let policy = self.location.read_policy();
        let pool = ReadPool::new(
            conn.try_clone()?,
            ReadPoolOptions {
                policy,
                max_concurrent_reads: self.max_concurrent_reads,
                idle_timeout: self.read_idle_timeout,
            },
        )?;

        let pipeline = WritePipeline::spawn(
            conn,
            WriterOptions {
                queue_capacity: self.queue_capacity,
                checkpoint_interval: (!self.location.is_memory())
                    .then_some(self.checkpoint_interval),
            },
        )?;

        tracing::info!(
            location = %self.location,
            read_policy = ?policy,
            queue_capacity = self.queue_capacity,
            max_concurrent_reads = pool.max_concurrent(),
            "Telemetry store opened"
        );

        Ok(TelemetryStore::from_parts(StoreParts {
            location: self.location,
            pipeline,
            pool,
            live: self.live,
            shutdown_grace: self.shutdown_grace,
        }))
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("location", &self.location)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_concurrent_reads", &self.max_concurrent_reads)
            .field("schema_version", &self.schema.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Span;
    use tempfile::tempdir;

    fn span(id: &str) -> Span {
        Span {
            span_id: id.to_string(),
            trace_id: "trace-1".to_string(),
            name: "op".to_string(),
            start_time_unix_nano: 10,
            end_time_unix_nano: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_location_from_path() {
        assert!(StoreLocation::from_path(":memory:").is_memory());
        assert!(StoreLocation::from_path("").is_memory());
        assert_eq!(
            StoreLocation::from_path("data/spans.duckdb").read_policy(),
            ReadPolicy::Pooled
        );
        assert_eq!(StoreLocation::Memory.read_policy(), ReadPolicy::Shared);
    }

    #[tokio::test]
    async fn test_build_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested/deeper/store.duckdb");
        let store = StoreBuilder::new(&db_path).build().unwrap();
        assert!(db_path.parent().unwrap().exists());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("reopen.duckdb");

        {
            let store = StoreBuilder::new(&db_path).build().unwrap();
            store.write_spans(vec![span("a"), span("b")]).await.unwrap();
            store.shutdown().await;
        }

        let store = StoreBuilder::new(&db_path).build().unwrap();
        assert_eq!(store.get_trace("trace-1").await.unwrap().len(), 2);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_store_reads_own_writes() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store.write_spans(vec![span("a")]).await.unwrap();
        assert_eq!(store.span_count().await.unwrap(), 1);
        store.shutdown().await;
    }
}
