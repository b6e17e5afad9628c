//! Spanvault - Embedded Telemetry Store
//!
//! Storage and concurrency engine for an AI-observability backend. Spans,
//! logs, agent runs, workflow executions and derived issues land in a single
//! embedded DuckDB database.
//!
//! # Architecture
//!
//! - **Storage**: Serialized write pipeline, pooled concurrent reads, batch
//!   insert compiler, error triage and issue lifecycle
//! - **Live**: Bounded per-subscriber fan-out of committed batches
//! - **Retention**: Periodic age/count cleanup with optional Parquet archival
//! - **Config**: YAML configuration for the `spanvault` binary
//!
//! # Example
//!
//! ```rust,no_run
//! use spanvault::storage::{Span, StoreBuilder};
//!
//! # async fn run() -> Result<(), spanvault::StorageError> {
//! let store = StoreBuilder::new("data/spanvault.duckdb").build()?;
//! store.insert_spans(vec![Span {
//!     span_id: "b7ad6b7169203331".into(),
//!     trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
//!     name: "chat gpt-4o".into(),
//!     ..Default::default()
//! }])?;
//! let trace = store.get_trace("0af7651916cd43dd8448eb211c80319c").await?;
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod live;
pub mod retention;
pub mod storage;

pub use live::{LiveBroadcaster, LiveKind, LiveMessage, LiveSubscription};
pub use retention::{CleanupReport, RetentionHandle, RetentionPolicy, RetentionService};
pub use storage::{StorageError, StoreBuilder, TelemetryStore};
