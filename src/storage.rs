//! Storage Layer
//!
//! Embedded DuckDB store with strict read/write separation:
//! - **Writer**: One dedicated thread owns the only writable connection and runs
//!   jobs in FIFO order from a bounded, drop-oldest queue
//! - **Readers**: A semaphore-gated pool of connections cloned from the same
//!   database instance
//!
//! # Components
//!
//! - [`TelemetryStore`]: Facade for every operation (spans, logs, issues, agents,
//!   workflows, control plane, search, maintenance)
//! - [`StoreBuilder`]: Opens the database and wires pipeline and pool
//! - [`WritePipeline`](pipeline::WritePipeline) / [`ReadPool`](pool::ReadPool):
//!   Concurrency primitives
//! - [`BatchInsert`](batch::BatchInsert): Multi-row insert compiler with a per-size statement cache
//! - [`SchemaProvider`]: Source of the startup DDL

pub mod batch;
mod builder;
mod error;
pub mod pipeline;
pub mod pool;
pub mod schema;
mod store;
pub mod triage;
pub mod types;

pub use builder::{DEFAULT_CHECKPOINT_INTERVAL, MEMORY_PATH, StoreBuilder, StoreLocation};
pub use error::StorageError;
pub use pipeline::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_GRACE, PipelineCounters};
pub use pool::{DEFAULT_MAX_CONCURRENT_READS, DEFAULT_READ_IDLE_TIMEOUT, ReadPolicy};
pub use schema::{BuiltinSchema, SchemaProvider};
pub use store::{
    ArchiveResult, IssueQuery, LogQuery, SpanQuery, TelemetryStore, validate_archive_dir,
};
pub use types::{
    AgentRun, Attributes, ClearTelemetryResult, ErrorEvent, GenAiFields, GenAiStats,
    GenerationJob, Issue, IssueEvent, IssueEventType, IssueStatus, JobStatus, LogRecord, Project,
    PromotionStatus, RunStatus, SchemaPromotion, SearchSuggestion, SessionSummary, Span, SpanKind,
    StatusCode, StorageStats, ToolCall, WorkflowCheckpoint, WorkflowEvent, WorkflowExecution,
    WorkflowStatus, Workspace, WorkspaceStatus, now_unix_millis, now_unix_nanos, unix_nanos_ago,
};
