//! Database schema definitions.
//!
//! The store hard-codes column lists for its batch inserts; the DDL that
//! backs them comes from a [`SchemaProvider`]. [`BuiltinSchema`] is the
//! default provider and matches those column lists.

use duckdb::Connection;

use crate::storage::StorageError;

/// Source of the DDL applied once at startup.
///
/// Statements must be idempotent (`CREATE ... IF NOT EXISTS`).
pub trait SchemaProvider: Send + Sync {
    /// Version label logged at initialization.
    fn version(&self) -> &str;

    /// DDL statements in execution order.
    fn statements(&self) -> Vec<String>;
}

/// Spans table. `span_id` is the upsert key; columns refreshed on re-delivery
/// must stay out of every index.
pub const SPANS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS spans (
    span_id               VARCHAR PRIMARY KEY,
    trace_id              VARCHAR NOT NULL,
    parent_span_id        VARCHAR,
    session_id            VARCHAR,
    name                  VARCHAR NOT NULL,
    kind                  UTINYINT NOT NULL DEFAULT 0,
    start_time_unix_nano  UBIGINT NOT NULL,
    end_time_unix_nano    UBIGINT NOT NULL,
    duration_ns           UBIGINT NOT NULL,
    status_code           UTINYINT NOT NULL DEFAULT 0,
    status_message        VARCHAR,
    service_name          VARCHAR,
    gen_ai_system         VARCHAR,
    gen_ai_request_model  VARCHAR,
    gen_ai_response_model VARCHAR,
    gen_ai_input_tokens   BIGINT,
    gen_ai_output_tokens  BIGINT,
    gen_ai_temperature    DOUBLE,
    gen_ai_stop_reason    VARCHAR,
    gen_ai_tool_name      VARCHAR,
    gen_ai_tool_call_id   VARCHAR,
    gen_ai_cost_usd       DOUBLE,
    attributes_json       VARCHAR,
    resource_json         VARCHAR,
    baggage_json          VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans (trace_id);
CREATE INDEX IF NOT EXISTS idx_spans_session ON spans (session_id);
CREATE INDEX IF NOT EXISTS idx_spans_start ON spans (start_time_unix_nano);
"#;

pub const LOGS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS logs (
    log_id                  VARCHAR PRIMARY KEY,
    trace_id                VARCHAR,
    span_id                 VARCHAR,
    session_id              VARCHAR,
    time_unix_nano          UBIGINT NOT NULL,
    observed_time_unix_nano UBIGINT,
    severity_number         INTEGER NOT NULL DEFAULT 0,
    severity_text           VARCHAR,
    body                    VARCHAR,
    service_name            VARCHAR,
    attributes_json         VARCHAR,
    resource_json           VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_logs_time ON logs (time_unix_nano);
CREATE INDEX IF NOT EXISTS idx_logs_trace ON logs (trace_id);
"#;

/// Session rollups, rebuilt from `spans` for every session touched by a batch.
pub const SESSIONS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id          VARCHAR PRIMARY KEY,
    service_name        VARCHAR,
    first_span_time     UBIGINT NOT NULL,
    last_span_time      UBIGINT NOT NULL,
    span_count          BIGINT NOT NULL DEFAULT 0,
    error_count         BIGINT NOT NULL DEFAULT 0,
    total_input_tokens  BIGINT NOT NULL DEFAULT 0,
    total_output_tokens BIGINT NOT NULL DEFAULT 0,
    total_cost_usd      DOUBLE NOT NULL DEFAULT 0
);
"#;

/// Issues. `fingerprint` is not unique: a resolved issue and a fresh
/// occurrence of the same signature coexist until regression detection pairs them.
pub const ERRORS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS errors (
    error_id          VARCHAR PRIMARY KEY,
    error_type        VARCHAR NOT NULL,
    message           VARCHAR NOT NULL,
    category          VARCHAR NOT NULL,
    fingerprint       VARCHAR NOT NULL,
    first_seen        UBIGINT NOT NULL,
    last_seen         UBIGINT NOT NULL,
    occurrence_count  BIGINT NOT NULL DEFAULT 1,
    affected_services VARCHAR,
    status            VARCHAR NOT NULL DEFAULT 'new'
        CHECK (status IN ('new', 'acknowledged', 'resolved', 'regressed', 'reopened')),
    assigned_to       VARCHAR,
    sample_traces     VARCHAR,
    created_at        UBIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_errors_fingerprint ON errors (fingerprint);
"#;

pub const ISSUE_EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS issue_events (
    event_id   VARCHAR PRIMARY KEY,
    issue_id   VARCHAR NOT NULL,
    event_type VARCHAR NOT NULL,
    old_value  VARCHAR,
    new_value  VARCHAR,
    reason     VARCHAR,
    created_at UBIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_issue_events_issue ON issue_events (issue_id);
"#;

pub const AGENT_TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS agent_runs (
    run_id          VARCHAR PRIMARY KEY,
    trace_id        VARCHAR,
    parent_run_id   VARCHAR,
    agent_name      VARCHAR,
    agent_type      VARCHAR,
    model           VARCHAR,
    provider        VARCHAR,
    status          VARCHAR NOT NULL,
    input_tokens    BIGINT NOT NULL DEFAULT 0,
    output_tokens   BIGINT NOT NULL DEFAULT 0,
    total_cost      DOUBLE NOT NULL DEFAULT 0,
    tool_call_count BIGINT NOT NULL DEFAULT 0,
    start_time      UBIGINT NOT NULL,
    end_time        UBIGINT,
    duration_ns     UBIGINT,
    error_message   VARCHAR,
    metadata_json   VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_agent_runs_trace ON agent_runs (trace_id);

CREATE TABLE IF NOT EXISTS tool_calls (
    call_id         VARCHAR PRIMARY KEY,
    run_id          VARCHAR NOT NULL,
    trace_id        VARCHAR,
    span_id         VARCHAR,
    tool_name       VARCHAR NOT NULL,
    tool_type       VARCHAR,
    arguments_json  VARCHAR,
    result_json     VARCHAR,
    status          VARCHAR NOT NULL,
    start_time      UBIGINT NOT NULL,
    end_time        UBIGINT,
    duration_ns     UBIGINT,
    error_message   VARCHAR,
    sequence_number INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_calls_run ON tool_calls (run_id);
"#;

pub const WORKFLOW_TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_executions (
    execution_id         VARCHAR PRIMARY KEY,
    trace_id             VARCHAR,
    workflow_name        VARCHAR NOT NULL,
    trigger              VARCHAR,
    status               VARCHAR NOT NULL,
    input_json           VARCHAR,
    output_json          VARCHAR,
    gen_ai_input_tokens  BIGINT NOT NULL DEFAULT 0,
    gen_ai_output_tokens BIGINT NOT NULL DEFAULT 0,
    gen_ai_cost_usd      DOUBLE NOT NULL DEFAULT 0,
    node_count           INTEGER NOT NULL DEFAULT 0,
    completed_nodes      INTEGER NOT NULL DEFAULT 0,
    start_time_unix_nano UBIGINT NOT NULL,
    end_time_unix_nano   UBIGINT,
    duration_ns          UBIGINT,
    error_message        VARCHAR
);

CREATE TABLE IF NOT EXISTS workflow_checkpoints (
    checkpoint_id        VARCHAR PRIMARY KEY,
    execution_id         VARCHAR NOT NULL,
    node_id              VARCHAR NOT NULL,
    state_json           VARCHAR NOT NULL,
    sequence_number      BIGINT NOT NULL,
    created_at_unix_nano UBIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_execution ON workflow_checkpoints (execution_id);

CREATE TABLE IF NOT EXISTS workflow_events (
    event_id             VARCHAR PRIMARY KEY,
    execution_id         VARCHAR NOT NULL,
    node_id              VARCHAR,
    event_type           VARCHAR NOT NULL,
    payload_json         VARCHAR,
    sequence_number      BIGINT NOT NULL,
    created_at_unix_nano UBIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_events_execution ON workflow_events (execution_id);
"#;

pub const CONTROL_PLANE_TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS workspaces (
    workspace_id    VARCHAR PRIMARY KEY,
    name            VARCHAR NOT NULL,
    service_name    VARCHAR,
    sdk_version     VARCHAR,
    runtime_version VARCHAR,
    framework       VARCHAR,
    git_commit      VARCHAR,
    status          VARCHAR NOT NULL,
    first_seen      BIGINT NOT NULL,
    last_heartbeat  BIGINT NOT NULL,
    metadata_json   VARCHAR
);

CREATE TABLE IF NOT EXISTS projects (
    project_id   VARCHAR PRIMARY KEY,
    workspace_id VARCHAR NOT NULL,
    name         VARCHAR NOT NULL,
    description  VARCHAR,
    created_at   BIGINT NOT NULL,
    updated_at   BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS generation_jobs (
    job_id        VARCHAR PRIMARY KEY,
    workspace_id  VARCHAR NOT NULL,
    profile_id    VARCHAR,
    status        VARCHAR NOT NULL,
    output_url    VARCHAR,
    error_message VARCHAR,
    created_at    BIGINT NOT NULL,
    completed_at  BIGINT
);

CREATE TABLE IF NOT EXISTS schema_promotions (
    id               VARCHAR PRIMARY KEY,
    profile_id       VARCHAR,
    source_attribute VARCHAR NOT NULL,
    target_column    VARCHAR NOT NULL,
    target_type      VARCHAR NOT NULL,
    target_table     VARCHAR NOT NULL,
    status           VARCHAR NOT NULL,
    applied_at       BIGINT,
    created_at       BIGINT NOT NULL
);
"#;

/// Built-in DDL matching the store's column lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSchema;

impl SchemaProvider for BuiltinSchema {
    fn version(&self) -> &str {
        "1"
    }

    fn statements(&self) -> Vec<String> {
        [
            SPANS_TABLE_DDL,
            LOGS_TABLE_DDL,
            SESSIONS_TABLE_DDL,
            ERRORS_TABLE_DDL,
            ISSUE_EVENTS_TABLE_DDL,
            AGENT_TABLES_DDL,
            WORKFLOW_TABLES_DDL,
            CONTROL_PLANE_TABLES_DDL,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Apply every statement from `provider` on `conn`.
pub fn init_schema(conn: &Connection, provider: &dyn SchemaProvider) -> Result<(), StorageError> {
    for ddl in provider.statements() {
        conn.execute_batch(&ddl)?;
    }
    tracing::info!(version = provider.version(), "Database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    #[test]
    fn test_init_schema_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, &BuiltinSchema).unwrap();

        for table in [
            "spans",
            "logs",
            "sessions",
            "errors",
            "issue_events",
            "agent_runs",
            "tool_calls",
            "workflow_executions",
            "workflow_checkpoints",
            "workflow_events",
            "workspaces",
            "projects",
            "generation_jobs",
            "schema_promotions",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, &BuiltinSchema).unwrap();
        init_schema(&conn, &BuiltinSchema).unwrap();
    }

    #[test]
    fn test_custom_provider() {
        struct Minimal;
        impl SchemaProvider for Minimal {
            fn version(&self) -> &str {
                "test"
            }
            fn statements(&self) -> Vec<String> {
                vec!["CREATE TABLE IF NOT EXISTS probe (id INTEGER)".to_string()]
            }
        }

        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, &Minimal).unwrap();
        assert!(table_exists(&conn, "probe"));
        assert!(!table_exists(&conn, "spans"));
    }

    #[test]
    fn test_errors_status_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, &BuiltinSchema).unwrap();
        let result = conn.execute(
            "INSERT INTO errors (error_id, error_type, message, category, fingerprint,
                                 first_seen, last_seen, status, created_at)
             VALUES ('e1', 'T', 'm', 'unknown', 'f', 1, 1, 'closed', 1)",
            [],
        );
        assert!(result.is_err());
    }
}
