//! Workflow executions plus their append-only checkpoints and events.

use std::str::FromStr;

use duckdb::{OptionalExt, Row, params};

use crate::storage::StorageError;
use crate::storage::store::{TelemetryStore, effective_limit};
use crate::storage::types::{
    WorkflowCheckpoint, WorkflowEvent, WorkflowExecution, WorkflowStatus, decode_json, encode_json,
    now_unix_nanos,
};

const EXECUTION_SELECT: &str = "SELECT execution_id, trace_id, workflow_name, trigger, status,
        input_json, output_json, gen_ai_input_tokens, gen_ai_output_tokens, gen_ai_cost_usd,
        node_count, completed_nodes, start_time_unix_nano, end_time_unix_nano, duration_ns,
        error_message
    FROM workflow_executions";

type RawExecution = (WorkflowExecution, String, Option<String>, Option<String>);

fn row_to_execution(row: &Row<'_>) -> duckdb::Result<RawExecution> {
    let execution = WorkflowExecution {
        execution_id: row.get(0)?,
        trace_id: row.get(1)?,
        workflow_name: row.get(2)?,
        trigger: row.get(3)?,
        input_tokens: row.get(7)?,
        output_tokens: row.get(8)?,
        cost_usd: row.get(9)?,
        node_count: row.get(10)?,
        completed_nodes: row.get(11)?,
        start_time_unix_nano: row.get(12)?,
        end_time_unix_nano: row.get(13)?,
        duration_ns: row.get(14)?,
        error_message: row.get(15)?,
        ..Default::default()
    };
    Ok((execution, row.get(4)?, row.get(5)?, row.get(6)?))
}

fn finish_execution(
    (mut execution, status, input, output): RawExecution,
) -> Result<WorkflowExecution, StorageError> {
    execution.status = WorkflowStatus::from_str(&status)
        .map_err(|_| StorageError::InvalidData(format!("unknown workflow status '{status}'")))?;
    execution.input = decode_json(input)?;
    execution.output = decode_json(output)?;
    Ok(execution)
}

impl TelemetryStore {
    /// Insert or replace a workflow execution.
    pub async fn insert_workflow_execution(
        &self,
        execution: WorkflowExecution,
    ) -> Result<(), StorageError> {
        let input = encode_json(&execution.input)?;
        let output = encode_json(&execution.output)?;
        self.write("insert_workflow_execution", move |conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO workflow_executions (execution_id, trace_id, workflow_name,
                        trigger, status, input_json, output_json, gen_ai_input_tokens,
                        gen_ai_output_tokens, gen_ai_cost_usd, node_count, completed_nodes,
                        start_time_unix_nano, end_time_unix_nano, duration_ns, error_message)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                execution.execution_id,
                execution.trace_id,
                execution.workflow_name,
                execution.trigger,
                execution.status.as_ref(),
                input,
                output,
                execution.input_tokens,
                execution.output_tokens,
                execution.cost_usd,
                execution.node_count,
                execution.completed_nodes,
                execution.start_time_unix_nano,
                execution.end_time_unix_nano,
                execution.duration_ns,
                execution.error_message,
            ])?;
            Ok(())
        })
        .await
    }

    /// Refresh the progress fields of an existing execution.
    ///
    /// Identity fields (name, trigger, trace, input, start time) are left untouched.
    pub async fn update_workflow_execution(
        &self,
        execution: WorkflowExecution,
    ) -> Result<(), StorageError> {
        let output = encode_json(&execution.output)?;
        self.write("update_workflow_execution", move |conn| {
            let updated = conn
                .prepare_cached(
                    "UPDATE workflow_executions
                     SET status = ?, output_json = ?, gen_ai_input_tokens = ?,
                         gen_ai_output_tokens = ?, gen_ai_cost_usd = ?, node_count = ?,
                         completed_nodes = ?, end_time_unix_nano = ?, duration_ns = ?,
                         error_message = ?
                     WHERE execution_id = ?",
                )?
                .execute(params![
                    execution.status.as_ref(),
                    output,
                    execution.input_tokens,
                    execution.output_tokens,
                    execution.cost_usd,
                    execution.node_count,
                    execution.completed_nodes,
                    execution.end_time_unix_nano,
                    execution.duration_ns,
                    execution.error_message,
                    execution.execution_id,
                ])?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!(
                    "workflow execution {}",
                    execution.execution_id
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_workflow_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, StorageError> {
        let execution_id = execution_id.to_string();
        self.read(move |conn| {
            conn.prepare(&format!("{EXECUTION_SELECT} WHERE execution_id = ?"))?
                .query_row([&execution_id], row_to_execution)
                .optional()?
                .map(finish_execution)
                .transpose()
        })
        .await
    }

    /// Newest executions first, optionally filtered by status.
    pub async fn list_workflow_executions(
        &self,
        status: Option<WorkflowStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowExecution>, StorageError> {
        let limit = effective_limit(limit);
        self.read(move |conn| {
            let (sql, status) = match status {
                Some(s) => (
                    format!(
                        "{EXECUTION_SELECT} WHERE status = ?
                         ORDER BY start_time_unix_nano DESC LIMIT {limit}"
                    ),
                    Some(s.as_ref().to_string()),
                ),
                None => (
                    format!("{EXECUTION_SELECT} ORDER BY start_time_unix_nano DESC LIMIT {limit}"),
                    None,
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let raw = match &status {
                Some(s) => stmt
                    .query_map([s], row_to_execution)?
                    .collect::<duckdb::Result<Vec<_>>>()?,
                None => stmt
                    .query_map([], row_to_execution)?
                    .collect::<duckdb::Result<Vec<_>>>()?,
            };
            raw.into_iter().map(finish_execution).collect()
        })
        .await
    }

    /// Cancel a pending or running execution.
    ///
    /// Returns `false` when the execution already reached a terminal state.
    pub async fn cancel_workflow_execution(
        &self,
        execution_id: &str,
    ) -> Result<bool, StorageError> {
        let execution_id = execution_id.to_string();
        self.write("cancel_workflow_execution", move |conn| {
            let now = now_unix_nanos();
            let updated = conn
                .prepare_cached(
                    "UPDATE workflow_executions
                     SET status = 'cancelled', end_time_unix_nano = ?,
                         duration_ns = CASE WHEN ? >= start_time_unix_nano
                                            THEN ? - start_time_unix_nano ELSE 0 END
                     WHERE execution_id = ? AND status IN ('pending', 'running')",
                )?
                .execute(params![now, now, now, execution_id])?;
            if updated > 0 {
                tracing::info!(execution_id = %execution_id, "Workflow execution cancelled");
                return Ok(true);
            }

            let exists: Option<i64> = conn
                .prepare_cached("SELECT 1 FROM workflow_executions WHERE execution_id = ?")?
                .query_row([&execution_id], |row| row.get(0))
                .optional()?;
            match exists {
                Some(_) => Ok(false),
                None => Err(StorageError::NotFound(format!(
                    "workflow execution {execution_id}"
                ))),
            }
        })
        .await
    }

    /// Append a checkpoint. Returns `false` if the id was already recorded.
    pub async fn insert_checkpoint(
        &self,
        checkpoint: WorkflowCheckpoint,
    ) -> Result<bool, StorageError> {
        let state = serde_json::to_string(&checkpoint.state)?;
        self.write("insert_checkpoint", move |conn| {
            let inserted = conn
                .prepare_cached(
                    "INSERT INTO workflow_checkpoints (checkpoint_id, execution_id, node_id,
                            state_json, sequence_number, created_at_unix_nano)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT (checkpoint_id) DO NOTHING",
                )?
                .execute(params![
                    checkpoint.checkpoint_id,
                    checkpoint.execution_id,
                    checkpoint.node_id,
                    state,
                    checkpoint.sequence_number,
                    checkpoint.created_at_unix_nano,
                ])?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn get_checkpoints(
        &self,
        execution_id: &str,
    ) -> Result<Vec<WorkflowCheckpoint>, StorageError> {
        let execution_id = execution_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT checkpoint_id, execution_id, node_id, state_json, sequence_number,
                        created_at_unix_nano
                 FROM workflow_checkpoints
                 WHERE execution_id = ?
                 ORDER BY sequence_number ASC",
            )?;
            let rows = stmt.query_map([&execution_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, u64>(5)?,
                ))
            })?;

            let mut checkpoints = Vec::new();
            for row in rows {
                let (checkpoint_id, execution_id, node_id, state, sequence_number, created_at) =
                    row?;
                checkpoints.push(WorkflowCheckpoint {
                    checkpoint_id,
                    execution_id,
                    node_id,
                    state: serde_json::from_str(&state)?,
                    sequence_number,
                    created_at_unix_nano: created_at,
                });
            }
            Ok(checkpoints)
        })
        .await
    }

    /// Append an event. Returns `false` if the id was already recorded.
    pub async fn insert_workflow_event(&self, event: WorkflowEvent) -> Result<bool, StorageError> {
        let payload = encode_json(&event.payload)?;
        self.write("insert_workflow_event", move |conn| {
            let inserted = conn
                .prepare_cached(
                    "INSERT INTO workflow_events (event_id, execution_id, node_id, event_type,
                            payload_json, sequence_number, created_at_unix_nano)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT (event_id) DO NOTHING",
                )?
                .execute(params![
                    event.event_id,
                    event.execution_id,
                    event.node_id,
                    event.event_type,
                    payload,
                    event.sequence_number,
                    event.created_at_unix_nano,
                ])?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn get_workflow_events(
        &self,
        execution_id: &str,
    ) -> Result<Vec<WorkflowEvent>, StorageError> {
        let execution_id = execution_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, execution_id, node_id, event_type, payload_json,
                        sequence_number, created_at_unix_nano
                 FROM workflow_events
                 WHERE execution_id = ?
                 ORDER BY sequence_number ASC",
            )?;
            let rows = stmt.query_map([&execution_id], |row| {
                Ok((
                    WorkflowEvent {
                        event_id: row.get(0)?,
                        execution_id: row.get(1)?,
                        node_id: row.get(2)?,
                        event_type: row.get(3)?,
                        payload: None,
                        sequence_number: row.get(5)?,
                        created_at_unix_nano: row.get(6)?,
                    },
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (mut event, payload) = row?;
                event.payload = decode_json(payload)?;
                events.push(event);
            }
            Ok(events)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;
    use serde_json::json;

    fn execution(id: &str, status: WorkflowStatus, start: u64) -> WorkflowExecution {
        WorkflowExecution {
            execution_id: id.to_string(),
            workflow_name: "ingest".to_string(),
            status,
            input: Some(json!({ "doc": id })),
            node_count: 3,
            start_time_unix_nano: start,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_execution_update_keeps_identity() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store
            .insert_workflow_execution(execution("w1", WorkflowStatus::Running, 100))
            .await
            .unwrap();

        let mut progress = execution("w1", WorkflowStatus::Completed, 0);
        progress.workflow_name = "renamed".into();
        progress.completed_nodes = 3;
        progress.output = Some(json!({ "ok": true }));
        progress.end_time_unix_nano = Some(400);
        progress.duration_ns = Some(300);
        store.update_workflow_execution(progress).await.unwrap();

        let stored = store.get_workflow_execution("w1").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        assert_eq!(stored.workflow_name, "ingest");
        assert_eq!(stored.start_time_unix_nano, 100);
        assert_eq!(stored.completed_nodes, 3);
        assert_eq!(stored.output, Some(json!({ "ok": true })));
        assert_eq!(stored.input, Some(json!({ "doc": "w1" })));

        let missing = store
            .update_workflow_execution(execution("nope", WorkflowStatus::Failed, 0))
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_only_pending_or_running() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store
            .insert_workflow_execution(execution("run", WorkflowStatus::Running, 1))
            .await
            .unwrap();
        store
            .insert_workflow_execution(execution("done", WorkflowStatus::Completed, 2))
            .await
            .unwrap();

        assert!(store.cancel_workflow_execution("run").await.unwrap());
        assert!(!store.cancel_workflow_execution("done").await.unwrap());
        assert!(matches!(
            store.cancel_workflow_execution("ghost").await,
            Err(StorageError::NotFound(_))
        ));

        let cancelled = store.get_workflow_execution("run").await.unwrap().unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
        assert!(cancelled.end_time_unix_nano.is_some());

        let completed = store
            .list_workflow_executions(Some(WorkflowStatus::Completed), None)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].execution_id, "done");
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoints_and_events_are_append_only() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let checkpoint = |id: &str, seq: i64, value: i64| WorkflowCheckpoint {
            checkpoint_id: id.to_string(),
            execution_id: "w1".to_string(),
            node_id: "n1".to_string(),
            state: json!({ "v": value }),
            sequence_number: seq,
            created_at_unix_nano: 10,
        };

        assert!(store.insert_checkpoint(checkpoint("c2", 2, 2)).await.unwrap());
        assert!(store.insert_checkpoint(checkpoint("c1", 1, 1)).await.unwrap());
        assert!(!store.insert_checkpoint(checkpoint("c1", 1, 99)).await.unwrap());

        let checkpoints = store.get_checkpoints("w1").await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].checkpoint_id, "c1");
        assert_eq!(checkpoints[0].state, json!({ "v": 1 }));

        let event = WorkflowEvent {
            event_id: "e1".to_string(),
            execution_id: "w1".to_string(),
            node_id: None,
            event_type: "node_started".to_string(),
            payload: Some(json!({ "node": "n1" })),
            sequence_number: 1,
            created_at_unix_nano: 10,
        };
        assert!(store.insert_workflow_event(event.clone()).await.unwrap());
        assert!(!store.insert_workflow_event(event.clone()).await.unwrap());
        assert_eq!(store.get_workflow_events("w1").await.unwrap(), vec![event]);
        store.shutdown().await;
    }
}
