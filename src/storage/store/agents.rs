//! Agent runs and their tool calls.

use std::str::FromStr;

use duckdb::{OptionalExt, Row, params};

use crate::storage::StorageError;
use crate::storage::store::{TelemetryStore, effective_limit};
use crate::storage::types::{
    AgentRun, RunStatus, ToolCall, decode_attributes, decode_json, encode_attributes, encode_json,
};

const RUN_SELECT: &str = "SELECT run_id, trace_id, parent_run_id, agent_name, agent_type, model,
        provider, status, input_tokens, output_tokens, total_cost, tool_call_count, start_time,
        end_time, duration_ns, error_message, metadata_json
    FROM agent_runs";

fn parse_run_status(raw: &str) -> Result<RunStatus, StorageError> {
    RunStatus::from_str(raw)
        .map_err(|_| StorageError::InvalidData(format!("unknown run status '{raw}'")))
}

fn row_to_run(row: &Row<'_>) -> duckdb::Result<(AgentRun, String, Option<String>)> {
    let run = AgentRun {
        run_id: row.get(0)?,
        trace_id: row.get(1)?,
        parent_run_id: row.get(2)?,
        agent_name: row.get(3)?,
        agent_type: row.get(4)?,
        model: row.get(5)?,
        provider: row.get(6)?,
        input_tokens: row.get(8)?,
        output_tokens: row.get(9)?,
        total_cost: row.get(10)?,
        tool_call_count: row.get(11)?,
        start_time: row.get(12)?,
        end_time: row.get(13)?,
        duration_ns: row.get(14)?,
        error_message: row.get(15)?,
        ..Default::default()
    };
    Ok((run, row.get(7)?, row.get(16)?))
}

fn finish_run(
    (mut run, status, metadata): (AgentRun, String, Option<String>),
) -> Result<AgentRun, StorageError> {
    run.status = parse_run_status(&status)?;
    run.metadata = decode_attributes(metadata)?;
    Ok(run)
}

fn collect_runs(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<AgentRun>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_run)?;
    let mut runs = Vec::new();
    for row in rows {
        runs.push(finish_run(row?)?);
    }
    Ok(runs)
}

impl TelemetryStore {
    /// Insert or replace an agent run.
    pub async fn insert_agent_run(&self, run: AgentRun) -> Result<(), StorageError> {
        let metadata = encode_attributes(&run.metadata)?;
        self.write("insert_agent_run", move |conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO agent_runs (run_id, trace_id, parent_run_id, agent_name,
                        agent_type, model, provider, status, input_tokens, output_tokens,
                        total_cost, tool_call_count, start_time, end_time, duration_ns,
                        error_message, metadata_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                run.run_id,
                run.trace_id,
                run.parent_run_id,
                run.agent_name,
                run.agent_type,
                run.model,
                run.provider,
                run.status.as_ref(),
                run.input_tokens,
                run.output_tokens,
                run.total_cost,
                run.tool_call_count,
                run.start_time,
                run.end_time,
                run.duration_ns,
                run.error_message,
                metadata,
            ])?;
            Ok(())
        })
        .await
    }

    /// Finish a run: final status, totals, end time and derived duration.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_agent_run(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: u64,
        input_tokens: i64,
        output_tokens: i64,
        total_cost: f64,
        error_message: Option<String>,
    ) -> Result<(), StorageError> {
        let run_id = run_id.to_string();
        self.write("complete_agent_run", move |conn| {
            let updated = conn
                .prepare_cached(
                    "UPDATE agent_runs
                     SET status = ?, end_time = ?,
                         duration_ns = CASE WHEN ? >= start_time THEN ? - start_time ELSE 0 END,
                         input_tokens = ?, output_tokens = ?, total_cost = ?, error_message = ?,
                         tool_call_count = (SELECT COUNT(*) FROM tool_calls WHERE run_id = ?)
                     WHERE run_id = ?",
                )?
                .execute(params![
                    status.as_ref(),
                    end_time,
                    end_time,
                    end_time,
                    input_tokens,
                    output_tokens,
                    total_cost,
                    error_message,
                    run_id,
                    run_id,
                ])?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("agent run {run_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_agent_run(&self, run_id: &str) -> Result<Option<AgentRun>, StorageError> {
        let run_id = run_id.to_string();
        self.read(move |conn| {
            conn.prepare(&format!("{RUN_SELECT} WHERE run_id = ?"))?
                .query_row([&run_id], row_to_run)
                .optional()?
                .map(finish_run)
                .transpose()
        })
        .await
    }

    /// Most recent runs first, optionally filtered by agent name.
    pub async fn list_agent_runs(
        &self,
        agent_name: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<AgentRun>, StorageError> {
        let agent_name = agent_name.map(str::to_string);
        let limit = effective_limit(limit);
        self.read(move |conn| match agent_name {
            Some(name) => collect_runs(
                conn,
                &format!(
                    "{RUN_SELECT} WHERE agent_name = ? ORDER BY start_time DESC LIMIT {limit}"
                ),
                &[&name],
            ),
            None => collect_runs(
                conn,
                &format!("{RUN_SELECT} ORDER BY start_time DESC LIMIT {limit}"),
                &[],
            ),
        })
        .await
    }

    pub async fn get_agent_runs_by_trace(
        &self,
        trace_id: &str,
    ) -> Result<Vec<AgentRun>, StorageError> {
        let trace_id = trace_id.to_string();
        self.read(move |conn| {
            collect_runs(
                conn,
                &format!("{RUN_SELECT} WHERE trace_id = ? ORDER BY start_time ASC"),
                &[&trace_id],
            )
        })
        .await
    }

    /// Insert or replace a tool call. The parent run must exist.
    pub async fn insert_tool_call(&self, call: ToolCall) -> Result<(), StorageError> {
        let arguments = encode_json(&call.arguments)?;
        let result = encode_json(&call.result)?;
        self.write("insert_tool_call", move |conn| {
            let parent: Option<i64> = conn
                .prepare_cached("SELECT 1 FROM agent_runs WHERE run_id = ?")?
                .query_row([&call.run_id], |row| row.get(0))
                .optional()?;
            if parent.is_none() {
                return Err(StorageError::NotFound(format!("agent run {}", call.run_id)));
            }
            conn.prepare_cached(
                "INSERT OR REPLACE INTO tool_calls (call_id, run_id, trace_id, span_id, tool_name,
                        tool_type, arguments_json, result_json, status, start_time, end_time,
                        duration_ns, error_message, sequence_number)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                call.call_id,
                call.run_id,
                call.trace_id,
                call.span_id,
                call.tool_name,
                call.tool_type,
                arguments,
                result,
                call.status.as_ref(),
                call.start_time,
                call.end_time,
                call.duration_ns,
                call.error_message,
                call.sequence_number,
            ])?;
            Ok(())
        })
        .await
    }

    /// Tool calls of a run in `sequence_number` order.
    pub async fn get_tool_calls(&self, run_id: &str) -> Result<Vec<ToolCall>, StorageError> {
        let run_id = run_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT call_id, run_id, trace_id, span_id, tool_name, tool_type, arguments_json,
                        result_json, status, start_time, end_time, duration_ns, error_message,
                        sequence_number
                 FROM tool_calls
                 WHERE run_id = ?
                 ORDER BY sequence_number ASC",
            )?;
            let rows = stmt.query_map([&run_id], |row| {
                Ok((
                    ToolCall {
                        call_id: row.get(0)?,
                        run_id: row.get(1)?,
                        trace_id: row.get(2)?,
                        span_id: row.get(3)?,
                        tool_name: row.get(4)?,
                        tool_type: row.get(5)?,
                        start_time: row.get(9)?,
                        end_time: row.get(10)?,
                        duration_ns: row.get(11)?,
                        error_message: row.get(12)?,
                        sequence_number: row.get(13)?,
                        ..Default::default()
                    },
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?;

            let mut calls = Vec::new();
            for row in rows {
                let (mut call, arguments, result, status) = row?;
                call.arguments = decode_json(arguments)?;
                call.result = decode_json(result)?;
                call.status = parse_run_status(&status)?;
                calls.push(call);
            }
            Ok(calls)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;
    use serde_json::json;

    fn run(id: &str, start: u64) -> AgentRun {
        AgentRun {
            run_id: id.to_string(),
            trace_id: Some("t1".to_string()),
            agent_name: Some("planner".to_string()),
            model: Some("gpt-4o".to_string()),
            start_time: start,
            ..Default::default()
        }
    }

    fn call(id: &str, run_id: &str, seq: i32) -> ToolCall {
        ToolCall {
            call_id: id.to_string(),
            run_id: run_id.to_string(),
            tool_name: "search".to_string(),
            arguments: Some(json!({ "q": id })),
            sequence_number: seq,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let mut r = run("r1", 1_000);
        r.metadata.insert("tenant".into(), json!("acme"));
        store.insert_agent_run(r).await.unwrap();
        store.insert_tool_call(call("c1", "r1", 0)).await.unwrap();

        store
            .complete_agent_run("r1", RunStatus::Completed, 4_000, 10, 20, 0.25, None)
            .await
            .unwrap();

        let stored = store.get_agent_run("r1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.duration_ns, Some(3_000));
        assert_eq!(stored.tool_call_count, 1);
        assert_eq!(stored.metadata.get("tenant"), Some(&json!("acme")));

        let missing = store
            .complete_agent_run("nope", RunStatus::Failed, 1, 0, 0, 0.0, None)
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_tool_calls_ordered_by_sequence() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store.insert_agent_run(run("r1", 1)).await.unwrap();
        for (id, seq) in [("c", 2), ("a", 0), ("b", 1)] {
            store.insert_tool_call(call(id, "r1", seq)).await.unwrap();
        }

        let calls = store.get_tool_calls("r1").await.unwrap();
        let ids: Vec<&str> = calls.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(calls[0].arguments, Some(json!({ "q": "a" })));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_tool_call_requires_parent_run() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let orphan = store.insert_tool_call(call("c1", "missing", 0)).await;
        assert!(matches!(orphan, Err(StorageError::NotFound(_))));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_and_trace_queries() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store.insert_agent_run(run("r1", 10)).await.unwrap();
        store.insert_agent_run(run("r2", 20)).await.unwrap();
        let mut other = run("r3", 30);
        other.agent_name = Some("critic".into());
        other.trace_id = Some("t2".into());
        store.insert_agent_run(other).await.unwrap();

        let planners = store.list_agent_runs(Some("planner"), None).await.unwrap();
        assert_eq!(
            planners.iter().map(|r| r.run_id.as_str()).collect::<Vec<_>>(),
            vec!["r2", "r1"]
        );
        assert_eq!(store.list_agent_runs(None, Some(1)).await.unwrap()[0].run_id, "r3");
        assert_eq!(store.get_agent_runs_by_trace("t1").await.unwrap().len(), 2);
        store.shutdown().await;
    }
}
