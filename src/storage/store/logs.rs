//! Log ingestion and queries. Logs are immutable: duplicates are ignored.

use std::collections::HashSet;

use duckdb::{Connection, ToSql};
use serde_json::json;

use crate::live::{LiveBroadcaster, LiveKind, LiveMessage};
use crate::storage::StorageError;
use crate::storage::batch::{BatchInsert, OnConflict};
use crate::storage::store::{Statements, TelemetryStore, effective_limit, escape_like};
use crate::storage::types::{LogRecord, decode_attributes, encode_attributes};

const LOG_COLUMNS: &[&str] = &[
    "log_id",
    "trace_id",
    "span_id",
    "session_id",
    "time_unix_nano",
    "observed_time_unix_nano",
    "severity_number",
    "severity_text",
    "body",
    "service_name",
    "attributes_json",
    "resource_json",
];

pub(crate) fn log_insert() -> BatchInsert {
    BatchInsert::new("logs", LOG_COLUMNS, OnConflict::Nothing { key: &["log_id"] })
}

struct LogRow<'a> {
    log: &'a LogRecord,
    attributes: Option<String>,
    resource: Option<String>,
}

impl<'a> LogRow<'a> {
    fn new(log: &'a LogRecord) -> Result<Self, StorageError> {
        Ok(Self {
            log,
            attributes: encode_attributes(&log.attributes)?,
            resource: encode_attributes(&log.resource)?,
        })
    }

    fn bind<'r>(&'r self, params: &mut Vec<&'r dyn ToSql>) {
        let l = self.log;
        params.push(&l.log_id);
        params.push(&l.trace_id);
        params.push(&l.span_id);
        params.push(&l.session_id);
        params.push(&l.time_unix_nano);
        params.push(&l.observed_time_unix_nano);
        params.push(&l.severity_number);
        params.push(&l.severity_text);
        params.push(&l.body);
        params.push(&l.service_name);
        params.push(&self.attributes);
        params.push(&self.resource);
    }
}

/// Insert a log batch in one transaction. First delivery of a `log_id` wins.
pub(crate) fn write_log_batch(
    conn: &mut Connection,
    statements: &Statements,
    live: Option<&LiveBroadcaster>,
    mut logs: Vec<LogRecord>,
) -> Result<usize, StorageError> {
    let mut seen = HashSet::with_capacity(logs.len());
    logs.retain(|l| seen.insert(l.log_id.clone()));
    if logs.is_empty() {
        return Ok(0);
    }

    let rows = logs.iter().map(LogRow::new).collect::<Result<Vec<_>, _>>()?;
    let tx = conn.transaction()?;
    let inserted = statements
        .logs
        .execute_chunked(&tx, &rows, |row, params| row.bind(params))?;
    tx.commit()?;

    if let Some(live) = live {
        live.publish(LiveMessage::new(LiveKind::Logs, json!({ "logs": logs })));
    }
    Ok(inserted)
}

/// Filters for [`TelemetryStore::query_logs`]. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    /// Exact match, case-insensitive.
    pub severity_text: Option<String>,
    pub min_severity: Option<i32>,
    /// Substring match on the body.
    pub search: Option<String>,
    /// Inclusive lower bound on `time_unix_nano`.
    pub after: Option<u64>,
    /// Exclusive upper bound on `time_unix_nano`.
    pub before: Option<u64>,
    pub limit: Option<u32>,
}

impl TelemetryStore {
    /// Queue a log batch without waiting. Never blocks.
    pub fn insert_logs(&self, logs: Vec<LogRecord>) -> Result<(), StorageError> {
        if logs.is_empty() {
            return self.ensure_open();
        }
        let statements = self.statements();
        let live = self.live();
        self.write_detached("logs", logs.len(), move |conn| {
            write_log_batch(conn, &statements, live.as_ref(), logs).map(|_| ())
        })
    }

    /// Write a log batch and wait for the commit. Returns rows inserted.
    pub async fn write_logs(&self, logs: Vec<LogRecord>) -> Result<usize, StorageError> {
        let statements = self.statements();
        let live = self.live();
        self.write("logs", move |conn| {
            write_log_batch(conn, &statements, live.as_ref(), logs)
        })
        .await
    }

    pub async fn query_logs(&self, q: LogQuery) -> Result<Vec<LogRecord>, StorageError> {
        self.read(move |conn| {
            let limit = effective_limit(q.limit);
            let mut sql = String::from(
                "SELECT log_id, trace_id, span_id, session_id, time_unix_nano,
                        observed_time_unix_nano, severity_number, severity_text, body,
                        service_name, attributes_json, resource_json
                 FROM logs WHERE 1 = 1",
            );
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(session_id) = q.session_id {
                sql.push_str(" AND session_id = ?");
                params.push(Box::new(session_id));
            }
            if let Some(trace_id) = q.trace_id {
                sql.push_str(" AND trace_id = ?");
                params.push(Box::new(trace_id));
            }
            if let Some(text) = q.severity_text {
                sql.push_str(" AND upper(severity_text) = upper(?)");
                params.push(Box::new(text));
            }
            if let Some(min) = q.min_severity {
                sql.push_str(" AND severity_number >= ?");
                params.push(Box::new(min));
            }
            if let Some(search) = q.search.filter(|s| !s.is_empty()) {
                sql.push_str(" AND body ILIKE ? ESCAPE '\\'");
                params.push(Box::new(format!("%{}%", escape_like(&search))));
            }
            if let Some(after) = q.after {
                sql.push_str(" AND time_unix_nano >= ?");
                params.push(Box::new(after));
            }
            if let Some(before) = q.before {
                sql.push_str(" AND time_unix_nano < ?");
                params.push(Box::new(before));
            }
            sql.push_str(&format!(" ORDER BY time_unix_nano DESC LIMIT {limit}"));

            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(refs.as_slice(), |row| {
                Ok((
                    LogRecord {
                        log_id: row.get(0)?,
                        trace_id: row.get(1)?,
                        span_id: row.get(2)?,
                        session_id: row.get(3)?,
                        time_unix_nano: row.get(4)?,
                        observed_time_unix_nano: row.get(5)?,
                        severity_number: row.get(6)?,
                        severity_text: row.get(7)?,
                        body: row.get(8)?,
                        service_name: row.get(9)?,
                        ..Default::default()
                    },
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                ))
            })?;

            let mut logs = Vec::new();
            for row in rows {
                let (mut log, attributes, resource) = row?;
                log.attributes = decode_attributes(attributes)?;
                log.resource = decode_attributes(resource)?;
                logs.push(log);
            }
            Ok(logs)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;

    fn log(id: &str, time: u64, severity: i32, body: &str) -> LogRecord {
        LogRecord {
            log_id: id.to_string(),
            trace_id: Some("t1".to_string()),
            time_unix_nano: time,
            severity_number: severity,
            severity_text: Some(if severity >= 17 { "ERROR" } else { "INFO" }.to_string()),
            body: Some(body.to_string()),
            service_name: Some("api".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_log_ids_are_ignored() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let inserted = store
            .write_logs(vec![log("a", 1, 9, "first"), log("a", 2, 9, "second")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        store.write_logs(vec![log("a", 3, 9, "third")]).await.unwrap();
        let logs = store.query_logs(LogQuery::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].body.as_deref(), Some("first"));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_logs_filters_newest_first() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store
            .write_logs(vec![
                log("a", 10, 9, "request ok"),
                log("b", 20, 17, "request failed"),
                log("c", 30, 17, "db failed"),
            ])
            .await
            .unwrap();

        let errors = store
            .query_logs(LogQuery {
                severity_text: Some("error".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            errors.iter().map(|l| l.log_id.as_str()).collect::<Vec<_>>(),
            vec!["c", "b"]
        );

        let search = store
            .query_logs(LogQuery {
                search: Some("request".into()),
                min_severity: Some(17),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(search.len(), 1);
        assert_eq!(search[0].log_id, "b");

        let limited = store
            .query_logs(LogQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited[0].log_id, "c");
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_insert_logs_is_fire_and_forget() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store.insert_logs(vec![log("a", 1, 9, "x")]).unwrap();
        // An awaited job queued later observes the earlier one.
        store.write_logs(Vec::new()).await.unwrap();
        assert_eq!(store.log_count().await.unwrap(), 1);
        store.shutdown().await;
    }
}
