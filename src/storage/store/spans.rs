//! Span ingestion and trace/session reads.
//!
//! A span batch is one write job: dedupe by `span_id`, upsert in chunked
//! multi-row statements, rebuild the touched session rollups, all in one
//! transaction. Error extraction and live publishing follow the commit on
//! the writer thread.

use std::collections::{BTreeSet, HashMap};

use duckdb::{Connection, Row, ToSql, Transaction};
use serde_json::json;

use crate::live::{LiveBroadcaster, LiveKind, LiveMessage};
use crate::storage::StorageError;
use crate::storage::batch::{BatchInsert, OnConflict};
use crate::storage::store::{Statements, TelemetryStore, effective_limit, escape_like};
use crate::storage::triage;
use crate::storage::types::{
    GenAiFields, SessionSummary, Span, SpanKind, StatusCode, decode_attributes, encode_attributes,
};

// =============================================================================
// Columns
// =============================================================================

const SPAN_COLUMNS: &[&str] = &[
    "span_id",
    "trace_id",
    "parent_span_id",
    "session_id",
    "name",
    "kind",
    "start_time_unix_nano",
    "end_time_unix_nano",
    "duration_ns",
    "status_code",
    "status_message",
    "service_name",
    "gen_ai_system",
    "gen_ai_request_model",
    "gen_ai_response_model",
    "gen_ai_input_tokens",
    "gen_ai_output_tokens",
    "gen_ai_temperature",
    "gen_ai_stop_reason",
    "gen_ai_tool_name",
    "gen_ai_tool_call_id",
    "gen_ai_cost_usd",
    "attributes_json",
    "resource_json",
    "baggage_json",
];

/// Refreshed on re-delivery. None of these may be indexed.
const SPAN_MUTABLE_COLUMNS: &[&str] = &[
    "end_time_unix_nano",
    "duration_ns",
    "status_code",
    "status_message",
    "gen_ai_input_tokens",
    "gen_ai_output_tokens",
    "gen_ai_stop_reason",
    "gen_ai_cost_usd",
    "attributes_json",
    "resource_json",
    "baggage_json",
];

const SPAN_SELECT: &str = "SELECT span_id, trace_id, parent_span_id, session_id, name, kind,
        start_time_unix_nano, end_time_unix_nano, status_code, status_message, service_name,
        gen_ai_system, gen_ai_request_model, gen_ai_response_model, gen_ai_input_tokens,
        gen_ai_output_tokens, gen_ai_temperature, gen_ai_stop_reason, gen_ai_tool_name,
        gen_ai_tool_call_id, gen_ai_cost_usd, attributes_json, resource_json, baggage_json
    FROM spans";

pub(crate) fn span_insert() -> BatchInsert {
    BatchInsert::new(
        "spans",
        SPAN_COLUMNS,
        OnConflict::Update {
            key: &["span_id"],
            columns: SPAN_MUTABLE_COLUMNS,
        },
    )
}

/// A span with its derived and encoded column values.
struct SpanRow<'a> {
    span: &'a Span,
    kind: u8,
    duration_ns: u64,
    status_code: u8,
    attributes: Option<String>,
    resource: Option<String>,
    baggage: Option<String>,
}

impl<'a> SpanRow<'a> {
    fn new(span: &'a Span) -> Result<Self, StorageError> {
        Ok(Self {
            span,
            kind: span.kind.code(),
            duration_ns: span.duration_ns(),
            status_code: span.status_code.code(),
            attributes: encode_attributes(&span.attributes)?,
            resource: encode_attributes(&span.resource)?,
            baggage: encode_attributes(&span.baggage)?,
        })
    }

    fn bind<'r>(&'r self, params: &mut Vec<&'r dyn ToSql>) {
        let s = self.span;
        let g = &s.gen_ai;
        params.push(&s.span_id);
        params.push(&s.trace_id);
        params.push(&s.parent_span_id);
        params.push(&s.session_id);
        params.push(&s.name);
        params.push(&self.kind);
        params.push(&s.start_time_unix_nano);
        params.push(&s.end_time_unix_nano);
        params.push(&self.duration_ns);
        params.push(&self.status_code);
        params.push(&s.status_message);
        params.push(&s.service_name);
        params.push(&g.provider);
        params.push(&g.request_model);
        params.push(&g.response_model);
        params.push(&g.input_tokens);
        params.push(&g.output_tokens);
        params.push(&g.temperature);
        params.push(&g.stop_reason);
        params.push(&g.tool_name);
        params.push(&g.tool_call_id);
        params.push(&g.cost_usd);
        params.push(&self.attributes);
        params.push(&self.resource);
        params.push(&self.baggage);
    }
}

fn row_to_span(row: &Row<'_>) -> duckdb::Result<(Span, [Option<String>; 3])> {
    let span = Span {
        span_id: row.get(0)?,
        trace_id: row.get(1)?,
        parent_span_id: row.get(2)?,
        session_id: row.get(3)?,
        name: row.get(4)?,
        kind: SpanKind::from_code(row.get(5)?),
        start_time_unix_nano: row.get(6)?,
        end_time_unix_nano: row.get(7)?,
        status_code: StatusCode::from_code(row.get(8)?),
        status_message: row.get(9)?,
        service_name: row.get(10)?,
        gen_ai: GenAiFields {
            provider: row.get(11)?,
            request_model: row.get(12)?,
            response_model: row.get(13)?,
            input_tokens: row.get(14)?,
            output_tokens: row.get(15)?,
            temperature: row.get(16)?,
            stop_reason: row.get(17)?,
            tool_name: row.get(18)?,
            tool_call_id: row.get(19)?,
            cost_usd: row.get(20)?,
        },
        ..Default::default()
    };
    Ok((span, [row.get(21)?, row.get(22)?, row.get(23)?]))
}

fn collect_spans(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<Span>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_span)?;
    let mut spans = Vec::new();
    for row in rows {
        let (mut span, [attributes, resource, baggage]) = row?;
        span.attributes = decode_attributes(attributes)?;
        span.resource = decode_attributes(resource)?;
        span.baggage = decode_attributes(baggage)?;
        spans.push(span);
    }
    Ok(spans)
}

// =============================================================================
// Batch job
// =============================================================================

/// Last delivery of each `span_id` wins; first-seen order is kept.
///
/// A statement may not touch the same key twice, so duplicates inside one
/// batch are folded before chunking.
fn dedupe_spans(spans: Vec<Span>) -> Vec<Span> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(spans.len());
    let mut unique: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match index.get(&span.span_id) {
            Some(&i) => unique[i] = span,
            None => {
                index.insert(span.span_id.clone(), unique.len());
                unique.push(span);
            }
        }
    }
    unique
}

fn refresh_session(tx: &Transaction<'_>, session_id: &str) -> Result<(), StorageError> {
    tx.prepare_cached(
        "INSERT OR REPLACE INTO sessions (session_id, service_name, first_span_time, last_span_time,
                                          span_count, error_count, total_input_tokens,
                                          total_output_tokens, total_cost_usd)
         SELECT session_id,
                MIN(service_name),
                MIN(start_time_unix_nano),
                MAX(end_time_unix_nano),
                COUNT(*),
                COUNT(*) FILTER (WHERE status_code = 2),
                CAST(COALESCE(SUM(gen_ai_input_tokens), 0) AS BIGINT),
                CAST(COALESCE(SUM(gen_ai_output_tokens), 0) AS BIGINT),
                COALESCE(SUM(gen_ai_cost_usd), 0)
         FROM spans
         WHERE session_id = ?
         GROUP BY session_id",
    )?
    .execute([session_id])?;
    Ok(())
}

/// Upsert a span batch and fold its failures into issues.
///
/// Returns the number of distinct spans written.
pub(crate) fn write_span_batch(
    conn: &mut Connection,
    statements: &Statements,
    live: Option<&LiveBroadcaster>,
    spans: Vec<Span>,
) -> Result<usize, StorageError> {
    let spans = dedupe_spans(spans);
    if spans.is_empty() {
        return Ok(0);
    }

    let rows = spans.iter().map(SpanRow::new).collect::<Result<Vec<_>, _>>()?;
    let sessions: BTreeSet<&str> = spans.iter().filter_map(|s| s.session_id.as_deref()).collect();

    let tx = conn.transaction()?;
    statements
        .spans
        .execute_chunked(&tx, &rows, |row, params| row.bind(params))?;
    for session_id in &sessions {
        refresh_session(&tx, session_id)?;
    }
    tx.commit()?;

    // The spans are committed; a triage failure must not fail the batch.
    let issue_ids = match record_span_errors(conn, &spans) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, spans = spans.len(), "Inline error extraction failed");
            Vec::new()
        }
    };

    let written = spans.len();
    if let Some(live) = live {
        live.publish(LiveMessage::new(LiveKind::Spans, json!({ "spans": spans })));
        if !issue_ids.is_empty() {
            live.publish(LiveMessage::new(
                LiveKind::Issues,
                json!({ "issue_ids": issue_ids }),
            ));
        }
    }
    Ok(written)
}

fn record_span_errors(conn: &mut Connection, spans: &[Span]) -> Result<Vec<String>, StorageError> {
    let events = triage::extract_error_events(spans);
    if events.is_empty() {
        return Ok(Vec::new());
    }
    let tx = conn.transaction()?;
    let mut issue_ids = Vec::with_capacity(events.len());
    for event in &events {
        let outcome = triage::upsert_error_event(&tx, event)?;
        if !issue_ids.contains(&outcome.issue_id) {
            issue_ids.push(outcome.issue_id);
        }
    }
    tx.commit()?;
    tracing::debug!(errors = events.len(), issues = issue_ids.len(), "Span errors recorded");
    Ok(issue_ids)
}

// =============================================================================
// Queries
// =============================================================================

/// Filters for [`TelemetryStore::query_spans`]. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct SpanQuery {
    pub session_id: Option<String>,
    pub service_name: Option<String>,
    /// GenAI provider (`gen_ai_system`).
    pub provider: Option<String>,
    /// Inclusive lower bound on start time.
    pub start_after: Option<u64>,
    /// Exclusive upper bound on start time.
    pub start_before: Option<u64>,
    pub status_code: Option<StatusCode>,
    /// Substring match on the span name.
    pub search: Option<String>,
    pub limit: Option<u32>,
}

impl TelemetryStore {
    /// Queue a span batch without waiting. Never blocks.
    ///
    /// Under saturation the oldest pending job is evicted; see
    /// [`counters`](Self::counters).
    pub fn insert_spans(&self, spans: Vec<Span>) -> Result<(), StorageError> {
        if spans.is_empty() {
            return self.ensure_open();
        }
        let statements = self.statements();
        let live = self.live();
        self.write_detached("spans", spans.len(), move |conn| {
            write_span_batch(conn, &statements, live.as_ref(), spans).map(|_| ())
        })
    }

    /// Write a span batch and wait for the commit.
    pub async fn write_spans(&self, spans: Vec<Span>) -> Result<usize, StorageError> {
        let statements = self.statements();
        let live = self.live();
        self.write("spans", move |conn| {
            write_span_batch(conn, &statements, live.as_ref(), spans)
        })
        .await
    }

    /// All spans of a trace, by start time.
    pub async fn get_trace(&self, trace_id: &str) -> Result<Vec<Span>, StorageError> {
        let trace_id = trace_id.to_string();
        self.read(move |conn| {
            let sql = format!("{SPAN_SELECT} WHERE trace_id = ? ORDER BY start_time_unix_nano ASC");
            collect_spans(conn, &sql, &[&trace_id])
        })
        .await
    }

    /// All spans of a session, by start time.
    pub async fn get_spans_by_session(&self, session_id: &str) -> Result<Vec<Span>, StorageError> {
        let session_id = session_id.to_string();
        self.read(move |conn| {
            let sql =
                format!("{SPAN_SELECT} WHERE session_id = ? ORDER BY start_time_unix_nano ASC");
            collect_spans(conn, &sql, &[&session_id])
        })
        .await
    }

    /// Filtered span listing, newest first.
    pub async fn query_spans(&self, q: SpanQuery) -> Result<Vec<Span>, StorageError> {
        self.read(move |conn| {
            let limit = effective_limit(q.limit);
            let mut sql = format!("{SPAN_SELECT} WHERE 1 = 1");
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(session_id) = q.session_id {
                sql.push_str(" AND session_id = ?");
                params.push(Box::new(session_id));
            }
            if let Some(service) = q.service_name {
                sql.push_str(" AND service_name = ?");
                params.push(Box::new(service));
            }
            if let Some(provider) = q.provider {
                sql.push_str(" AND gen_ai_system = ?");
                params.push(Box::new(provider));
            }
            if let Some(after) = q.start_after {
                sql.push_str(" AND start_time_unix_nano >= ?");
                params.push(Box::new(after));
            }
            if let Some(before) = q.start_before {
                sql.push_str(" AND start_time_unix_nano < ?");
                params.push(Box::new(before));
            }
            if let Some(status) = q.status_code {
                sql.push_str(" AND status_code = ?");
                params.push(Box::new(status.code()));
            }
            if let Some(search) = q.search.filter(|s| !s.is_empty()) {
                sql.push_str(" AND name ILIKE ? ESCAPE '\\'");
                params.push(Box::new(format!("%{}%", escape_like(&search))));
            }
            sql.push_str(&format!(" ORDER BY start_time_unix_nano DESC LIMIT {limit}"));

            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            collect_spans(conn, &sql, &refs)
        })
        .await
    }

    /// Session rollups, most recently active first.
    pub async fn get_sessions(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<SessionSummary>, StorageError> {
        let limit = effective_limit(limit);
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT session_id, service_name, first_span_time, last_span_time, span_count,
                        error_count, total_input_tokens, total_output_tokens, total_cost_usd
                 FROM sessions
                 ORDER BY last_span_time DESC
                 LIMIT {limit}"
            ))?;
            let sessions = stmt
                .query_map([], |row| {
                    Ok(SessionSummary {
                        session_id: row.get(0)?,
                        service_name: row.get(1)?,
                        first_span_time: row.get(2)?,
                        last_span_time: row.get(3)?,
                        span_count: row.get(4)?,
                        error_count: row.get(5)?,
                        total_input_tokens: row.get(6)?,
                        total_output_tokens: row.get(7)?,
                        total_cost_usd: row.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
        .await
    }
}
