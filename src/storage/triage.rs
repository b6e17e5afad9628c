//! Error triage: turn failing spans into deduplicated issues.
//!
//! Runs on the writer thread right after a span batch commits. Each error
//! span yields an [`ErrorEvent`] whose fingerprint is a stable hash of the
//! error type and normalized message. Events merge into the open issue with
//! the same fingerprint, or start a new one.

use std::sync::OnceLock;

use duckdb::{Connection, OptionalExt, params};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::storage::StorageError;
use crate::storage::types::{
    ErrorEvent, IssueEventType, IssueStatus, Span, StatusCode, now_unix_nanos,
};

// =============================================================================
// Constants
// =============================================================================

/// Cap on distinct services recorded per issue.
pub const MAX_AFFECTED_SERVICES: usize = 10;

/// Cap on sample trace ids kept per issue.
pub const MAX_SAMPLE_TRACES: usize = 10;

/// Messages are truncated to this many chars before hashing.
const MAX_FINGERPRINT_MESSAGE: usize = 512;

const SET_DELIMITER: char = ',';

// =============================================================================
// Extraction
// =============================================================================

/// Build one error event per failing span.
pub fn extract_error_events(spans: &[Span]) -> Vec<ErrorEvent> {
    spans.iter().filter_map(error_event_from_span).collect()
}

fn error_event_from_span(span: &Span) -> Option<ErrorEvent> {
    let exception_type = span
        .attribute_str("exception.type")
        .or_else(|| span.attribute_str("error.type"));
    if span.status_code != StatusCode::Error && exception_type.is_none() {
        return None;
    }

    let error_type = exception_type.unwrap_or("SpanError").to_string();
    let message = span
        .attribute_str("exception.message")
        .or(span.status_message.as_deref())
        .filter(|m| !m.is_empty())
        .unwrap_or(&span.name)
        .to_string();
    let category = categorize(
        &error_type,
        span.attribute_str("gen_ai.error.type"),
        span.gen_ai.stop_reason.as_deref(),
        &message,
    );

    Some(ErrorEvent {
        fingerprint: fingerprint(&error_type, &message),
        category: category.to_string(),
        error_type,
        message,
        service_name: span.service_name.clone(),
        trace_id: Some(span.trace_id.clone()).filter(|t| !t.is_empty()),
        timestamp_unix_nano: span.end_time_unix_nano.max(span.start_time_unix_nano),
    })
}

// =============================================================================
// Fingerprint
// =============================================================================

fn volatile_tokens() -> &'static Regex {
    static VOLATILE: OnceLock<Regex> = OnceLock::new();
    VOLATILE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            r"|0x[0-9a-f]+|\b[0-9a-f]{16,}\b|\d+",
        ))
        .expect("volatile token regex is valid")
    })
}

/// Strip ids, addresses and numbers so repeated occurrences hash alike.
pub fn normalize_message(message: &str) -> String {
    let replaced = volatile_tokens().replace_all(message, "#");
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_FINGERPRINT_MESSAGE).collect()
}

/// Stable signature hash: 32 hex chars of SHA-256 over type and normalized message.
pub fn fingerprint(error_type: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error_type.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_message(message).as_bytes());
    hasher.finalize()[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// =============================================================================
// Categorization
// =============================================================================

/// Coarse error category used for issue filtering.
///
/// A GenAI error type wins, then the finish reason, then message patterns,
/// then the exception type name.
pub fn categorize(
    error_type: &str,
    genai_error_type: Option<&str>,
    finish_reason: Option<&str>,
    message: &str,
) -> &'static str {
    if let Some(kind) = genai_error_type.filter(|k| !k.is_empty()) {
        return match kind {
            "rate_limit_exceeded" | "insufficient_quota" => "rate_limit",
            "context_length_exceeded" | "max_tokens_exceeded" => "token_limit",
            "authentication_error" => "auth",
            "model_overloaded" => "external",
            "timeout" => "timeout",
            "content_filter" | "content_policy_violation" => "content_filter",
            "hallucination_detected" | "model_not_found" | "model_not_available" => "model_error",
            "tool_execution_error" | "tool_not_found" | "tool_call_failed" => {
                "tool_execution_error"
            }
            _ => "unknown",
        };
    }

    if let Some(reason) = finish_reason {
        if reason.contains("content_filter") {
            return "content_filter";
        }
        if reason.contains("length") {
            return "token_limit";
        }
    }

    let msg = message.to_ascii_lowercase();
    if msg.contains("rate limit") || msg.contains("429") || msg.contains("too many requests") {
        return "rate_limit";
    }
    if msg.contains("content filter")
        || msg.contains("content management policy")
        || msg.contains("content_policy")
    {
        return "content_filter";
    }
    if msg.contains("maximum context length")
        || msg.contains("token limit")
        || msg.contains("max_tokens")
    {
        return "token_limit";
    }
    if msg.contains("tool") && (msg.contains("failed") || msg.contains("error")) {
        return "tool_execution_error";
    }

    let ty = error_type.to_ascii_lowercase();
    const RULES: &[(&str, &str)] = &[
        ("timeout", "timeout"),
        ("cancelled", "timeout"),
        ("canceled", "timeout"),
        ("httprequest", "network"),
        ("socket", "network"),
        ("connection", "network"),
        ("unauthorized", "auth"),
        ("authentication", "auth"),
        ("permission", "auth"),
        ("sql", "database"),
        ("duckdb", "database"),
        ("database", "database"),
        ("dbexception", "database"),
        ("argument", "validation"),
        ("valueerror", "validation"),
        ("validation", "validation"),
        ("format", "validation"),
        ("invalidoperation", "internal"),
        ("notsupported", "internal"),
        ("notimplemented", "internal"),
        ("nullreference", "internal"),
        ("panic", "internal"),
    ];
    RULES
        .iter()
        .find(|(needle, _)| ty.contains(needle))
        .map(|(_, category)| *category)
        .unwrap_or("unknown")
}

// =============================================================================
// Merging
// =============================================================================

pub(crate) fn decode_set(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(SET_DELIMITER)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

pub(crate) fn encode_set(items: &[String]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        Some(items.join(&SET_DELIMITER.to_string()))
    }
}

/// Add `service` to the set unless present or the set is full.
pub fn merge_service(services: &mut Vec<String>, service: Option<&str>) {
    let Some(service) = service.map(|s| s.replace(SET_DELIMITER, " ")) else {
        return;
    };
    let service = service.trim();
    if service.is_empty()
        || services.len() >= MAX_AFFECTED_SERVICES
        || services.iter().any(|s| s == service)
    {
        return;
    }
    services.push(service.to_string());
}

/// Append `trace_id` to the ring, evicting the oldest past the cap.
pub fn push_sample_trace(traces: &mut Vec<String>, trace_id: Option<&str>) {
    let Some(trace_id) = trace_id.filter(|t| !t.is_empty()) else {
        return;
    };
    if traces.iter().any(|t| t == trace_id) {
        return;
    }
    traces.push(trace_id.replace(SET_DELIMITER, ""));
    if traces.len() > MAX_SAMPLE_TRACES {
        let excess = traces.len() - MAX_SAMPLE_TRACES;
        traces.drain(..excess);
    }
}

/// Result of folding one event into the issue table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub issue_id: String,
    /// A new issue row was created.
    pub created: bool,
}

/// Fold `event` into the open issue sharing its fingerprint, or open a new one.
///
/// Must run on the writer connection; the read-then-write is safe because
/// nothing else writes concurrently.
pub(crate) fn upsert_error_event(
    conn: &Connection,
    event: &ErrorEvent,
) -> Result<UpsertOutcome, StorageError> {
    let existing = conn
        .prepare_cached(
            "SELECT error_id, first_seen, last_seen, occurrence_count,
                    affected_services, sample_traces
             FROM errors
             WHERE fingerprint = ? AND status <> 'resolved'
             ORDER BY created_at DESC
             LIMIT 1",
        )?
        .query_row([&event.fingerprint], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .optional()?;

    if let Some((issue_id, first_seen, last_seen, count, services, traces)) = existing {
        let mut services = decode_set(services);
        merge_service(&mut services, event.service_name.as_deref());
        let mut traces = decode_set(traces);
        push_sample_trace(&mut traces, event.trace_id.as_deref());

        conn.prepare_cached(
            "UPDATE errors
             SET occurrence_count = ?, first_seen = ?, last_seen = ?,
                 affected_services = ?, sample_traces = ?
             WHERE error_id = ?",
        )?
        .execute(params![
            count + 1,
            first_seen.min(event.timestamp_unix_nano),
            last_seen.max(event.timestamp_unix_nano),
            encode_set(&services),
            encode_set(&traces),
            issue_id,
        ])?;
        return Ok(UpsertOutcome {
            issue_id,
            created: false,
        });
    }

    let mut services = Vec::new();
    merge_service(&mut services, event.service_name.as_deref());
    let mut traces = Vec::new();
    push_sample_trace(&mut traces, event.trace_id.as_deref());
    let issue_id = uuid::Uuid::new_v4().simple().to_string();

    conn.prepare_cached(
        "INSERT INTO errors (error_id, error_type, message, category, fingerprint,
                             first_seen, last_seen, occurrence_count, affected_services,
                             status, sample_traces, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
    )?
    .execute(params![
        issue_id,
        event.error_type,
        event.message,
        event.category,
        event.fingerprint,
        event.timestamp_unix_nano,
        event.timestamp_unix_nano,
        encode_set(&services),
        IssueStatus::New.as_ref(),
        encode_set(&traces),
        now_unix_nanos(),
    ])?;

    Ok(UpsertOutcome {
        issue_id,
        created: true,
    })
}

/// Append an immutable lifecycle event.
pub(crate) fn record_issue_event(
    conn: &Connection,
    issue_id: &str,
    event_type: IssueEventType,
    old_value: Option<&str>,
    new_value: Option<&str>,
    reason: Option<&str>,
) -> Result<(), StorageError> {
    conn.prepare_cached(
        "INSERT INTO issue_events (event_id, issue_id, event_type, old_value, new_value,
                                   reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?
    .execute(params![
        uuid::Uuid::new_v4().simple().to_string(),
        issue_id,
        event_type.as_ref(),
        old_value,
        new_value,
        reason,
        now_unix_nanos(),
    ])?;
    Ok(())
}
