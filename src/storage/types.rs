//! Core data types for the storage layer.
//!
//! This module defines the records persisted by the store:
//!
//! - [`Span`] / [`LogRecord`]: Raw telemetry, keyed by `span_id` / `log_id`
//! - [`SessionSummary`]: Per-session rollup maintained on every span batch
//! - [`ErrorEvent`] / [`Issue`] / [`IssueEvent`]: Error deduplication and issue lifecycle
//! - [`AgentRun`] / [`ToolCall`]: Agent execution records
//! - [`WorkflowExecution`] / [`WorkflowCheckpoint`] / [`WorkflowEvent`]: Workflow records
//! - [`Workspace`] / [`Project`] / [`GenerationJob`] / [`SchemaPromotion`]: Control-plane records
//!
//! Telemetry timestamps are unsigned Unix nanoseconds. Control-plane timestamps
//! are Unix milliseconds.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::StorageError;

/// Free-form JSON attributes (span attributes, resource, baggage, metadata).
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Current time as Unix nanoseconds.
pub fn now_unix_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or_default()
}

/// Unix nanoseconds `age` before now, clamped at the epoch.
///
/// Ages beyond the `u64` nanosecond range saturate instead of wrapping.
pub fn unix_nanos_ago(age: std::time::Duration) -> u64 {
    let age = u64::try_from(age.as_nanos()).unwrap_or(u64::MAX);
    now_unix_nanos().saturating_sub(age)
}

/// Current time as Unix milliseconds.
pub fn now_unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serialize attributes for storage; empty maps are stored as NULL.
pub(crate) fn encode_attributes(attrs: &Attributes) -> Result<Option<String>, StorageError> {
    if attrs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(attrs)?))
    }
}

pub(crate) fn decode_attributes(raw: Option<String>) -> Result<Attributes, StorageError> {
    match raw {
        Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
        _ => Ok(Attributes::new()),
    }
}

pub(crate) fn encode_json(
    value: &Option<serde_json::Value>,
) -> Result<Option<String>, StorageError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)
}

pub(crate) fn decode_json(raw: Option<String>) -> Result<Option<serde_json::Value>, StorageError> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StorageError::from)
}

// =============================================================================
// Spans
// =============================================================================

/// OpenTelemetry span kind.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    /// Stored representation (OTLP enum value).
    pub fn code(self) -> u8 {
        match self {
            SpanKind::Unspecified => 0,
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }
}

/// OpenTelemetry span status code.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub fn code(self) -> u8 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => StatusCode::Ok,
            2 => StatusCode::Error,
            _ => StatusCode::Unset,
        }
    }
}

/// GenAI semantic-convention fields promoted out of span attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenAiFields {
    /// Provider (`gen_ai.system` / `gen_ai.provider.name`).
    pub provider: Option<String>,
    pub request_model: Option<String>,
    pub response_model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub stop_reason: Option<String>,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub cost_usd: Option<f64>,
}

/// A span stored in the `spans` table.
///
/// `span_id` is globally unique. Re-delivering a span with the same id only
/// refreshes its mutable fields (end time, duration, status, tokens, cost,
/// attributes, resource, baggage); identity fields keep their first values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub session_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub status_code: StatusCode,
    pub status_message: Option<String>,
    pub service_name: Option<String>,
    #[serde(default)]
    pub gen_ai: GenAiFields,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub resource: Attributes,
    #[serde(default)]
    pub baggage: Attributes,
}

impl Span {
    /// Span duration; zero when the end precedes the start.
    pub fn duration_ns(&self) -> u64 {
        self.end_time_unix_nano
            .saturating_sub(self.start_time_unix_nano)
    }

    /// String attribute lookup.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Per-session rollup stored in the `sessions` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub service_name: Option<String>,
    pub first_span_time: u64,
    pub last_span_time: u64,
    pub span_count: i64,
    pub error_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost_usd: f64,
}

// =============================================================================
// Logs
// =============================================================================

/// A log record stored in the `logs` table. Immutable once written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_id: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub session_id: Option<String>,
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: Option<u64>,
    /// OTLP severity number (1-24).
    pub severity_number: i32,
    pub severity_text: Option<String>,
    pub body: Option<String>,
    pub service_name: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub resource: Attributes,
}

// =============================================================================
// Errors & Issues
// =============================================================================

/// One observed error occurrence, the input to issue deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    pub category: String,
    /// Stable hash of the error signature; the deduplication key.
    pub fingerprint: String,
    pub service_name: Option<String>,
    pub trace_id: Option<String>,
    pub timestamp_unix_nano: u64,
}

/// Issue lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum IssueStatus {
    New,
    Acknowledged,
    Resolved,
    Regressed,
    Reopened,
}

impl IssueStatus {
    /// Whether a caller-requested transition from `self` to `to` is allowed.
    ///
    /// `Regressed` is only reachable through regression detection, never manually.
    pub fn allows(self, to: IssueStatus) -> bool {
        use IssueStatus::*;
        matches!(
            (self, to),
            (New, Acknowledged)
                | (New, Resolved)
                | (Acknowledged, Resolved)
                | (Resolved, Reopened)
                | (Regressed, Acknowledged)
                | (Regressed, Resolved)
                | (Reopened, Acknowledged)
                | (Reopened, Resolved)
        )
    }

    /// Open issues absorb new occurrences of their fingerprint.
    pub fn is_open(self) -> bool {
        self != IssueStatus::Resolved
    }
}

/// An issue: all occurrences sharing one fingerprint while it stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    pub error_type: String,
    pub message: String,
    pub category: String,
    pub fingerprint: String,
    pub first_seen: u64,
    /// Never decreases across merges.
    pub last_seen: u64,
    pub occurrence_count: i64,
    pub affected_services: Vec<String>,
    pub status: IssueStatus,
    pub assigned_to: Option<String>,
    /// Most recent distinct trace ids, oldest first.
    pub sample_traces: Vec<String>,
    pub created_at: u64,
}

/// Kind of an immutable issue lifecycle event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum IssueEventType {
    StatusChange,
    Assigned,
    Regression,
}

/// Row of the `issue_events` timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEvent {
    pub event_id: String,
    pub issue_id: String,
    pub event_type: IssueEventType,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub reason: Option<String>,
    pub created_at: u64,
}

// =============================================================================
// Agents
// =============================================================================

/// Status shared by agent runs and tool calls.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: String,
    pub trace_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub agent_name: Option<String>,
    pub agent_type: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub status: RunStatus,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub tool_call_count: i64,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub duration_ns: Option<u64>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Attributes,
}

/// A tool invocation inside an agent run, ordered by `sequence_number`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    /// Parent run; always set.
    pub run_id: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub tool_name: String,
    pub tool_type: Option<String>,
    pub arguments: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub status: RunStatus,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub duration_ns: Option<u64>,
    pub error_message: Option<String>,
    pub sequence_number: i32,
}

// =============================================================================
// Workflows
// =============================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub trace_id: Option<String>,
    pub workflow_name: String,
    pub trigger: Option<String>,
    pub status: WorkflowStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub node_count: i32,
    pub completed_nodes: i32,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: Option<u64>,
    pub duration_ns: Option<u64>,
    pub error_message: Option<String>,
}

/// Append-only workflow state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub checkpoint_id: String,
    pub execution_id: String,
    pub node_id: String,
    pub state: serde_json::Value,
    pub sequence_number: i64,
    pub created_at_unix_nano: u64,
}

/// Append-only workflow event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: String,
    pub execution_id: String,
    pub node_id: Option<String>,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
    pub sequence_number: i64,
    pub created_at_unix_nano: u64,
}

// =============================================================================
// Control plane
// =============================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WorkspaceStatus {
    #[default]
    Active,
    Inactive,
}

/// An instrumented application reporting to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub name: String,
    pub service_name: Option<String>,
    pub sdk_version: Option<String>,
    pub runtime_version: Option<String>,
    pub framework: Option<String>,
    pub git_commit: Option<String>,
    pub status: WorkspaceStatus,
    pub first_seen: i64,
    pub last_heartbeat: i64,
    #[serde(default)]
    pub metadata: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub workspace_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Instrumentation code generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: String,
    pub workspace_id: String,
    pub profile_id: Option<String>,
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PromotionStatus {
    #[default]
    Pending,
    Applied,
    Rejected,
    Failed,
}

/// Request to promote a span attribute into a dedicated column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaPromotion {
    pub id: String,
    pub profile_id: Option<String>,
    pub source_attribute: String,
    pub target_column: String,
    pub target_type: String,
    pub target_table: String,
    pub status: PromotionStatus,
    pub applied_at: Option<i64>,
    pub created_at: i64,
}

// =============================================================================
// Statistics & search
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub span_count: i64,
    pub log_count: i64,
    pub session_count: i64,
    pub issue_count: i64,
    pub oldest_span_time: Option<u64>,
    pub newest_span_time: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenAiStats {
    pub request_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost_usd: f64,
    pub avg_cost_usd: Option<f64>,
}

/// Rows removed by a telemetry wipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearTelemetryResult {
    pub spans: usize,
    pub logs: usize,
    pub sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSuggestion {
    pub text: String,
    /// Source table (`spans`, `agent_runs`, `workflows`, `errors`).
    pub entity_type: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    #[test]
    fn test_unix_nanos_ago_saturates() {
        assert_eq!(unix_nanos_ago(Duration::MAX), 0);
        assert_eq!(unix_nanos_ago(Duration::from_secs(585 * 365 * 86_400)), 0);
        let recent = unix_nanos_ago(Duration::from_secs(60));
        assert!(recent > 0 && recent < now_unix_nanos());
    }

    #[test]
    fn test_issue_status_from_str_case_insensitive() {
        assert_eq!(IssueStatus::from_str("NEW").unwrap(), IssueStatus::New);
        assert_eq!(
            IssueStatus::from_str("Regressed").unwrap(),
            IssueStatus::Regressed
        );
        assert!(IssueStatus::from_str("closed").is_err());
    }

    #[test]
    fn test_issue_status_manual_transitions() {
        use IssueStatus::*;
        assert!(New.allows(Acknowledged));
        assert!(Acknowledged.allows(Resolved));
        assert!(Resolved.allows(Reopened));
        assert!(Regressed.allows(Acknowledged));
        assert!(Reopened.allows(Resolved));

        // Regressed is reserved for regression detection.
        assert!(!Resolved.allows(Regressed));
        assert!(!New.allows(Regressed));
        assert!(!Resolved.allows(New));
        assert!(!Acknowledged.allows(New));
        assert!(!New.allows(New));
    }

    #[test]
    fn test_issue_event_type_snake_case() {
        assert_eq!(IssueEventType::StatusChange.as_ref(), "status_change");
        assert_eq!(
            IssueEventType::from_str("regression").unwrap(),
            IssueEventType::Regression
        );
    }

    #[test]
    fn test_span_kind_and_status_codes() {
        for kind in [
            SpanKind::Unspecified,
            SpanKind::Internal,
            SpanKind::Server,
            SpanKind::Client,
            SpanKind::Producer,
            SpanKind::Consumer,
        ] {
            assert_eq!(SpanKind::from_code(kind.code()), kind);
        }
        assert_eq!(StatusCode::from_code(2), StatusCode::Error);
        assert_eq!(StatusCode::from_code(99), StatusCode::Unset);
    }

    #[test]
    fn test_span_duration_saturates() {
        let span = Span {
            start_time_unix_nano: 200,
            end_time_unix_nano: 100,
            ..Default::default()
        };
        assert_eq!(span.duration_ns(), 0);
    }

    #[test]
    fn test_attributes_encoding() {
        assert_eq!(encode_attributes(&Attributes::new()).unwrap(), None);
        let mut attrs = Attributes::new();
        attrs.insert("k".into(), serde_json::json!("v"));
        let raw = encode_attributes(&attrs).unwrap();
        assert_eq!(decode_attributes(raw).unwrap(), attrs);
        assert!(decode_attributes(None).unwrap().is_empty());
    }
}
