//! Issue tracking: error upserts, lifecycle transitions, ownership, regressions.
//!
//! Every mutation that reads state before writing runs as one write job in
//! one transaction, so the single writer makes the read-then-write atomic.

use std::str::FromStr;

use duckdb::{Connection, OptionalExt, Row, ToSql, params};
use serde_json::json;

use crate::live::{LiveKind, LiveMessage};
use crate::storage::StorageError;
use crate::storage::store::{TelemetryStore, effective_limit, in_transaction};
use crate::storage::triage::{self, decode_set, record_issue_event};
use crate::storage::types::{ErrorEvent, Issue, IssueEvent, IssueEventType, IssueStatus};

const ISSUE_SELECT: &str = "SELECT error_id, error_type, message, category, fingerprint, first_seen,
        last_seen, occurrence_count, affected_services, status, assigned_to, sample_traces,
        created_at
    FROM errors";

fn parse_status(raw: &str) -> Result<IssueStatus, StorageError> {
    IssueStatus::from_str(raw)
        .map_err(|_| StorageError::InvalidData(format!("unknown issue status '{raw}'")))
}

type IssueRow = (Issue, String, Option<String>, Option<String>);

fn row_to_issue(row: &Row<'_>) -> duckdb::Result<IssueRow> {
    let issue = Issue {
        issue_id: row.get(0)?,
        error_type: row.get(1)?,
        message: row.get(2)?,
        category: row.get(3)?,
        fingerprint: row.get(4)?,
        first_seen: row.get(5)?,
        last_seen: row.get(6)?,
        occurrence_count: row.get(7)?,
        affected_services: Vec::new(),
        status: IssueStatus::New,
        assigned_to: row.get(10)?,
        sample_traces: Vec::new(),
        created_at: row.get(12)?,
    };
    Ok((issue, row.get(9)?, row.get(8)?, row.get(11)?))
}

fn finish_issue((mut issue, status, services, traces): IssueRow) -> Result<Issue, StorageError> {
    issue.status = parse_status(&status)?;
    issue.affected_services = decode_set(services);
    issue.sample_traces = decode_set(traces);
    Ok(issue)
}

fn current_status(conn: &Connection, issue_id: &str) -> Result<IssueStatus, StorageError> {
    let raw: Option<String> = conn
        .prepare_cached("SELECT status FROM errors WHERE error_id = ?")?
        .query_row([issue_id], |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => parse_status(&raw),
        None => Err(StorageError::NotFound(format!("issue {issue_id}"))),
    }
}

/// Filters for [`TelemetryStore::list_issues`]. Results are most recently seen first.
#[derive(Debug, Clone, Default)]
pub struct IssueQuery {
    pub status: Option<IssueStatus>,
    pub owner: Option<String>,
    pub category: Option<String>,
    pub limit: Option<u32>,
}

impl TelemetryStore {
    /// Fold one error occurrence into its issue. Returns the issue id.
    pub async fn upsert_error(&self, event: ErrorEvent) -> Result<String, StorageError> {
        let outcome = self
            .write("upsert_error", move |conn| {
                in_transaction(conn, |tx| triage::upsert_error_event(tx, &event))
            })
            .await?;
        self.publish(LiveMessage::new(
            LiveKind::Issues,
            json!({ "issue_ids": [outcome.issue_id], "created": outcome.created }),
        ));
        Ok(outcome.issue_id)
    }

    /// Move an issue to `status`, recording the transition.
    ///
    /// Fails with [`StorageError::InvalidTransition`] for transitions the
    /// lifecycle does not allow, including any manual move to `regressed`.
    pub async fn update_issue_status(
        &self,
        issue_id: &str,
        status: IssueStatus,
        reason: Option<&str>,
    ) -> Result<(), StorageError> {
        let issue_id = issue_id.to_string();
        let reason = reason.map(str::to_string);
        let id = issue_id.clone();
        self.write("update_issue_status", move |conn| {
            in_transaction(conn, |tx| {
                let from = current_status(tx, &issue_id)?;
                if !from.allows(status) {
                    return Err(StorageError::InvalidTransition { from, to: status });
                }
                tx.prepare_cached("UPDATE errors SET status = ? WHERE error_id = ?")?
                    .execute(params![status.as_ref(), issue_id])?;
                record_issue_event(
                    tx,
                    &issue_id,
                    IssueEventType::StatusChange,
                    Some(from.as_ref()),
                    Some(status.as_ref()),
                    reason.as_deref(),
                )
            })
        })
        .await?;
        tracing::info!(issue_id = %id, status = %status, "Issue status updated");
        self.publish(LiveMessage::new(
            LiveKind::Issues,
            json!({ "issue_ids": [id], "status": status }),
        ));
        Ok(())
    }

    /// Set or clear the owner, recording the change.
    pub async fn assign_issue_owner(
        &self,
        issue_id: &str,
        owner: Option<&str>,
    ) -> Result<(), StorageError> {
        let issue_id = issue_id.to_string();
        let owner = owner.map(str::to_string);
        self.write("assign_issue_owner", move |conn| {
            in_transaction(conn, |tx| {
                let previous: Option<String> = tx
                    .prepare_cached("SELECT assigned_to FROM errors WHERE error_id = ?")?
                    .query_row([&issue_id], |row| row.get(0))
                    .optional()?
                    .ok_or_else(|| StorageError::NotFound(format!("issue {issue_id}")))?;
                tx.prepare_cached("UPDATE errors SET assigned_to = ? WHERE error_id = ?")?
                    .execute(params![owner, issue_id])?;
                record_issue_event(
                    tx,
                    &issue_id,
                    IssueEventType::Assigned,
                    previous.as_deref(),
                    owner.as_deref(),
                    None,
                )
            })
        })
        .await
    }

    pub async fn get_issue_owner(&self, issue_id: &str) -> Result<Option<String>, StorageError> {
        let issue_id = issue_id.to_string();
        self.read(move |conn| {
            conn.prepare_cached("SELECT assigned_to FROM errors WHERE error_id = ?")?
                .query_row([&issue_id], |row| row.get::<_, Option<String>>(0))
                .optional()?
                .ok_or_else(|| StorageError::NotFound(format!("issue {issue_id}")))
        })
        .await
    }

    pub async fn get_issue(&self, issue_id: &str) -> Result<Option<Issue>, StorageError> {
        let issue_id = issue_id.to_string();
        self.read(move |conn| {
            conn.prepare(&format!("{ISSUE_SELECT} WHERE error_id = ?"))?
                .query_row([&issue_id], row_to_issue)
                .optional()?
                .map(finish_issue)
                .transpose()
        })
        .await
    }

    pub async fn list_issues(&self, q: IssueQuery) -> Result<Vec<Issue>, StorageError> {
        self.read(move |conn| {
            let mut sql = format!("{ISSUE_SELECT} WHERE 1 = 1");
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(status) = q.status {
                sql.push_str(" AND status = ?");
                params.push(Box::new(status.as_ref().to_string()));
            }
            if let Some(owner) = q.owner {
                sql.push_str(" AND assigned_to = ?");
                params.push(Box::new(owner));
            }
            if let Some(category) = q.category {
                sql.push_str(" AND category = ?");
                params.push(Box::new(category));
            }
            sql.push_str(&format!(
                " ORDER BY last_seen DESC LIMIT {}",
                effective_limit(q.limit)
            ));

            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(refs.as_slice(), row_to_issue)?;
            let mut issues = Vec::new();
            for row in rows {
                issues.push(finish_issue(row?)?);
            }
            Ok(issues)
        })
        .await
    }

    /// Lifecycle timeline of an issue, oldest first.
    pub async fn get_issue_events(&self, issue_id: &str) -> Result<Vec<IssueEvent>, StorageError> {
        let issue_id = issue_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, issue_id, event_type, old_value, new_value, reason, created_at
                 FROM issue_events
                 WHERE issue_id = ?
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map([&issue_id], |row| {
                Ok((
                    row.get::<_, String>(2)?,
                    IssueEvent {
                        event_id: row.get(0)?,
                        issue_id: row.get(1)?,
                        event_type: IssueEventType::StatusChange,
                        old_value: row.get(3)?,
                        new_value: row.get(4)?,
                        reason: row.get(5)?,
                        created_at: row.get(6)?,
                    },
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (kind, mut event) = row?;
                event.event_type = IssueEventType::from_str(&kind).map_err(|_| {
                    StorageError::InvalidData(format!("unknown issue event type '{kind}'"))
                })?;
                events.push(event);
            }
            Ok(events)
        })
        .await
    }

    /// Mark resolved issues of `service_name` as regressed when their
    /// fingerprint has a fresh open occurrence. Returns the regressed ids.
    pub async fn detect_regressions(
        &self,
        service_name: &str,
        deploy_version: Option<&str>,
    ) -> Result<Vec<String>, StorageError> {
        let service = service_name.to_string();
        let reason = match deploy_version {
            Some(version) => format!("Regression detected in deployment {version}"),
            None => "Regression detected: same fingerprint reappeared".to_string(),
        };

        let regressed = self
            .write("detect_regressions", move |conn| {
                in_transaction(conn, |tx| {
                    let candidates: Vec<(String, String, Option<String>)> = tx
                        .prepare(
                            "SELECT error_id, fingerprint, affected_services
                             FROM errors WHERE status = 'resolved'",
                        )?
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                        .collect::<Result<_, _>>()?;

                    let mut regressed = Vec::new();
                    for (issue_id, fingerprint, services) in candidates {
                        if !decode_set(services).iter().any(|s| s == &service) {
                            continue;
                        }
                        let reappeared: i64 = tx
                            .prepare_cached(
                                "SELECT COUNT(*) FROM errors
                                 WHERE fingerprint = ? AND error_id <> ?
                                   AND status IN ('new', 'acknowledged', 'reopened')",
                            )?
                            .query_row(params![fingerprint, issue_id], |row| row.get(0))?;
                        if reappeared == 0 {
                            continue;
                        }

                        tx.prepare_cached(
                            "UPDATE errors SET status = 'regressed' WHERE error_id = ?",
                        )?
                        .execute([&issue_id])?;
                        record_issue_event(
                            tx,
                            &issue_id,
                            IssueEventType::Regression,
                            Some(IssueStatus::Resolved.as_ref()),
                            Some(IssueStatus::Regressed.as_ref()),
                            Some(reason.as_str()),
                        )?;
                        regressed.push(issue_id);
                    }
                    Ok(regressed)
                })
            })
            .await?;

        if !regressed.is_empty() {
            tracing::warn!(
                service = service_name,
                count = regressed.len(),
                "Issue regressions detected"
            );
            self.publish(LiveMessage::new(
                LiveKind::Issues,
                json!({ "issue_ids": regressed, "status": IssueStatus::Regressed }),
            ));
        }
        Ok(regressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;
    use crate::storage::triage::fingerprint;

    fn event(service: &str, trace: &str) -> ErrorEvent {
        ErrorEvent {
            error_type: "TimeoutError".into(),
            message: "upstream timed out".into(),
            category: "timeout".into(),
            fingerprint: fingerprint("TimeoutError", "upstream timed out"),
            service_name: Some(service.into()),
            trace_id: Some(trace.into()),
            timestamp_unix_nano: 1_000,
        }
    }

    #[tokio::test]
    async fn test_upsert_error_dedups_by_fingerprint() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let a = store.upsert_error(event("api", "t1")).await.unwrap();
        let b = store.upsert_error(event("worker", "t2")).await.unwrap();
        assert_eq!(a, b);

        let issue = store.get_issue(&a).await.unwrap().unwrap();
        assert_eq!(issue.occurrence_count, 2);
        assert_eq!(issue.affected_services, vec!["api", "worker"]);
        assert_eq!(issue.sample_traces, vec!["t1", "t2"]);
        assert_eq!(issue.status, IssueStatus::New);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_transitions_are_recorded() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let id = store.upsert_error(event("api", "t1")).await.unwrap();

        store
            .update_issue_status(&id, IssueStatus::Acknowledged, Some("looking"))
            .await
            .unwrap();
        store
            .update_issue_status(&id, IssueStatus::Resolved, None)
            .await
            .unwrap();

        let events = store.get_issue_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].old_value.as_deref(), Some("new"));
        assert_eq!(events[0].new_value.as_deref(), Some("acknowledged"));
        assert_eq!(events[0].reason.as_deref(), Some("looking"));
        assert_eq!(events[1].new_value.as_deref(), Some("resolved"));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected_without_event() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let id = store.upsert_error(event("api", "t1")).await.unwrap();

        let err = store
            .update_issue_status(&id, IssueStatus::Regressed, None)
            .await;
        assert!(matches!(
            err,
            Err(StorageError::InvalidTransition {
                from: IssueStatus::New,
                to: IssueStatus::Regressed
            })
        ));
        assert!(store.get_issue_events(&id).await.unwrap().is_empty());

        let missing = store
            .update_issue_status("nope", IssueStatus::Resolved, None)
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_owner_assignment() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let id = store.upsert_error(event("api", "t1")).await.unwrap();
        assert_eq!(store.get_issue_owner(&id).await.unwrap(), None);

        store.assign_issue_owner(&id, Some("sam")).await.unwrap();
        store.assign_issue_owner(&id, Some("alex")).await.unwrap();
        assert_eq!(store.get_issue_owner(&id).await.unwrap().as_deref(), Some("alex"));

        let events = store.get_issue_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == IssueEventType::Assigned));
        assert_eq!(events[1].old_value.as_deref(), Some("sam"));

        let owned = store
            .list_issues(IssueQuery {
                owner: Some("alex".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_detect_regressions_pairs_resolved_with_new_occurrence() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let original = store.upsert_error(event("api", "t1")).await.unwrap();
        store
            .update_issue_status(&original, IssueStatus::Resolved, None)
            .await
            .unwrap();

        // Nothing reappeared yet.
        assert!(store.detect_regressions("api", None).await.unwrap().is_empty());

        let fresh = store.upsert_error(event("api", "t9")).await.unwrap();
        assert_ne!(fresh, original);

        // Other services are not affected.
        assert!(store.detect_regressions("billing", None).await.unwrap().is_empty());

        let regressed = store.detect_regressions("api", Some("v2.1")).await.unwrap();
        assert_eq!(regressed, vec![original.clone()]);

        let issue = store.get_issue(&original).await.unwrap().unwrap();
        assert_eq!(issue.status, IssueStatus::Regressed);

        let regression_events: Vec<_> = store
            .get_issue_events(&original)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == IssueEventType::Regression)
            .collect();
        assert_eq!(regression_events.len(), 1);
        assert_eq!(regression_events[0].old_value.as_deref(), Some("resolved"));
        assert_eq!(regression_events[0].new_value.as_deref(), Some("regressed"));
        assert_eq!(
            regression_events[0].reason.as_deref(),
            Some("Regression detected in deployment v2.1")
        );

        // Already regressed: a second pass is a no-op.
        assert!(store.detect_regressions("api", None).await.unwrap().is_empty());
        store.shutdown().await;
    }
}
