//! Prefix autocomplete across the entity names users search by.

use crate::storage::StorageError;
use crate::storage::store::{TelemetryStore, escape_like};
use crate::storage::types::SearchSuggestion;

const DEFAULT_SUGGESTION_LIMIT: u32 = 20;
const MAX_SUGGESTION_LIMIT: u32 = 100;

impl TelemetryStore {
    /// Suggest distinct names starting with `prefix` (case-insensitive).
    ///
    /// Sources are span names, service names, agent names, workflow names and
    /// error types. Most frequent first; an empty prefix yields nothing.
    pub async fn suggest(
        &self,
        prefix: &str,
        limit: Option<u32>,
    ) -> Result<Vec<SearchSuggestion>, StorageError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            self.ensure_open()?;
            return Ok(Vec::new());
        }
        let pattern = format!("{}%", escape_like(prefix));
        let limit = limit
            .unwrap_or(DEFAULT_SUGGESTION_LIMIT)
            .clamp(1, MAX_SUGGESTION_LIMIT);

        self.read(move |conn| {
            let sql = format!(
                "SELECT text, entity_type, CAST(COUNT(*) AS BIGINT) AS hits FROM (
                    SELECT name AS text, 'spans' AS entity_type FROM spans
                     WHERE name ILIKE $1 ESCAPE '\\'
                    UNION ALL
                    SELECT service_name, 'services' FROM spans
                     WHERE service_name ILIKE $1 ESCAPE '\\'
                    UNION ALL
                    SELECT agent_name, 'agent_runs' FROM agent_runs
                     WHERE agent_name ILIKE $1 ESCAPE '\\'
                    UNION ALL
                    SELECT workflow_name, 'workflows' FROM workflow_executions
                     WHERE workflow_name ILIKE $1 ESCAPE '\\'
                    UNION ALL
                    SELECT error_type, 'errors' FROM errors
                     WHERE error_type ILIKE $1 ESCAPE '\\'
                 )
                 GROUP BY text, entity_type
                 ORDER BY hits DESC, text ASC
                 LIMIT {limit}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([&pattern], |row| {
                Ok(SearchSuggestion {
                    text: row.get(0)?,
                    entity_type: row.get(1)?,
                    count: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }
}
