//! Data lifecycle: archival, deletion, counts and storage statistics.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use duckdb::{Connection, ToSql, params};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;
use crate::storage::store::{TelemetryStore, in_transaction};
use crate::storage::types::{ClearTelemetryResult, GenAiStats, StorageStats, unix_nanos_ago};

/// Directories an archive may never be written under.
const RESERVED_DIRS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/run", "/sbin", "/sys", "/usr",
    "/var/run", "/var/lib",
];

/// Characters that could break out of the quoted `COPY ... TO '<path>'` literal.
const FORBIDDEN_SEQUENCES: &[&str] = &["'", ";", "--", "\n", "\r", "\0"];

/// Outcome of [`TelemetryStore::archive_to_parquet`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveResult {
    /// Rows exported and then deleted.
    pub rows: usize,
    /// Final Parquet file; `None` when nothing matched.
    pub path: Option<PathBuf>,
}

fn reject(path: &Path, why: &str) -> StorageError {
    StorageError::InvalidPath(format!("{}: {why}", path.display()))
}

fn check_sql_literal(path: &Path) -> Result<(), StorageError> {
    let text = path.to_string_lossy();
    if let Some(seq) = FORBIDDEN_SEQUENCES.iter().find(|s| text.contains(*s)) {
        return Err(reject(path, &format!("contains forbidden sequence {seq:?}")));
    }
    Ok(())
}

/// Reject the filesystem root and reserved system directories.
fn check_location(path: &Path) -> Result<(), StorageError> {
    if path.parent().is_none() {
        return Err(reject(path, "refusing to archive into the filesystem root"));
    }
    if let Some(reserved) = RESERVED_DIRS
        .iter()
        .find(|reserved| path.starts_with(reserved))
    {
        return Err(reject(path, &format!("{reserved} is a reserved system directory")));
    }
    let lowered = path.to_string_lossy().to_ascii_lowercase();
    if lowered.starts_with("c:\\windows") || lowered.starts_with("c:\\program files") {
        return Err(reject(path, "reserved system directory"));
    }
    Ok(())
}

/// Resolve symlinks in the longest existing prefix of `path`, keeping the
/// not-yet-created tail as is.
fn resolve_existing(path: &Path) -> Result<PathBuf, StorageError> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        match std::fs::canonicalize(existing) {
            Ok(real) => return Ok(tail.iter().rev().fold(real, |acc, name| acc.join(name))),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) => {
                        tail.push(name.to_os_string());
                        existing = parent;
                    }
                    _ => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Validate an archive destination and return it as an absolute path with
/// symlinks resolved.
///
/// Rejects parent-directory components, characters unsafe inside a SQL
/// string literal, the filesystem root and reserved system directories,
/// both as written and after following symlinks.
pub fn validate_archive_dir(dir: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
    let dir = dir.as_ref();
    if dir.as_os_str().is_empty() {
        return Err(reject(dir, "empty path"));
    }
    if dir.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(reject(dir, "path traversal is not allowed"));
    }
    check_sql_literal(dir)?;

    let absolute = std::path::absolute(dir)?;
    check_location(&absolute)?;
    let resolved = resolve_existing(&absolute)?;
    check_location(&resolved)?;
    check_sql_literal(&resolved)?;
    Ok(resolved)
}

/// First free `spans_<stamp>[_n].parquet` name in `dir`.
fn archive_file_name(dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let mut candidate = dir.join(format!("spans_{stamp}.parquet"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("spans_{stamp}_{n}.parquet"));
        n += 1;
    }
    candidate
}

fn count(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError> {
    let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

/// Drop session rollups whose spans are all gone.
fn prune_sessions(conn: &Connection) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "DELETE FROM sessions
         WHERE session_id NOT IN (
             SELECT DISTINCT session_id FROM spans WHERE session_id IS NOT NULL
         )",
        [],
    )?)
}

/// Move a finished export into place, removing it if the move fails.
fn promote_temp_file(temp_path: &Path, final_path: &Path) -> Result<(), StorageError> {
    if let Err(e) = std::fs::rename(temp_path, final_path) {
        let _ = std::fs::remove_file(temp_path);
        return Err(e.into());
    }
    Ok(())
}

fn archive_spans(
    conn: &mut Connection,
    dir: &Path,
    cutoff: u64,
) -> Result<ArchiveResult, StorageError> {
    let rows = count(
        conn,
        "SELECT CAST(COUNT(*) AS BIGINT) FROM spans WHERE start_time_unix_nano < ?",
        &[&cutoff],
    )? as usize;
    if rows == 0 {
        tracing::debug!(cutoff, "No spans to archive");
        return Ok(ArchiveResult::default());
    }

    std::fs::create_dir_all(dir)?;
    let final_path = archive_file_name(dir);
    let temp_path = final_path.with_extension("parquet.tmp");
    check_sql_literal(&final_path)?;
    check_sql_literal(&temp_path)?;

    // COPY cannot bind parameters; the cutoff is an integer and the path was validated.
    let export = format!(
        "COPY (SELECT * FROM spans WHERE start_time_unix_nano < {cutoff})
         TO '{}' (FORMAT PARQUET, COMPRESSION ZSTD, ROW_GROUP_SIZE 100000)",
        temp_path.display()
    );
    if let Err(e) = conn.execute_batch(&export) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }
    promote_temp_file(&temp_path, &final_path)?;

    let deleted = in_transaction(conn, |tx| {
        let deleted = tx.execute(
            "DELETE FROM spans WHERE start_time_unix_nano < ?",
            params![cutoff],
        )?;
        prune_sessions(tx)?;
        Ok(deleted)
    });
    if let Err(e) = deleted {
        // Exported rows are still in the table; the file would duplicate them.
        let _ = std::fs::remove_file(&final_path);
        return Err(e);
    }

    tracing::info!(rows, path = %final_path.display(), "Spans archived to Parquet");
    Ok(ArchiveResult {
        rows,
        path: Some(final_path),
    })
}

impl TelemetryStore {
    /// Export spans that started more than `older_than` ago to a Parquet file
    /// in `dir`, then delete them.
    ///
    /// The file is written under a temporary name and renamed into place. When
    /// nothing matches no file is created and the table is untouched.
    pub async fn archive_to_parquet(
        &self,
        dir: impl AsRef<Path>,
        older_than: Duration,
    ) -> Result<ArchiveResult, StorageError> {
        let dir = validate_archive_dir(dir)?;
        let cutoff = unix_nanos_ago(older_than);
        self.archive_before(dir, cutoff).await
    }

    /// [`archive_to_parquet`](Self::archive_to_parquet) with an absolute cutoff.
    pub async fn archive_before(
        &self,
        dir: impl AsRef<Path>,
        cutoff_unix_nano: u64,
    ) -> Result<ArchiveResult, StorageError> {
        let dir = validate_archive_dir(dir)?;
        self.write("archive_to_parquet", move |conn| {
            archive_spans(conn, &dir, cutoff_unix_nano)
        })
        .await
    }

    /// Delete every span, log and session in one transaction.
    pub async fn clear_all_telemetry(&self) -> Result<ClearTelemetryResult, StorageError> {
        let result = self
            .write("clear_all_telemetry", |conn| {
                in_transaction(conn, |tx| {
                    Ok(ClearTelemetryResult {
                        spans: tx.execute("DELETE FROM spans", [])?,
                        logs: tx.execute("DELETE FROM logs", [])?,
                        sessions: tx.execute("DELETE FROM sessions", [])?,
                    })
                })
            })
            .await?;
        tracing::info!(
            spans = result.spans,
            logs = result.logs,
            sessions = result.sessions,
            "All telemetry cleared"
        );
        Ok(result)
    }

    /// Delete spans that started before `cutoff_unix_nano`.
    pub async fn delete_spans_before(&self, cutoff_unix_nano: u64) -> Result<usize, StorageError> {
        self.write("delete_spans_before", move |conn| {
            in_transaction(conn, |tx| {
                let deleted = tx.execute(
                    "DELETE FROM spans WHERE start_time_unix_nano < ?",
                    params![cutoff_unix_nano],
                )?;
                if deleted > 0 {
                    prune_sessions(tx)?;
                }
                Ok(deleted)
            })
        })
        .await
    }

    pub async fn delete_logs_before(&self, cutoff_unix_nano: u64) -> Result<usize, StorageError> {
        self.write("delete_logs_before", move |conn| {
            Ok(conn.execute(
                "DELETE FROM logs WHERE time_unix_nano < ?",
                params![cutoff_unix_nano],
            )?)
        })
        .await
    }

    /// Delete the `n` oldest spans by start time.
    pub async fn delete_oldest_spans(&self, n: u64) -> Result<usize, StorageError> {
        if n == 0 {
            self.ensure_open()?;
            return Ok(0);
        }
        self.write("delete_oldest_spans", move |conn| {
            in_transaction(conn, |tx| {
                let deleted = tx.execute(
                    &format!(
                        "DELETE FROM spans WHERE span_id IN (
                            SELECT span_id FROM spans ORDER BY start_time_unix_nano ASC LIMIT {n}
                         )"
                    ),
                    [],
                )?;
                prune_sessions(tx)?;
                Ok(deleted)
            })
        })
        .await
    }

    /// Delete the `n` oldest logs by timestamp.
    pub async fn delete_oldest_logs(&self, n: u64) -> Result<usize, StorageError> {
        if n == 0 {
            self.ensure_open()?;
            return Ok(0);
        }
        self.write("delete_oldest_logs", move |conn| {
            Ok(conn.execute(
                &format!(
                    "DELETE FROM logs WHERE log_id IN (
                        SELECT log_id FROM logs ORDER BY time_unix_nano ASC LIMIT {n}
                     )"
                ),
                [],
            )?)
        })
        .await
    }

    pub async fn span_count(&self) -> Result<u64, StorageError> {
        self.read(|conn| count(conn, "SELECT CAST(COUNT(*) AS BIGINT) FROM spans", &[]))
            .await
    }

    pub async fn log_count(&self) -> Result<u64, StorageError> {
        self.read(|conn| count(conn, "SELECT CAST(COUNT(*) AS BIGINT) FROM logs", &[]))
            .await
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, StorageError> {
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT
                    (SELECT CAST(COUNT(*) AS BIGINT) FROM spans),
                    (SELECT CAST(COUNT(*) AS BIGINT) FROM logs),
                    (SELECT CAST(COUNT(*) AS BIGINT) FROM sessions),
                    (SELECT CAST(COUNT(*) AS BIGINT) FROM errors),
                    (SELECT MIN(start_time_unix_nano) FROM spans),
                    (SELECT MAX(start_time_unix_nano) FROM spans)",
                [],
                |row| {
                    Ok(StorageStats {
                        span_count: row.get(0)?,
                        log_count: row.get(1)?,
                        session_count: row.get(2)?,
                        issue_count: row.get(3)?,
                        oldest_span_time: row.get(4)?,
                        newest_span_time: row.get(5)?,
                    })
                },
            )?)
        })
        .await
    }

    /// Token and cost totals over spans that carry a GenAI provider.
    pub async fn genai_stats(
        &self,
        session_id: Option<&str>,
        start_after: Option<u64>,
    ) -> Result<GenAiStats, StorageError> {
        let session_id = session_id.map(str::to_string);
        self.read(move |conn| {
            let mut sql = String::from(
                "SELECT CAST(COUNT(*) AS BIGINT),
                        CAST(COALESCE(SUM(gen_ai_input_tokens), 0) AS BIGINT),
                        CAST(COALESCE(SUM(gen_ai_output_tokens), 0) AS BIGINT),
                        COALESCE(SUM(gen_ai_cost_usd), 0)::DOUBLE,
                        AVG(gen_ai_cost_usd)::DOUBLE
                 FROM spans WHERE gen_ai_system IS NOT NULL",
            );
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(session_id) = session_id {
                sql.push_str(" AND session_id = ?");
                params.push(Box::new(session_id));
            }
            if let Some(after) = start_after {
                sql.push_str(" AND start_time_unix_nano >= ?");
                params.push(Box::new(after));
            }

            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            Ok(conn.query_row(&sql, refs.as_slice(), |row| {
                Ok(GenAiStats {
                    request_count: row.get(0)?,
                    total_input_tokens: row.get(1)?,
                    total_output_tokens: row.get(2)?,
                    total_cost_usd: row.get(3)?,
                    avg_cost_usd: row.get(4)?,
                })
            })?)
        })
        .await
    }

    /// Approximate on-disk size: the database file plus its WAL, or the
    /// engine's block usage for a memory-resident store.
    pub async fn storage_size_bytes(&self) -> Result<u64, StorageError> {
        match self.location().file_path() {
            Some(path) => {
                self.ensure_open()?;
                let mut wal = path.as_os_str().to_owned();
                wal.push(".wal");
                let mut total = 0;
                for file in [path.to_path_buf(), PathBuf::from(wal)] {
                    match tokio::fs::metadata(&file).await {
                        Ok(meta) => total += meta.len(),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(total)
            }
            None => {
                self.read(|conn| {
                    count(
                        conn,
                        "SELECT CAST(COALESCE(SUM(used_blocks * block_size), 0) AS BIGINT)
                         FROM pragma_database_size()",
                        &[],
                    )
                })
                .await
            }
        }
    }

    /// Flush the WAL into the database file.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        self.write("checkpoint", |conn| {
            conn.execute_batch("CHECKPOINT;")?;
            tracing::debug!("Checkpoint completed");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;
    use crate::storage::types::{LogRecord, Span};

    fn span(id: &str, start: u64) -> Span {
        Span {
            span_id: id.to_string(),
            trace_id: "t".to_string(),
            session_id: Some(format!("s-{id}")),
            name: "op".to_string(),
            start_time_unix_nano: start,
            end_time_unix_nano: start + 10,
            ..Default::default()
        }
    }

    fn log(id: &str, time: u64) -> LogRecord {
        LogRecord {
            log_id: id.to_string(),
            time_unix_nano: time,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_archive_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = validate_archive_dir(tmp.path().join("archive")).unwrap();
        assert!(ok.is_absolute());

        for bad in [
            "../escape",
            "archive/../../etc",
            "/etc/spanvault",
            "/proc/self",
            "/",
            "",
            "dir'; DROP TABLE spans; --",
            "line\nbreak",
        ] {
            assert!(
                matches!(validate_archive_dir(bad), Err(StorageError::InvalidPath(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_archive_dir_follows_symlinks() {
        use std::os::unix::fs::symlink;

        let tmp = tempfile::tempdir().unwrap();
        symlink("/etc", tmp.path().join("to-etc")).unwrap();
        symlink("/usr", tmp.path().join("to-usr")).unwrap();
        for bad in [tmp.path().join("to-etc"), tmp.path().join("to-usr/share/spans")] {
            assert!(
                matches!(validate_archive_dir(&bad), Err(StorageError::InvalidPath(_))),
                "accepted {bad:?}"
            );
        }

        let target = tmp.path().join("real");
        std::fs::create_dir(&target).unwrap();
        symlink(&target, tmp.path().join("alias")).unwrap();
        let resolved = validate_archive_dir(tmp.path().join("alias/daily")).unwrap();
        assert_eq!(resolved, target.canonicalize().unwrap().join("daily"));
    }

    #[test]
    fn test_failed_promotion_removes_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let temp_path = tmp.path().join("spans.parquet.tmp");
        std::fs::write(&temp_path, b"partial").unwrap();
        let occupied = tmp.path().join("spans.parquet");
        std::fs::create_dir(&occupied).unwrap();
        std::fs::write(occupied.join("keep"), b"x").unwrap();

        assert!(promote_temp_file(&temp_path, &occupied).is_err());
        assert!(!temp_path.exists());
        assert!(occupied.join("keep").exists());
    }

    #[tokio::test]
    async fn test_archive_with_unrepresentable_age_keeps_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StoreBuilder::in_memory().build().unwrap();
        let sixty_days = Duration::from_secs(60 * 86_400);
        let start = crate::storage::unix_nanos_ago(sixty_days);
        store.write_spans(vec![span("recent", start)]).await.unwrap();

        let result = store
            .archive_to_parquet(tmp.path(), Duration::from_secs(585 * 365 * 86_400))
            .await
            .unwrap();
        assert_eq!(result.rows, 0);
        assert!(result.path.is_none());
        assert_eq!(store.span_count().await.unwrap(), 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_archive_without_matches_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("archive");
        let store = StoreBuilder::in_memory().build().unwrap();
        store.write_spans(vec![span("a", 5_000)]).await.unwrap();

        let result = store.archive_before(&dir, 1_000).await.unwrap();
        assert_eq!(result, ArchiveResult::default());
        assert!(!dir.exists());
        assert_eq!(store.span_count().await.unwrap(), 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_archive_exports_and_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StoreBuilder::in_memory().build().unwrap();
        store
            .write_spans(vec![span("old1", 100), span("old2", 200), span("new", 9_000)])
            .await
            .unwrap();

        let result = store.archive_before(tmp.path(), 1_000).await.unwrap();
        assert_eq!(result.rows, 2);
        let path = result.path.unwrap();
        assert!(path.exists());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("parquet"));
        assert!(!path.with_extension("parquet.tmp").exists());

        let exported: i64 = store
            .read(move |conn| {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*) FROM read_parquet('{}')", path.display()),
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(exported, 2);
        assert_eq!(store.span_count().await.unwrap(), 1);
        assert_eq!(store.get_sessions(None).await.unwrap().len(), 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_all_reports_counts() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store.write_spans(vec![span("a", 1), span("b", 2)]).await.unwrap();
        store.write_logs(vec![log("l1", 1)]).await.unwrap();

        let cleared = store.clear_all_telemetry().await.unwrap();
        assert_eq!(
            cleared,
            ClearTelemetryResult {
                spans: 2,
                logs: 1,
                sessions: 2
            }
        );
        assert_eq!(store.storage_stats().await.unwrap().span_count, 0);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_by_age_and_count() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store
            .write_spans((0..10).map(|i| span(&format!("s{i}"), i * 100)).collect())
            .await
            .unwrap();
        store
            .write_logs((0..10).map(|i| log(&format!("l{i}"), i * 100)).collect())
            .await
            .unwrap();

        assert_eq!(store.delete_spans_before(300).await.unwrap(), 3);
        assert_eq!(store.delete_logs_before(300).await.unwrap(), 3);
        assert_eq!(store.delete_oldest_spans(2).await.unwrap(), 2);
        assert_eq!(store.delete_oldest_logs(0).await.unwrap(), 0);

        let stats = store.storage_stats().await.unwrap();
        assert_eq!(stats.span_count, 5);
        assert_eq!(stats.log_count, 7);
        assert_eq!(stats.session_count, 5);
        assert_eq!(stats.oldest_span_time, Some(500));
        assert_eq!(stats.newest_span_time, Some(900));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_genai_stats() {
        let store = StoreBuilder::in_memory().build().unwrap();
        let mut priced = span("a", 1);
        priced.gen_ai.provider = Some("openai".into());
        priced.gen_ai.input_tokens = Some(100);
        priced.gen_ai.output_tokens = Some(50);
        priced.gen_ai.cost_usd = Some(0.5);
        let mut cheap = span("b", 2);
        cheap.gen_ai.provider = Some("anthropic".into());
        cheap.gen_ai.cost_usd = Some(0.25);
        store
            .write_spans(vec![priced, cheap, span("c", 3)])
            .await
            .unwrap();

        let stats = store.genai_stats(None, None).await.unwrap();
        assert_eq!(stats.request_count, 2);
        assert_eq!(stats.total_input_tokens, 100);
        assert_eq!(stats.total_output_tokens, 50);
        assert!((stats.total_cost_usd - 0.75).abs() < 1e-9);

        let later = store.genai_stats(None, Some(2)).await.unwrap();
        assert_eq!(later.request_count, 1);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_file_store_size_and_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StoreBuilder::new(tmp.path().join("size.duckdb"))
            .build()
            .unwrap();
        store.write_spans(vec![span("a", 1)]).await.unwrap();
        store.checkpoint().await.unwrap();
        assert!(store.storage_size_bytes().await.unwrap() > 0);
        store.shutdown().await;
    }
}
