//! Batch SQL compiler.
//!
//! Builds multi-row `INSERT` statements for a fixed table shape and caches the
//! text by row count. The shape (table, column order, conflict clause) is
//! fixed at construction, so the cache key space is bounded by
//! [`BatchInsert::rows_per_statement`].

use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::DashMap;
use duckdb::{ToSql, Transaction};

use crate::storage::StorageError;

// =============================================================================
// Constants
// =============================================================================

/// Upper bound on bound parameters per statement.
pub const MAX_PARAMETERS: usize = 30_000;

/// Upper bound on rows per statement regardless of width.
pub const MAX_ROWS_PER_STATEMENT: usize = 500;

// =============================================================================
// Statement shape
// =============================================================================

/// Conflict handling appended to the insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnConflict {
    /// Plain insert; duplicates raise a constraint error.
    Fail,
    /// `ON CONFLICT (key) DO NOTHING`.
    Nothing { key: &'static [&'static str] },
    /// `ON CONFLICT (key) DO UPDATE SET c = EXCLUDED.c` for each listed column.
    Update {
        key: &'static [&'static str],
        columns: &'static [&'static str],
    },
}

/// A cached multi-row insert compiler for one table shape.
pub struct BatchInsert {
    table: &'static str,
    columns: &'static [&'static str],
    conflict: OnConflict,
    cache: DashMap<usize, Arc<str>>,
}

impl BatchInsert {
    pub fn new(
        table: &'static str,
        columns: &'static [&'static str],
        conflict: OnConflict,
    ) -> Self {
        Self {
            table,
            columns,
            conflict,
            cache: DashMap::new(),
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Largest sub-batch that keeps rows × columns under [`MAX_PARAMETERS`].
    pub fn rows_per_statement(&self) -> usize {
        (MAX_PARAMETERS / self.columns.len().max(1)).clamp(1, MAX_ROWS_PER_STATEMENT)
    }

    /// Statement text for `rows` rows, compiled once per distinct row count.
    pub fn sql(&self, rows: usize) -> Arc<str> {
        if let Some(hit) = self.cache.get(&rows) {
            return Arc::clone(hit.value());
        }
        let compiled: Arc<str> = compile(self.table, self.columns, &self.conflict, rows).into();
        self.cache
            .entry(rows)
            .or_insert_with(|| Arc::clone(&compiled))
            .value()
            .clone()
    }

    /// Number of distinct row counts compiled so far.
    pub fn cached_shapes(&self) -> usize {
        self.cache.len()
    }

    /// Insert `rows` on `tx`, one statement per sub-batch.
    ///
    /// `bind` pushes exactly [`column_count`](Self::column_count) parameters per
    /// row, in column order. Returns the affected row count.
    pub fn execute_chunked<'r, R, F>(
        &self,
        tx: &Transaction<'_>,
        rows: &'r [R],
        mut bind: F,
    ) -> Result<usize, StorageError>
    where
        F: FnMut(&'r R, &mut Vec<&'r dyn ToSql>),
    {
        let width = self.columns.len();
        let mut affected = 0;
        for chunk in rows.chunks(self.rows_per_statement()) {
            let mut params: Vec<&'r dyn ToSql> = Vec::with_capacity(chunk.len() * width);
            for row in chunk {
                let before = params.len();
                bind(row, &mut params);
                if params.len() - before != width {
                    return Err(StorageError::Internal(format!(
                        "{} binder produced {} parameters, expected {}",
                        self.table,
                        params.len() - before,
                        width
                    )));
                }
            }
            let sql = self.sql(chunk.len());
            let mut stmt = tx.prepare_cached(&sql)?;
            affected += stmt.execute(params.as_slice())?;
        }
        Ok(affected)
    }
}

impl std::fmt::Debug for BatchInsert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchInsert")
            .field("table", &self.table)
            .field("columns", &self.columns.len())
            .field("cached_shapes", &self.cache.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Render the insert text. Pure and deterministic.
pub fn compile(
    table: &str,
    columns: &[&str],
    conflict: &OnConflict,
    rows: usize,
) -> String {
    let width = columns.len();
    let row_group = format!("({})", vec!["?"; width].join(", "));

    let mut sql = String::with_capacity(64 + rows * (row_group.len() + 2));
    let _ = write!(sql, "INSERT INTO {table} ({}) VALUES ", columns.join(", "));
    for i in 0..rows {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&row_group);
    }

    match conflict {
        OnConflict::Fail => {}
        OnConflict::Nothing { key } => {
            let _ = write!(sql, " ON CONFLICT ({}) DO NOTHING", key.join(", "));
        }
        OnConflict::Update { key, columns } => {
            let sets: Vec<String> = columns
                .iter()
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect();
            let _ = write!(
                sql,
                " ON CONFLICT ({}) DO UPDATE SET {}",
                key.join(", "),
                sets.join(", ")
            );
        }
    }
    sql
}

/// `?, ?, ?` placeholder list for dynamic `IN (...)` clauses.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLS: &[&str] = &["id", "name", "value"];

    #[test]
    fn test_compile_plain_insert() {
        let sql = compile("t", COLS, &OnConflict::Fail, 2);
        assert_eq!(
            sql,
            "INSERT INTO t (id, name, value) VALUES (?, ?, ?), (?, ?, ?)"
        );
    }

    #[test]
    fn test_compile_on_conflict_update() {
        let sql = compile(
            "t",
            COLS,
            &OnConflict::Update {
                key: &["id"],
                columns: &["name", "value"],
            },
            1,
        );
        assert_eq!(
            sql,
            "INSERT INTO t (id, name, value) VALUES (?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, value = EXCLUDED.value"
        );
    }

    #[test]
    fn test_compile_on_conflict_nothing() {
        let sql = compile("t", COLS, &OnConflict::Nothing { key: &["id"] }, 1);
        assert!(sql.ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let a = compile("t", COLS, &OnConflict::Fail, 7);
        let b = compile("t", COLS, &OnConflict::Fail, 7);
        assert_eq!(a, b);
        assert_eq!(a.matches('?').count(), 21);
    }

    #[test]
    fn test_sql_cached_by_row_count() {
        let insert = BatchInsert::new("t", COLS, OnConflict::Fail);
        let first = insert.sql(3);
        let second = insert.sql(3);
        assert!(Arc::ptr_eq(&first, &second));
        insert.sql(4);
        assert_eq!(insert.cached_shapes(), 2);
    }

    #[test]
    fn test_rows_per_statement_respects_parameter_ceiling() {
        let narrow = BatchInsert::new("t", COLS, OnConflict::Fail);
        assert_eq!(narrow.rows_per_statement(), MAX_ROWS_PER_STATEMENT);

        static WIDE: [&str; 100] = ["c"; 100];
        let wide = BatchInsert::new("t", &WIDE, OnConflict::Fail);
        assert_eq!(wide.rows_per_statement(), MAX_PARAMETERS / 100);
        assert!(wide.rows_per_statement() * wide.column_count() <= MAX_PARAMETERS);
    }

    #[test]
    fn test_execute_chunked_splits_in_one_transaction() {
        let mut conn = duckdb::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name VARCHAR, value DOUBLE)")
            .unwrap();

        let insert = BatchInsert::new("t", COLS, OnConflict::Fail);
        let rows: Vec<(i32, String, f64)> = (0..(MAX_ROWS_PER_STATEMENT as i32 + 5))
            .map(|i| (i, format!("n{i}"), f64::from(i)))
            .collect();

        let tx = conn.transaction().unwrap();
        let affected = insert
            .execute_chunked(&tx, &rows, |(id, name, value), params| {
                params.push(id);
                params.push(name);
                params.push(value);
            })
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(affected, rows.len());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, rows.len() as i64);
        // Full chunk plus the remainder.
        assert_eq!(insert.cached_shapes(), 2);
    }

    #[test]
    fn test_execute_chunked_rolls_back_whole_batch() {
        let mut conn = duckdb::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name VARCHAR, value DOUBLE)")
            .unwrap();
        let insert = BatchInsert::new("t", COLS, OnConflict::Fail);

        // Second sub-batch collides with the first.
        let mut rows: Vec<(i32, String, f64)> = (0..MAX_ROWS_PER_STATEMENT as i32)
            .map(|i| (i, "a".to_string(), 0.0))
            .collect();
        rows.push((0, "dup".to_string(), 0.0));

        {
            let tx = conn.transaction().unwrap();
            let result = insert.execute_chunked(&tx, &rows, |(id, name, value), params| {
                params.push(id);
                params.push(name);
                params.push(value);
            });
            assert!(result.is_err());
            // Dropped without commit.
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
