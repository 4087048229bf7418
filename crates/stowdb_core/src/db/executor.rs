//! Statement executor over a locked connection handle.
//!
//! # Responsibility
//! - Run single parameterized updates and eagerly materialized queries.
//! - Run statement batches atomically inside one transaction.
//!
//! # Invariants
//! - Every call holds the handle lock for its full duration.
//! - Parameters are always bound positionally; SQL text is never interpolated.
//! - Query cursors are released before returning, on success and on error.
//! - A failing batch leaves none of its statements' effects behind.

use super::{DbError, DbHandle, DbResult, QueryRow, SqlValue};
use log::warn;
use rusqlite::{params_from_iter, Connection, Transaction, TransactionBehavior};

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params<I, V>(sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Self {
            sql: sql.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }
}

/// Runs one non-query statement and reports whether it completed.
///
/// Engine errors (constraint violations, syntax errors) are logged and
/// reported as `false`; use `try_execute_update` to inspect them.
pub fn execute_update(handle: &DbHandle, sql: &str, params: &[SqlValue]) -> bool {
    match try_execute_update(handle, sql, params) {
        Ok(_) => true,
        Err(err) => {
            warn!(
                "event=execute_update module=db status=error error_code={} error={}",
                err.code(),
                err
            );
            false
        }
    }
}

/// Runs one non-query statement and returns the number of changed rows.
///
/// # Errors
/// - `DbError::Update` for engine-reported failures.
/// - `DbError::Closed` when the handle has been closed.
pub fn try_execute_update(handle: &DbHandle, sql: &str, params: &[SqlValue]) -> DbResult<usize> {
    handle.with_conn(|conn| update_on(conn, sql, params))
}

/// Runs a read statement and materializes every row before returning.
///
/// Zero matching rows is an empty vector, not an error.
///
/// # Errors
/// - `DbError::Query` when preparing, binding, or stepping the statement fails.
pub fn execute_query(
    handle: &DbHandle,
    sql: &str,
    params: &[SqlValue],
) -> DbResult<Vec<QueryRow>> {
    handle.with_conn(|conn| query_on(conn, sql, params).map_err(DbError::Query))
}

/// Runs all statements in one transaction and reports aggregate success.
pub fn execute_in_transaction(handle: &DbHandle, statements: &[SqlStatement]) -> bool {
    match try_execute_in_transaction(handle, statements) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                "event=execute_transaction module=db status=error statements={} error_code={} error={}",
                statements.len(),
                err.code(),
                err
            );
            false
        }
    }
}

/// Runs all statements in one transaction; commits only if every one succeeds.
///
/// # Errors
/// - `DbError::Update` for the first failing statement; the whole batch is rolled back.
pub fn try_execute_in_transaction(handle: &DbHandle, statements: &[SqlStatement]) -> DbResult<()> {
    with_transaction(handle, |tx| {
        for statement in statements {
            update_on(tx, &statement.sql, &statement.params)?;
        }
        Ok(())
    })
}

/// Runs `work` inside an immediate transaction on the handle.
///
/// Commits when `work` returns `Ok`; rolls back when it returns `Err`
/// (or panics, via the transaction guard's drop).
pub fn with_transaction<T>(
    handle: &DbHandle,
    work: impl FnOnce(&Transaction<'_>) -> DbResult<T>,
) -> DbResult<T> {
    handle.with_conn(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match work(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        "event=transaction_rollback module=db status=error error={}",
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    })
}

pub(crate) fn update_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> DbResult<usize> {
    conn.execute(sql, params_from_iter(params.iter()))
        .map_err(DbError::Update)
}

fn query_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Vec<QueryRow>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = QueryRow::with_capacity(column_names.len());
        for (index, name) in column_names.iter().enumerate() {
            record.push(name.clone(), SqlValue::from(row.get_ref(index)?));
        }
        result.push(record);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db_in_memory;

    fn handle_with_table() -> DbHandle {
        let handle = open_db_in_memory().unwrap();
        assert!(execute_update(
            &handle,
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, score REAL);",
            &[],
        ));
        handle
    }

    fn count_rows(handle: &DbHandle) -> i64 {
        let rows = execute_query(handle, "SELECT COUNT(*) AS n FROM t;", &[]).unwrap();
        rows[0].get("n").and_then(SqlValue::as_i64).unwrap()
    }

    #[test]
    fn query_returns_only_matching_rows_in_column_order() {
        let handle = handle_with_table();
        for (id, name) in [(4, "four"), (5, "five"), (6, "six")] {
            assert!(execute_update(
                &handle,
                "INSERT INTO t (id, name) VALUES (?1, ?2);",
                &[SqlValue::from(id), SqlValue::from(name)],
            ));
        }

        let rows =
            execute_query(&handle, "SELECT * FROM t WHERE id = ?", &[SqlValue::from(5)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].column_names().collect::<Vec<_>>(),
            vec!["id", "name", "score"]
        );
        assert_eq!(rows[0].get("id"), Some(&SqlValue::Integer(5)));
        assert_eq!(rows[0].get("name"), Some(&SqlValue::Text("five".to_string())));
        assert_eq!(rows[0].get("score"), Some(&SqlValue::Null));
    }

    #[test]
    fn query_with_no_matches_returns_empty_sequence() {
        let handle = handle_with_table();
        let rows = execute_query(
            &handle,
            "SELECT * FROM t WHERE id = ?1;",
            &[SqlValue::from(42)],
        )
        .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn query_against_missing_table_returns_query_error() {
        let handle = open_db_in_memory().unwrap();
        let err = execute_query(&handle, "SELECT * FROM nope;", &[]).unwrap_err();
        assert!(matches!(err, DbError::Query(_)), "unexpected error: {err}");
    }

    #[test]
    fn query_failing_mid_iteration_releases_the_cursor() {
        let handle = handle_with_table();
        for id in 1..=5 {
            assert!(execute_update(
                &handle,
                "INSERT INTO t (id, name) VALUES (?1, ?2);",
                &[SqlValue::from(id), SqlValue::from(format!("n{id}"))],
            ));
        }

        // Row 3 evaluates abs(i64::MIN), which fails after rows 1 and 2 were stepped.
        let err = execute_query(
            &handle,
            "SELECT CASE WHEN id = 3 THEN abs(id - 3 - 9223372036854775807 - 1) ELSE id END AS v \
             FROM t ORDER BY id;",
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, DbError::Query(_)), "unexpected error: {err}");

        let statements = vec![SqlStatement::new("DELETE FROM t WHERE id > 3;")];
        assert!(execute_in_transaction(&handle, &statements));
        assert_eq!(count_rows(&handle), 3);
        handle.close().unwrap();
    }

    #[test]
    fn constraint_violation_is_reported_not_raised() {
        let handle = handle_with_table();
        let insert = "INSERT INTO t (name) VALUES (?1);";
        assert!(execute_update(&handle, insert, &[SqlValue::from("dup")]));
        assert!(!execute_update(&handle, insert, &[SqlValue::from("dup")]));

        let err = try_execute_update(&handle, insert, &[SqlValue::from("dup")]).unwrap_err();
        assert!(matches!(err, DbError::Update(_)));
        assert_eq!(count_rows(&handle), 1);
    }

    #[test]
    fn parameters_are_bound_not_interpolated() {
        let handle = handle_with_table();
        let hostile = "x'); DROP TABLE t; --";
        assert!(execute_update(
            &handle,
            "INSERT INTO t (name) VALUES (?1);",
            &[SqlValue::from(hostile)],
        ));

        let rows = execute_query(&handle, "SELECT name FROM t;", &[]).unwrap();
        assert_eq!(rows[0].get("name").and_then(SqlValue::as_str), Some(hostile));
    }

    #[test]
    fn transaction_with_failing_third_statement_leaves_nothing_behind() {
        let handle = handle_with_table();
        let insert = "INSERT INTO t (id, name) VALUES (?1, ?2);";
        let statements = [(1, "a"), (2, "b"), (3, "a"), (4, "d")]
            .into_iter()
            .map(|(id, name)| {
                SqlStatement::with_params(insert, [SqlValue::from(id), SqlValue::from(name)])
            })
            .collect::<Vec<_>>();

        assert!(!execute_in_transaction(&handle, &statements));
        assert_eq!(count_rows(&handle), 0);
    }

    #[test]
    fn transaction_commits_when_all_statements_succeed() {
        let handle = handle_with_table();
        let statements = vec![
            SqlStatement::with_params("INSERT INTO t (name) VALUES (?1);", ["a"]),
            SqlStatement::with_params("INSERT INTO t (name) VALUES (?1);", ["b"]),
            SqlStatement::new("UPDATE t SET score = 1.5;"),
        ];

        assert!(execute_in_transaction(&handle, &statements));
        assert_eq!(count_rows(&handle), 2);
        let rows = execute_query(&handle, "SELECT SUM(score) AS total FROM t;", &[]).unwrap();
        assert_eq!(rows[0].get("total").and_then(SqlValue::as_f64), Some(3.0));
    }

    #[test]
    fn with_transaction_rolls_back_on_error() {
        let handle = handle_with_table();
        let result: DbResult<()> = with_transaction(&handle, |tx| {
            update_on(tx, "INSERT INTO t (name) VALUES ('kept?');", &[])?;
            Err(DbError::NotReady("abort".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(count_rows(&handle), 0);
    }
}
