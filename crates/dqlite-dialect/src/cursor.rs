//! DB-API style cursors.
//!
//! Both cursors run the statement eagerly and keep every row in a
//! [`ResultBuffer`]; the `fetch*` calls never touch the network. Statements
//! that return rows set [`description`](ResultBuffer::description) and leave
//! `rowcount` at -1. Other statements report `rowcount` and `lastrowid`
//! from the leader.

use std::collections::VecDeque;

use dqlite_client::{DqliteConnection, ExecResult, QueryResult, SharedDqliteConnection};
use dqlite_core::{Cx, Error, Outcome, Result, Row, Value};

use crate::paramstyle::{skip_quoted, skip_until, take_while, to_qmark, to_qmark_named};

/// One entry of a cursor's `description`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    /// Storage class of the first row's value, when there is a first row
    pub type_code: Option<&'static str>,
}

/// Does this statement produce rows?
///
/// Decided by the leading keyword, the statement a `WITH` clause feeds, and
/// a top-level `RETURNING` clause. Literals, quoted identifiers and comments
/// are skipped.
pub fn returns_rows(sql: &str) -> bool {
    let words = keywords(sql);
    let Some((base, first)) = words.first() else {
        return false;
    };
    let top_level = |word: &str| words.iter().any(|(depth, w)| depth == base && w == word);
    match first.as_str() {
        "SELECT" | "VALUES" | "PRAGMA" | "EXPLAIN" => true,
        "WITH" => {
            let body = words.iter().skip(1).find(|(depth, w)| {
                depth == base
                    && matches!(
                        w.as_str(),
                        "SELECT" | "VALUES" | "INSERT" | "UPDATE" | "DELETE" | "REPLACE"
                    )
            });
            match body {
                Some((_, w)) if w == "SELECT" || w == "VALUES" => true,
                Some(_) => top_level("RETURNING"),
                None => false,
            }
        }
        _ => top_level("RETURNING"),
    }
}

/// Bare words of `sql`, uppercased, each with its parenthesis depth.
fn keywords(sql: &str) -> Vec<(usize, String)> {
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut chars = sql.char_indices().peekable();
    while let Some((start, ch)) = chars.next() {
        match ch {
            '\'' | '"' | '`' => {
                skip_quoted(&mut chars, ch, sql.len());
            }
            '[' => {
                skip_quoted(&mut chars, ']', sql.len());
            }
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                skip_until(&mut chars, "\n", sql, start + 2);
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                skip_until(&mut chars, "*/", sql, start + 2);
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let tail = take_while(&mut chars, sql, start + 1, |c| {
                    c.is_ascii_alphanumeric() || c == '_'
                });
                words.push((depth, sql[start..start + 1 + tail.len()].to_ascii_uppercase()));
            }
            c if c.is_ascii_digit() => {
                take_while(&mut chars, sql, start + 1, |c| c.is_ascii_alphanumeric() || c == '.');
            }
            _ => {}
        }
    }
    words
}

/// Rows and counters of the last statement a cursor ran.
#[derive(Debug)]
pub struct ResultBuffer {
    description: Option<Vec<ColumnDescription>>,
    rowcount: i64,
    lastrowid: Option<i64>,
    arraysize: usize,
    rows: VecDeque<Row>,
}

impl Default for ResultBuffer {
    fn default() -> Self {
        Self {
            description: None,
            rowcount: -1,
            lastrowid: None,
            arraysize: 1,
            rows: VecDeque::new(),
        }
    }
}

impl ResultBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the rows of a query.
    pub fn set_rows(&mut self, result: QueryResult) {
        let first = result.rows.first();
        self.description = Some(
            result
                .columns
                .names()
                .iter()
                .enumerate()
                .map(|(i, name)| ColumnDescription {
                    name: name.clone(),
                    type_code: first.and_then(|row| row.get(i)).map(Value::type_name),
                })
                .collect(),
        );
        self.rowcount = -1;
        self.lastrowid = None;
        self.rows = result.rows.into();
    }

    /// Store the counters of a statement that returned no rows.
    pub fn set_exec(&mut self, result: ExecResult) {
        self.description = None;
        self.rowcount = result.rows_affected as i64;
        self.lastrowid = Some(result.last_insert_id);
        self.rows.clear();
    }

    pub fn description(&self) -> Option<&[ColumnDescription]> {
        self.description.as_deref()
    }

    /// Rows changed by the last statement; -1 after a query.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    pub fn lastrowid(&self) -> Option<i64> {
        self.lastrowid
    }

    /// Default batch for [`fetchmany`](Self::fetchmany).
    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, size: usize) {
        self.arraysize = size.max(1);
    }

    pub fn fetchone(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Up to `size` rows, or `arraysize` when `None`.
    pub fn fetchmany(&mut self, size: Option<usize>) -> Vec<Row> {
        let size = size.unwrap_or(self.arraysize).min(self.rows.len());
        self.rows.drain(..size).collect()
    }

    pub fn fetchall(&mut self) -> Vec<Row> {
        self.rows.drain(..).collect()
    }

    /// Rows not fetched yet.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Drop buffered rows.
    pub fn close(&mut self) {
        self.rows.clear();
    }
}

impl Iterator for ResultBuffer {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.fetchone()
    }
}

/// Cursor over a blocking connection.
pub struct Cursor<'conn> {
    conn: &'conn DqliteConnection,
    buffer: ResultBuffer,
}

impl<'conn> Cursor<'conn> {
    pub fn new(conn: &'conn DqliteConnection) -> Self {
        Self {
            conn,
            buffer: ResultBuffer::new(),
        }
    }

    /// Run a statement with positional (`?`, `?N`, `$N`) parameters.
    #[tracing::instrument(level = "trace", skip(self, params))]
    #[allow(clippy::result_large_err)]
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        let (sql, params) = to_qmark(sql, params)?;
        self.run(&sql, &params)
    }

    /// Run a statement with `:name` parameters.
    #[allow(clippy::result_large_err)]
    pub fn execute_named(&mut self, sql: &str, params: &[(&str, Value)]) -> Result<()> {
        let (sql, params) = to_qmark_named(sql, params)?;
        self.run(&sql, &params)
    }

    #[allow(clippy::result_large_err)]
    fn run(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        if returns_rows(sql) {
            self.buffer.set_rows(self.conn.query_result_sync(sql, params)?);
        } else {
            self.buffer.set_exec(self.conn.execute_result_sync(sql, params)?);
        }
        Ok(())
    }

    /// Run a statement once per parameter set. `rowcount` is the total.
    #[allow(clippy::result_large_err)]
    pub fn executemany(&mut self, sql: &str, seq_of_params: &[Vec<Value>]) -> Result<()> {
        let mut total = ExecResult::default();
        for params in seq_of_params {
            let (sql, params) = to_qmark(sql, params)?;
            let result = self.conn.execute_result_sync(&sql, &params)?;
            total.rows_affected += result.rows_affected;
            total.last_insert_id = result.last_insert_id;
        }
        self.buffer.set_exec(total);
        Ok(())
    }

    pub fn description(&self) -> Option<&[ColumnDescription]> {
        self.buffer.description()
    }

    pub fn rowcount(&self) -> i64 {
        self.buffer.rowcount()
    }

    pub fn lastrowid(&self) -> Option<i64> {
        self.buffer.lastrowid()
    }

    pub fn arraysize(&self) -> usize {
        self.buffer.arraysize()
    }

    pub fn set_arraysize(&mut self, size: usize) {
        self.buffer.set_arraysize(size);
    }

    pub fn fetchone(&mut self) -> Option<Row> {
        self.buffer.fetchone()
    }

    pub fn fetchmany(&mut self, size: Option<usize>) -> Vec<Row> {
        self.buffer.fetchmany(size)
    }

    pub fn fetchall(&mut self) -> Vec<Row> {
        self.buffer.fetchall()
    }

    pub fn close(&mut self) {
        self.buffer.close();
    }
}

impl Iterator for Cursor<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.buffer.fetchone()
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("buffer", &self.buffer).finish_non_exhaustive()
    }
}

fn bind<T>(result: Result<T>) -> std::result::Result<T, Outcome<(), Error>> {
    result.map_err(Outcome::Err)
}

/// Cursor over an async connection.
///
/// `execute` awaits the whole result; the fetch methods are synchronous. The
/// cursor borrows its connection, so it cannot outlive an engine checkout.
#[derive(Debug)]
pub struct AsyncAdaptedCursor<'conn> {
    conn: &'conn SharedDqliteConnection,
    buffer: ResultBuffer,
}

impl<'conn> AsyncAdaptedCursor<'conn> {
    pub fn new(conn: &'conn SharedDqliteConnection) -> Self {
        Self {
            conn,
            buffer: ResultBuffer::new(),
        }
    }

    /// The connection statements run on.
    pub fn connection(&self) -> &'conn SharedDqliteConnection {
        self.conn
    }

    /// Run a statement with positional parameters.
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<(), Error> {
        let (sql, params) = match bind(to_qmark(sql, params)) {
            Ok(bound) => bound,
            Err(outcome) => return outcome,
        };
        self.run(cx, &sql, &params).await
    }

    /// Run a statement with `:name` parameters.
    pub async fn execute_named(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[(&str, Value)],
    ) -> Outcome<(), Error> {
        let (sql, params) = match bind(to_qmark_named(sql, params)) {
            Ok(bound) => bound,
            Err(outcome) => return outcome,
        };
        self.run(cx, &sql, &params).await
    }

    async fn run(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<(), Error> {
        if returns_rows(sql) {
            match self.conn.query_result(cx, sql, params).await {
                Outcome::Ok(result) => self.buffer.set_rows(result),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            match self.conn.execute_result(cx, sql, params).await {
                Outcome::Ok(result) => self.buffer.set_exec(result),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Run a statement once per parameter set.
    pub async fn executemany(
        &mut self,
        cx: &Cx,
        sql: &str,
        seq_of_params: &[Vec<Value>],
    ) -> Outcome<(), Error> {
        let mut total = ExecResult::default();
        for params in seq_of_params {
            let (sql, params) = match bind(to_qmark(sql, params)) {
                Ok(bound) => bound,
                Err(outcome) => return outcome,
            };
            match self.conn.execute_result(cx, &sql, &params).await {
                Outcome::Ok(result) => {
                    total.rows_affected += result.rows_affected;
                    total.last_insert_id = result.last_insert_id;
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.buffer.set_exec(total);
        Outcome::Ok(())
    }

    pub fn description(&self) -> Option<&[ColumnDescription]> {
        self.buffer.description()
    }

    pub fn rowcount(&self) -> i64 {
        self.buffer.rowcount()
    }

    pub fn lastrowid(&self) -> Option<i64> {
        self.buffer.lastrowid()
    }

    pub fn arraysize(&self) -> usize {
        self.buffer.arraysize()
    }

    pub fn set_arraysize(&mut self, size: usize) {
        self.buffer.set_arraysize(size);
    }

    pub fn fetchone(&mut self) -> Option<Row> {
        self.buffer.fetchone()
    }

    pub fn fetchmany(&mut self, size: Option<usize>) -> Vec<Row> {
        self.buffer.fetchmany(size)
    }

    pub fn fetchall(&mut self) -> Vec<Row> {
        self.buffer.fetchall()
    }

    pub fn close(&mut self) {
        self.buffer.close();
    }
}

impl Iterator for AsyncAdaptedCursor<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.buffer.fetchone()
    }
}
