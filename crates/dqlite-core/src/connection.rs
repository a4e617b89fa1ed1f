//! Database connection traits.
//!
//! - [`Connection`] executes statements and opens transactions
//! - [`TransactionOps`] runs statements inside a transaction, with savepoints
//! - [`IsolationLevel`] names the requested isolation
//! - [`PreparedStatement`] is a server-side statement handle
//!
//! Every operation takes a `Cx` so asupersync can cancel or time it out.

use crate::error::{Error, Result, TransactionError, TransactionErrorKind};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// Transaction isolation level.
///
/// dqlite replicates a single SQLite database through Raft, so every
/// transaction runs serializably. The other levels are accepted and
/// treated as `Serializable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// What the server runs for this request.
    #[must_use]
    pub const fn effective(&self) -> IsolationLevel {
        IsolationLevel::Serializable
    }
}

/// Handle to a statement prepared on the server.
///
/// `id` packs the connection generation with the server's statement id, so
/// a handle outliving a reconnect is rejected instead of hitting a reused id.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: u64,
    sql: String,
    param_count: usize,
}

impl PreparedStatement {
    #[must_use]
    pub fn new(id: u64, sql: String, param_count: usize) -> Self {
        Self {
            id,
            sql,
            param_count,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter count reported by the server at prepare time.
    #[must_use]
    pub const fn param_count(&self) -> usize {
        self.param_count
    }

    #[must_use]
    pub fn validate_params(&self, params: &[Value]) -> bool {
        params.len() == self.param_count
    }
}

/// Validate a savepoint name before it is spliced into SQL.
///
/// Names must start with a letter or underscore and contain only ASCII
/// alphanumerics and underscores.
#[allow(clippy::result_large_err)]
pub fn validate_savepoint_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 64 {
        Ok(())
    } else {
        Err(Error::Transaction(TransactionError {
            kind: TransactionErrorKind::InvalidSavepoint,
            message: format!("invalid savepoint name: {:?}", name),
        }))
    }
}

/// Async access to one dqlite database.
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT name FROM nodes WHERE id = ?", &[Value::BigInt(1)]).await?;
///
/// let tx = conn.begin(&cx).await?;
/// let params = [Value::Int(0), Value::BigInt(1)];
/// tx.execute(&cx, "UPDATE nodes SET role = ? WHERE id = ?", &params).await?;
/// tx.commit(&cx).await?;
/// ```
pub trait Connection: Send + Sync {
    type Tx<'conn>: TransactionOps
    where
        Self: 'conn;

    /// Run a statement that returns rows and collect every batch.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Last insert id.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Rows affected per statement. Stops at the first failure.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send;

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send;

    /// Levels other than `Serializable` are logged and run serializably.
    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send;

    fn prepare(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send;

    fn query_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    fn execute_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// One `SELECT 1` round trip.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async { matches!(self.ping(cx).await, Outcome::Ok(())) }
    }

    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}

/// Statements inside an open transaction.
///
/// Dropping the value without `commit` or `rollback` leaves the server-side
/// transaction open.
pub trait TransactionOps: Send {
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// `SAVEPOINT name`; the name is checked with [`validate_savepoint_name`].
    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn rollback_to(&self, cx: &Cx, name: &str)
    -> impl Future<Output = Outcome<(), Error>> + Send;

    fn release(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
