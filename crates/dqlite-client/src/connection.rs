//! Blocking dqlite connection.
//!
//! [`DqliteConnection`] owns a `std::net::TcpStream` to the leader behind a
//! `std::sync::Mutex`, so it can be shared by reference and implements the
//! async `Connection` trait with ready futures. Every request blocks the
//! calling thread until the leader answers or `request_timeout` passes.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dqlite_core::connection::{Connection, IsolationLevel, PreparedStatement, TransactionOps};
use dqlite_core::error::{
    ConnectionError, ConnectionErrorKind, TransactionError, TransactionErrorKind,
};
use dqlite_core::{Cx, Error, Outcome, Result, Row, Value, validate_savepoint_name};
use dqlite_wire::request::CLUSTER_FORMAT_V1;
use dqlite_wire::{NodeInfo, Request};

use crate::config::DqliteConfig;
use crate::discovery::{Leader, find_leader};
use crate::protocol::{
    Broken, ExecResult, NodeMetadata, QueryResult, RowCollector, bound_statement_id,
    connection_error, expect_db, expect_empty, expect_leader, expect_metadata, expect_result,
    expect_servers, expect_stmt, expect_welcome, interrupt_drained, statement_handle,
    statement_id,
};
use crate::transport::SyncTransport;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Looking for the leader and opening the database
    Connecting,
    /// Ready for statements
    Ready,
    /// In a transaction
    InTransaction,
    /// The socket failed or the node lost leadership; the next call reconnects
    Error,
    /// The socket broke inside a transaction. Every statement fails until
    /// the caller rolls back.
    TransactionLost,
    /// Connection has been closed
    Closed,
}

/// An open database on the leader.
#[derive(Debug)]
struct Session {
    transport: SyncTransport,
    leader: String,
    db_id: u32,
    heartbeat_timeout: u64,
}

#[derive(Debug)]
struct Inner {
    session: Option<Session>,
    state: ConnectionState,
    /// Bumped on every (re)connect; prepared statements carry it
    generation: u32,
    last: ExecResult,
    in_transaction: bool,
    /// Set when a break discarded an open transaction
    transaction_lost: bool,
    broken: Option<Broken>,
}

/// Blocking connection to the leader of a dqlite cluster.
#[derive(Debug)]
pub struct DqliteConnection {
    config: DqliteConfig,
    inner: Mutex<Inner>,
}

/// Register the client and open the configured database on a fresh leader socket.
#[allow(clippy::result_large_err)]
fn open_session(config: &DqliteConfig, leader: Leader<SyncTransport>) -> Result<Session> {
    let Leader {
        mut transport,
        address,
    } = leader;
    let heartbeat_timeout = expect_welcome(transport.round_trip(&Request::Client {
        id: config.client_id,
    })?)?;
    let db_id = expect_db(transport.round_trip(&Request::Open {
        name: config.database.clone(),
        flags: 0,
        vfs: String::new(),
    })?)?;
    tracing::debug!(
        leader = %address,
        database = %config.database,
        db_id,
        "Opened dqlite database"
    );
    Ok(Session {
        transport,
        leader: address,
        db_id,
        heartbeat_timeout,
    })
}

#[allow(clippy::result_large_err)]
fn connect_session(config: &DqliteConfig) -> Result<Session> {
    let leader = find_leader(config)?;
    open_session(config, leader)
}

#[allow(clippy::result_large_err)]
fn collect_rows(transport: &mut SyncTransport, sql: &str) -> Result<QueryResult> {
    let mut rows = RowCollector::new();
    while rows.push(transport.recv()?, sql)? {}
    Ok(rows.finish())
}

impl Inner {
    fn install(&mut self, session: Session) {
        self.session = Some(session);
        self.generation = self.generation.wrapping_add(1);
        self.state = ConnectionState::Ready;
        self.in_transaction = false;
        self.broken = None;
    }

    /// Reconnect once if the previous call broke the connection.
    #[allow(clippy::result_large_err)]
    fn ensure_ready(&mut self, config: &DqliteConfig) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(connection_error("Connection is closed")),
            ConnectionState::Error | ConnectionState::Disconnected => {
                let broken = self.broken.take().unwrap_or(Broken {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection is not established".to_string(),
                });
                tracing::info!(reason = %broken.message, "Rediscovering dqlite leader");
                self.state = ConnectionState::Connecting;
                match connect_session(config) {
                    Ok(session) => {
                        self.install(session);
                        Ok(())
                    }
                    Err(e) => {
                        self.state = ConnectionState::Error;
                        let err = broken.rediscovery_failed(e);
                        self.broken = Some(broken);
                        Err(err)
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn mark_broken(&mut self, err: &Error) {
        if let Some(broken) = Broken::from_error(err) {
            tracing::warn!(error = %err, "dqlite connection broken");
            if let Some(session) = self.session.take() {
                session.transport.shutdown();
            }
            if self.in_transaction {
                self.transaction_lost = true;
                self.state = ConnectionState::TransactionLost;
            } else {
                self.state = ConnectionState::Error;
            }
            self.broken = Some(broken);
        }
    }

    #[allow(clippy::result_large_err)]
    fn check_lost(&self) -> Result<()> {
        if self.transaction_lost {
            return Err(transaction_lost(self.broken.as_ref()));
        }
        Ok(())
    }

    /// Drop a lost transaction without contacting the server, whose side of
    /// it died with the socket. Returns false when nothing was lost.
    fn forget_lost_transaction(&mut self) -> bool {
        if !self.transaction_lost {
            return false;
        }
        tracing::debug!("Discarding transaction lost with the previous connection");
        self.transaction_lost = false;
        self.in_transaction = false;
        if self.state == ConnectionState::TransactionLost {
            self.state = ConnectionState::Error;
        }
        true
    }

    /// Run one exchange with the leader.
    #[allow(clippy::result_large_err)]
    fn run<T>(
        &mut self,
        config: &DqliteConfig,
        op: impl FnOnce(&mut Session, u32) -> Result<T>,
    ) -> Result<T> {
        self.check_lost()?;
        self.ensure_ready(config)?;
        let generation = self.generation;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| connection_error("Connection is not established"))?;
        let result = op(session, generation);
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    fn set_in_transaction(&mut self, active: bool) {
        self.in_transaction = active;
        if matches!(
            self.state,
            ConnectionState::Ready | ConnectionState::InTransaction
        ) {
            self.state = if active {
                ConnectionState::InTransaction
            } else {
                ConnectionState::Ready
            };
        }
    }
}

impl DqliteConnection {
    /// Find the leader and open the configured database.
    #[tracing::instrument(level = "debug", skip(config), fields(database = %config.database))]
    #[allow(clippy::result_large_err)]
    pub fn connect(config: DqliteConfig) -> Result<Self> {
        let session = connect_session(&config)?;
        let mut inner = Inner {
            session: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            last: ExecResult::default(),
            in_transaction: false,
            transaction_lost: false,
            broken: None,
        };
        inner.install(session);
        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &DqliteConfig {
        &self.config
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Address of the leader this connection talks to.
    pub fn leader_address(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.leader.clone())
    }

    /// Heartbeat timeout announced by the leader, in milliseconds.
    pub fn heartbeat_timeout(&self) -> Option<u64> {
        self.lock().session.as_ref().map(|s| s.heartbeat_timeout)
    }

    /// Row id of the last successful INSERT.
    pub fn last_insert_id(&self) -> i64 {
        self.lock().last.last_insert_id
    }

    /// Rows changed by the last successful statement.
    pub fn rows_affected(&self) -> u64 {
        self.lock().last.rows_affected
    }

    /// Is a transaction open on this connection?
    ///
    /// Stays true after the transaction was lost to a broken socket, until
    /// [`rollback_sync`](Self::rollback_sync).
    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    /// Did a broken socket discard the open transaction?
    pub fn transaction_lost(&self) -> bool {
        self.lock().transaction_lost
    }

    /// Run a query and return all rows.
    #[allow(clippy::result_large_err)]
    pub fn query_sync(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query_result_sync(sql, params).map(|r| r.rows)
    }

    /// Run a query and return its rows and column names.
    #[tracing::instrument(level = "debug", skip(self, params), fields(params = params.len()))]
    #[allow(clippy::result_large_err)]
    pub fn query_result_sync(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.lock().run(&self.config, |session, _| {
            session.transport.send(&Request::QuerySql {
                db: session.db_id,
                sql: sql.to_string(),
                params: params.to_vec(),
            })?;
            collect_rows(&mut session.transport, sql)
        })
    }

    /// Execute a statement and return the rows affected.
    #[tracing::instrument(level = "debug", skip(self, params), fields(params = params.len()))]
    #[allow(clippy::result_large_err)]
    pub fn execute_sync(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.exec(sql, params).map(|r| r.rows_affected)
    }

    /// Execute a statement and return both row id and rows affected.
    #[allow(clippy::result_large_err)]
    pub fn execute_result_sync(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.exec(sql, params)
    }

    /// Execute an INSERT and return the new row id.
    #[allow(clippy::result_large_err)]
    pub fn insert_sync(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.exec(sql, params).map(|r| r.last_insert_id)
    }

    #[allow(clippy::result_large_err)]
    fn exec(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let mut inner = self.lock();
        let result = inner.run(&self.config, |session, _| {
            let response = session.transport.round_trip(&Request::ExecSql {
                db: session.db_id,
                sql: sql.to_string(),
                params: params.to_vec(),
            })?;
            expect_result(response, sql)
        })?;
        inner.last = result;
        Ok(result)
    }

    /// Prepare a statement on the leader.
    #[allow(clippy::result_large_err)]
    pub fn prepare_sync(&self, sql: &str) -> Result<PreparedStatement> {
        self.lock().run(&self.config, |session, generation| {
            let response = session.transport.round_trip(&Request::Prepare {
                db: session.db_id,
                sql: sql.to_string(),
            })?;
            let (id, params) = expect_stmt(response, sql)?;
            Ok(statement_handle(generation, id, sql, params))
        })
    }

    #[allow(clippy::result_large_err)]
    pub fn query_prepared_sync(
        &self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        self.lock().run(&self.config, |session, generation| {
            let id = bound_statement_id(stmt, generation, params)?;
            session.transport.send(&Request::Query {
                db: session.db_id,
                stmt: id,
                params: params.to_vec(),
            })?;
            collect_rows(&mut session.transport, stmt.sql()).map(|r| r.rows)
        })
    }

    #[allow(clippy::result_large_err)]
    pub fn execute_prepared_sync(&self, stmt: &PreparedStatement, params: &[Value]) -> Result<u64> {
        let mut inner = self.lock();
        let result = inner.run(&self.config, |session, generation| {
            let id = bound_statement_id(stmt, generation, params)?;
            let response = session.transport.round_trip(&Request::Exec {
                db: session.db_id,
                stmt: id,
                params: params.to_vec(),
            })?;
            expect_result(response, stmt.sql())
        })?;
        inner.last = result;
        Ok(result.rows_affected)
    }

    /// Release a prepared statement on the leader.
    #[allow(clippy::result_large_err)]
    pub fn finalize_sync(&self, stmt: &PreparedStatement) -> Result<()> {
        self.lock().run(&self.config, |session, generation| {
            let id = statement_id(stmt, generation)?;
            let response = session.transport.round_trip(&Request::Finalize {
                db: session.db_id,
                stmt: id,
            })?;
            expect_empty(response, Some(stmt.sql()))
        })
    }

    /// List the cluster members.
    #[allow(clippy::result_large_err)]
    pub fn cluster_sync(&self) -> Result<Vec<NodeInfo>> {
        self.lock().run(&self.config, |session, _| {
            expect_servers(session.transport.round_trip(&Request::Cluster {
                format: CLUSTER_FORMAT_V1,
            })?)
        })
    }

    /// Ask the connected node who the leader is now.
    #[allow(clippy::result_large_err)]
    pub fn leader_sync(&self) -> Result<Option<NodeInfo>> {
        self.lock().run(&self.config, |session, _| {
            expect_leader(session.transport.round_trip(&Request::Leader)?)
        })
    }

    /// Failure domain and weight of the connected node.
    #[allow(clippy::result_large_err)]
    pub fn describe_sync(&self) -> Result<NodeMetadata> {
        self.lock().run(&self.config, |session, _| {
            expect_metadata(session.transport.round_trip(&Request::Describe { format: 0 })?)
        })
    }

    /// Send `Interrupt` for the database and drain the leader's reply.
    ///
    /// The request is sent under the connection lock like every other, so
    /// it cannot reach a statement another thread is running on this
    /// connection. What it stops is a query whose remaining row batches the
    /// leader still holds for this session; batches already in flight are
    /// read and discarded before the acknowledgement.
    #[allow(clippy::result_large_err)]
    pub fn interrupt_sync(&self) -> Result<()> {
        self.lock().run(&self.config, |session, _| {
            session
                .transport
                .send(&Request::Interrupt { db: session.db_id })?;
            while !interrupt_drained(session.transport.recv()?)? {}
            Ok(())
        })
    }

    /// Round trip with `SELECT 1`.
    #[allow(clippy::result_large_err)]
    pub fn ping_sync(&self) -> Result<()> {
        self.query_sync("SELECT 1", &[]).map(|_| ())
    }

    #[allow(clippy::result_large_err)]
    pub fn begin_sync(&self, isolation: IsolationLevel) -> Result<()> {
        self.lock().check_lost()?;
        if self.in_transaction() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "Already in a transaction".to_string(),
            }));
        }
        if isolation != isolation.effective() {
            tracing::debug!(
                requested = isolation.as_sql(),
                "dqlite transactions are always SERIALIZABLE"
            );
        }
        self.exec("BEGIN", &[])?;
        self.lock().set_in_transaction(true);
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn commit_sync(&self) -> Result<()> {
        self.finish_transaction("COMMIT")
    }

    /// Roll back. A transaction lost to a broken socket is only
    /// forgotten; the server already discarded it.
    #[allow(clippy::result_large_err)]
    pub fn rollback_sync(&self) -> Result<()> {
        if self.lock().forget_lost_transaction() {
            return Ok(());
        }
        self.finish_transaction("ROLLBACK")
    }

    #[allow(clippy::result_large_err)]
    fn finish_transaction(&self, sql: &str) -> Result<()> {
        if !self.in_transaction() {
            return Err(not_in_transaction());
        }
        self.exec(sql, &[])?;
        self.lock().set_in_transaction(false);
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn savepoint_sync(&self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.exec(&format!("SAVEPOINT {}", name), &[]).map(|_| ())
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback_to_sync(&self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.exec(&format!("ROLLBACK TO {}", name), &[]).map(|_| ())
    }

    #[allow(clippy::result_large_err)]
    pub fn release_sync(&self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.exec(&format!("RELEASE {}", name), &[]).map(|_| ())
    }

    /// Close the socket. Later calls fail instead of reconnecting.
    pub fn close_sync(&self) {
        let mut inner = self.lock();
        if let Some(session) = inner.session.take() {
            session.transport.shutdown();
        }
        inner.state = ConnectionState::Closed;
        inner.in_transaction = false;
        inner.transaction_lost = false;
    }
}

pub(crate) fn not_in_transaction() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: "no transaction is active".to_string(),
    })
}

/// Error for any statement other than ROLLBACK after a lost transaction.
pub(crate) fn transaction_lost(broken: Option<&Broken>) -> Error {
    let cause = broken.map_or("connection broke", |b| b.message.as_str());
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::TransactionLost,
        message: format!(
            "transaction was lost when the connection broke ({}); roll back before continuing",
            cause
        ),
        source: None,
    })
}

/// A transaction on a [`DqliteConnection`].
///
/// Dropping it without `commit` or `rollback` rolls back.
pub struct DqliteTransaction<'conn> {
    conn: &'conn DqliteConnection,
    finished: bool,
}

impl<'conn> DqliteTransaction<'conn> {
    fn new(conn: &'conn DqliteConnection) -> Self {
        Self {
            conn,
            finished: false,
        }
    }
}

impl Drop for DqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && self.conn.in_transaction() {
            if let Err(e) = self.conn.rollback_sync() {
                tracing::warn!(error = %e, "Rollback of dropped transaction failed");
            }
        }
    }
}

impl Connection for DqliteConnection {
    type Tx<'conn>
        = DqliteTransaction<'conn>
    where
        Self: 'conn;

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self
            .query_sync(sql, params)
            .map(|rows| rows.into_iter().next());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.execute_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = self.insert_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let result = statements
            .iter()
            .map(|(sql, params)| self.execute_sync(sql, params))
            .collect::<Result<Vec<_>>>();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.begin_with(cx, IsolationLevel::default())
    }

    fn begin_with(
        &self,
        _cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let result = self
            .begin_sync(isolation)
            .map(|()| DqliteTransaction::new(self));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn prepare(
        &self,
        _cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        let result = self.prepare_sync(sql);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_prepared_sync(stmt, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.execute_prepared_sync(stmt, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.ping_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    async fn close(self, _cx: &Cx) -> Result<()> {
        self.close_sync();
        Ok(())
    }
}

impl TransactionOps for DqliteTransaction<'_> {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.conn.query_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self
            .conn
            .query_sync(sql, params)
            .map(|rows| rows.into_iter().next());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.conn.execute_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn savepoint(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.conn.savepoint_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback_to(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.conn.rollback_to_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn release(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.conn.release_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    /// A failed commit leaves the transaction to the drop-time rollback.
    async fn commit(mut self, _cx: &Cx) -> Outcome<(), Error> {
        let result = self.conn.commit_sync();
        self.finished = result.is_ok();
        result.map_or_else(Outcome::Err, Outcome::Ok)
    }

    async fn rollback(mut self, _cx: &Cx) -> Outcome<(), Error> {
        self.finished = true;
        self.conn
            .rollback_sync()
            .map_or_else(Outcome::Err, Outcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestServer, exec_result, not_leader, rows, session_reply};
    use dqlite_core::error::QueryErrorKind;
    use dqlite_wire::{Response, RowsBatch};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(addresses: &[&str]) -> DqliteConfig {
        DqliteConfig::new()
            .addresses(addresses.iter().copied())
            .shuffle_nodes(false)
            .retry_backoff(Duration::from_millis(1))
            .connect_timeout(Duration::from_secs(1))
            .request_timeout(Duration::from_secs(5))
    }

    fn statements(request: &Request) -> Vec<Response> {
        match request {
            Request::QuerySql { sql, .. } if sql == "SELECT 1" => {
                vec![rows(&["1"], vec![vec![Value::BigInt(1)]])]
            }
            Request::QuerySql { sql, .. } if sql.contains("missing") => vec![Response::Failure {
                code: 1,
                message: "no such table: missing".into(),
            }],
            Request::QuerySql { .. } => vec![
                Response::Rows(RowsBatch {
                    columns: vec!["id".into()],
                    rows: vec![vec![Value::BigInt(1)], vec![Value::BigInt(2)]],
                    more: true,
                }),
                rows(&["id"], vec![vec![Value::BigInt(3)]]),
            ],
            Request::ExecSql { sql, .. } if sql.starts_with("INSERT") => vec![exec_result(42, 1)],
            Request::ExecSql { .. } => vec![exec_result(0, 0)],
            Request::Prepare { .. } => vec![Response::Stmt {
                db: 0,
                id: 4,
                params: 1,
            }],
            Request::Query { params, .. } => vec![rows(&["v"], vec![params.clone()])],
            Request::Exec { .. } => vec![exec_result(7, 2)],
            _ => vec![Response::Empty],
        }
    }

    #[test]
    fn test_connection_state() {
        assert_eq!(ConnectionState::Ready, ConnectionState::Ready);
        assert_ne!(ConnectionState::Ready, ConnectionState::Error);
    }

    #[test]
    fn test_not_in_transaction_message() {
        let err = not_in_transaction();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                ..
            })
        ));
        assert!(err.to_string().contains("no transaction is active"));
    }

    #[test]
    fn test_connect_without_seeds() {
        let err = DqliteConnection::connect(DqliteConfig::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_connect_opens_database() {
        let server = TestServer::leader(statements).unwrap();
        let conn =
            DqliteConnection::connect(config(&[server.address()]).database("app").client_id(9))
                .unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.leader_address().as_deref(), Some(server.address()));
        assert_eq!(conn.heartbeat_timeout(), Some(15_000));

        let requests = server.requests();
        assert_eq!(requests[0], Request::Leader);
        assert_eq!(requests[1], Request::Client { id: 9 });
        assert_eq!(
            requests[2],
            Request::Open {
                name: "app".into(),
                flags: 0,
                vfs: String::new(),
            }
        );
    }

    #[test]
    fn test_query_collects_all_batches() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        let rows = conn.query_sync("SELECT id FROM t", &[]).unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.get_as::<i64>(0).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(rows[2].column_names().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn test_execute_records_result() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        let id = conn
            .insert_sync("INSERT INTO t (name) VALUES (?)", &[Value::Text("a".into())])
            .unwrap();
        assert_eq!(id, 42);
        assert_eq!(conn.last_insert_id(), 42);
        assert_eq!(conn.rows_affected(), 1);
        assert!(server.requests().contains(&Request::ExecSql {
            db: 0,
            sql: "INSERT INTO t (name) VALUES (?)".into(),
            params: vec![Value::Text("a".into())],
        }));
    }

    #[test]
    fn test_query_error_keeps_connection() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        match conn.query_sync("SELECT * FROM missing", &[]).unwrap_err() {
            Error::Query(q) => {
                assert_eq!(q.kind, QueryErrorKind::NotFound);
                assert_eq!(q.code, Some(1));
                assert_eq!(q.sql.as_deref(), Some("SELECT * FROM missing"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
        conn.ping_sync().unwrap();
        assert_eq!(server.connections(), 1);
    }

    #[test]
    fn test_follower_redirects_to_leader() {
        let leader = TestServer::leader(statements).unwrap();
        let follower = TestServer::follower(leader.address()).unwrap();

        let conn = DqliteConnection::connect(config(&[follower.address()])).unwrap();
        assert_eq!(conn.leader_address().as_deref(), Some(leader.address()));
        assert_eq!(follower.requests(), vec![Request::Leader]);
        conn.ping_sync().unwrap();
    }

    #[test]
    fn test_skips_node_without_leader() {
        let nobody = TestServer::leaderless().unwrap();
        let leader = TestServer::leader(statements).unwrap();

        let conn =
            DqliteConnection::connect(config(&[nobody.address(), leader.address()])).unwrap();
        assert_eq!(conn.leader_address().as_deref(), Some(leader.address()));
    }

    #[test]
    fn test_no_leader_lists_every_node() {
        let a = TestServer::leaderless().unwrap();
        let b = TestServer::leaderless().unwrap();

        let err = DqliteConnection::connect(config(&[a.address(), b.address()]).max_attempts(2))
            .unwrap_err();
        match &err {
            Error::Connection(ConnectionError { kind, message, .. }) => {
                assert_eq!(*kind, ConnectionErrorKind::NoLeader);
                assert!(message.contains(a.address()));
                assert!(message.contains(b.address()));
                assert!(message.contains("after 2 attempt(s)"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // Two rounds over two seeds.
        assert_eq!(a.connections() + b.connections(), 4);
    }

    #[test]
    fn test_not_leader_triggers_rediscovery() {
        let refusals = Arc::new(AtomicUsize::new(1));
        let server = {
            let refusals = Arc::clone(&refusals);
            TestServer::leader(move |request| match request {
                Request::QuerySql { .. } if refusals.load(Ordering::SeqCst) > 0 => {
                    refusals.fetch_sub(1, Ordering::SeqCst);
                    vec![not_leader()]
                }
                other => statements(other),
            })
            .unwrap()
        };
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        let err = conn.query_sync("SELECT 1", &[]).unwrap_err();
        assert!(err.is_leader_error());
        assert_eq!(conn.state(), ConnectionState::Error);

        let rows = conn.query_sync("SELECT 1", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(server.connections(), 2);
    }

    fn exec_sql(server: &TestServer) -> Vec<String> {
        server
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::ExecSql { sql, .. } => Some(sql),
                _ => None,
            })
            .collect()
    }

    fn is_transaction_lost(err: &Error) -> bool {
        matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::TransactionLost,
                ..
            })
        )
    }

    #[test]
    fn test_break_inside_transaction_refuses_until_rollback() {
        let refusals = Arc::new(AtomicUsize::new(1));
        let server = {
            let refusals = Arc::clone(&refusals);
            TestServer::leader(move |request| match request {
                Request::QuerySql { .. } if refusals.load(Ordering::SeqCst) > 0 => {
                    refusals.fetch_sub(1, Ordering::SeqCst);
                    vec![not_leader()]
                }
                other => statements(other),
            })
            .unwrap()
        };
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        conn.begin_sync(IsolationLevel::default()).unwrap();
        conn.execute_sync("INSERT INTO t (name) VALUES ('a')", &[])
            .unwrap();
        assert!(conn.query_sync("SELECT 1", &[]).unwrap_err().is_leader_error());
        assert_eq!(conn.state(), ConnectionState::TransactionLost);
        assert!(conn.in_transaction());
        assert!(conn.transaction_lost());

        let refused = [
            conn.query_sync("SELECT 1", &[]).unwrap_err(),
            conn.execute_sync("INSERT INTO t (name) VALUES ('b')", &[])
                .unwrap_err(),
            conn.commit_sync().unwrap_err(),
            conn.begin_sync(IsolationLevel::default()).unwrap_err(),
            conn.savepoint_sync("sp1").unwrap_err(),
        ];
        for err in &refused {
            assert!(is_transaction_lost(err), "got {err:?}");
            assert!(!matches!(err, Error::Transaction(_)));
        }
        assert!(refused[2].to_string().contains("roll back"));
        // Nothing reconnected or reached the server.
        assert_eq!(server.connections(), 1);
        assert!(conn.in_transaction());

        conn.rollback_sync().unwrap();
        assert!(!conn.in_transaction());
        assert!(!conn.transaction_lost());
        conn.ping_sync().unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(server.connections(), 2);
        assert_eq!(exec_sql(&server), vec!["BEGIN", "INSERT INTO t (name) VALUES ('a')"]);
    }

    #[test]
    fn test_dropped_transaction_forgets_lost_state() {
        let refusals = Arc::new(AtomicUsize::new(1));
        let server = {
            let refusals = Arc::clone(&refusals);
            TestServer::leader(move |request| match request {
                Request::QuerySql { .. } if refusals.load(Ordering::SeqCst) > 0 => {
                    refusals.fetch_sub(1, Ordering::SeqCst);
                    vec![not_leader()]
                }
                other => statements(other),
            })
            .unwrap()
        };
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();
        let cx = Cx::for_testing();
        let rt = asupersync::runtime::RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");

        rt.block_on(async {
            let tx = match conn.begin(&cx).await {
                Outcome::Ok(tx) => tx,
                _ => panic!("begin failed"),
            };
            assert!(matches!(tx.query(&cx, "SELECT 1", &[]).await, Outcome::Err(_)));
            match tx.commit(&cx).await {
                Outcome::Err(err) => assert!(is_transaction_lost(&err), "got {err:?}"),
                _ => panic!("commit of a lost transaction succeeded"),
            }
        });
        assert!(!conn.in_transaction());
        assert_eq!(exec_sql(&server), vec!["BEGIN"]);
        conn.ping_sync().unwrap();
    }

    #[test]
    fn test_failed_rediscovery_keeps_original_kind() {
        let server = TestServer::start(|own, request| match request {
            Request::Leader => vec![Response::Server {
                id: 1,
                address: own.to_string(),
            }],
            Request::Client { .. } => vec![Response::Welcome {
                heartbeat_timeout: 0,
            }],
            Request::Open { .. } => vec![Response::Db { id: 0 }],
            _ => vec![not_leader()],
        })
        .unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()]).max_attempts(1)).unwrap();
        let address = server.address().to_string();
        drop(server);

        assert!(conn.query_sync("SELECT 1", &[]).unwrap_err().is_leader_error());
        match conn.query_sync("SELECT 1", &[]).unwrap_err() {
            Error::Connection(c) => {
                assert_eq!(c.kind, ConnectionErrorKind::NotLeader);
                assert!(c.message.contains("rediscovery failed"));
                assert!(c.source.is_some());
            }
            other => panic!("unexpected error {:?} (server was {})", other, address),
        }
    }

    #[test]
    fn test_prepared_statement_lifecycle() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        let stmt = conn.prepare_sync("SELECT ?").unwrap();
        assert_eq!(stmt.param_count(), 1);
        let rows = conn.query_prepared_sync(&stmt, &[Value::BigInt(5)]).unwrap();
        assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 5);
        assert_eq!(conn.execute_prepared_sync(&stmt, &[Value::Null]).unwrap(), 2);
        assert_eq!(conn.last_insert_id(), 7);

        assert!(conn.query_prepared_sync(&stmt, &[]).is_err());
        conn.finalize_sync(&stmt).unwrap();
        assert!(server.requests().contains(&Request::Finalize { db: 0, stmt: 4 }));
    }

    #[test]
    fn test_transaction_statements() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        conn.begin_sync(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(conn.state(), ConnectionState::InTransaction);
        assert!(matches!(
            conn.begin_sync(IsolationLevel::Serializable),
            Err(Error::Transaction(_))
        ));
        conn.savepoint_sync("sp1").unwrap();
        assert!(conn.savepoint_sync("bad name").is_err());
        conn.rollback_to_sync("sp1").unwrap();
        conn.release_sync("sp1").unwrap();
        conn.commit_sync().unwrap();
        assert!(conn.commit_sync().is_err());
        assert_eq!(conn.state(), ConnectionState::Ready);

        let sql: Vec<String> = server
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::ExecSql { sql, .. } => Some(sql),
                _ => None,
            })
            .collect();
        assert_eq!(
            sql,
            vec!["BEGIN", "SAVEPOINT sp1", "ROLLBACK TO sp1", "RELEASE sp1", "COMMIT"]
        );
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();
        let cx = Cx::for_testing();
        let rt = asupersync::runtime::RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");

        rt.block_on(async {
            let tx = match conn.begin(&cx).await {
                Outcome::Ok(tx) => tx,
                _ => panic!("begin failed"),
            };
            drop(tx);
        });
        assert!(!conn.in_transaction());
        assert!(server.requests().iter().any(|r| matches!(
            r,
            Request::ExecSql { sql, .. } if sql == "ROLLBACK"
        )));
    }

    #[test]
    fn test_cluster_leader_and_interrupt() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        let nodes = conn.cluster_sync().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, server.address());

        let leader = conn.leader_sync().unwrap().unwrap();
        assert_eq!(leader.address, server.address());

        conn.interrupt_sync().unwrap();
        assert_eq!(conn.describe_sync().unwrap().weight, 0);
    }

    #[test]
    fn test_interrupt_discards_pending_rows() {
        let server = TestServer::start(|own, request| match request {
            Request::Interrupt { .. } => vec![
                rows(&["id"], vec![vec![Value::BigInt(9)]]),
                Response::Empty,
            ],
            other => session_reply(own, own, other).unwrap_or_else(|| statements(other)),
        })
        .unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();

        conn.interrupt_sync().unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        // The stream is back in step: the next query sees its own rows.
        let rows = conn.query_sync("SELECT 1", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 1);
        assert_eq!(server.connections(), 1);
    }

    #[test]
    fn test_closed_connection_does_not_reconnect() {
        let server = TestServer::leader(statements).unwrap();
        let conn = DqliteConnection::connect(config(&[server.address()])).unwrap();
        conn.close_sync();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.ping_sync().is_err());
        assert_eq!(server.connections(), 1);
    }
}
