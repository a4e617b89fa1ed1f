//! Async dqlite connection on asupersync sockets.
//!
//! [`DqliteAsyncConnection`] needs `&mut self` for every exchange.
//! [`SharedDqliteConnection`] puts it behind an `asupersync::sync::Mutex`
//! so it can implement the `Connection` trait.
//!
//! Unlike the blocking connection there is no per-request timeout; use the
//! `Cx` budget to bound a call.

use std::future::Future;
use std::sync::Arc;

use asupersync::sync::Mutex;
use dqlite_core::connection::{Connection, IsolationLevel, PreparedStatement, TransactionOps};
use dqlite_core::error::{ConnectionErrorKind, TransactionError, TransactionErrorKind};
use dqlite_core::{Cx, Error, Outcome, Result, Row, Value, validate_savepoint_name};
use dqlite_wire::request::CLUSTER_FORMAT_V1;
use dqlite_wire::{NodeInfo, Request};

use crate::config::DqliteConfig;
use crate::connection::{ConnectionState, not_in_transaction, transaction_lost};
use crate::discovery::{Leader, find_leader_async};
use crate::protocol::{
    Broken, ExecResult, NodeMetadata, QueryResult, RowCollector, bound_statement_id,
    connection_error, expect_db, expect_empty, expect_leader, expect_metadata, expect_result,
    expect_servers, expect_stmt, expect_welcome, interrupt_drained, statement_handle,
    statement_id,
};
use crate::transport::AsyncTransport;

macro_rules! lock {
    ($inner:expr, $cx:expr) => {
        match $inner.lock($cx).await {
            Ok(guard) => guard,
            Err(_) => return Outcome::Err(lock_error()),
        }
    };
}

#[derive(Debug)]
struct Session {
    transport: AsyncTransport,
    leader: String,
    db_id: u32,
    heartbeat_timeout: u64,
}

async fn open_session(config: &DqliteConfig, leader: Leader<AsyncTransport>) -> Result<Session> {
    let Leader {
        mut transport,
        address,
    } = leader;
    let heartbeat_timeout = expect_welcome(
        transport
            .round_trip(&Request::Client {
                id: config.client_id,
            })
            .await?,
    )?;
    let db_id = expect_db(
        transport
            .round_trip(&Request::Open {
                name: config.database.clone(),
                flags: 0,
                vfs: String::new(),
            })
            .await?,
    )?;
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

async fn connect_session(cx: &Cx, config: &DqliteConfig) -> Result<Session> {
    let leader = find_leader_async(cx, config).await?;
    open_session(config, leader).await
}

async fn collect_rows(transport: &mut AsyncTransport, sql: &str) -> Result<QueryResult> {
    let mut rows = RowCollector::new();
    while rows.push(transport.recv().await?, sql)? {}
    Ok(rows.finish())
}

/// `Error::Cancelled` from a checkpoint becomes `Outcome::Cancelled`.
fn settle<T>(cx: &Cx, result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(Error::Cancelled) => Outcome::Cancelled(cx.cancel_reason().unwrap_or_default()),
        Err(e) => Outcome::Err(e),
    }
}

/// Async connection to the leader of a dqlite cluster.
#[derive(Debug)]
pub struct DqliteAsyncConnection {
    config: DqliteConfig,
    session: Option<Session>,
    state: ConnectionState,
    generation: u32,
    last: ExecResult,
    in_transaction: bool,
    /// Set when a break discarded an open transaction
    transaction_lost: bool,
    broken: Option<Broken>,
}

impl DqliteAsyncConnection {
    /// Find the leader and open the configured database.
    ///
    /// Leader discovery checks `cx` between attempts and while backing off.
    #[tracing::instrument(level = "debug", skip(cx, config), fields(database = %config.database))]
    pub async fn connect(cx: &Cx, config: DqliteConfig) -> Outcome<Self, Error> {
        let session = match settle(cx, connect_session(cx, &config).await) {
            Outcome::Ok(s) => s,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut conn = Self {
            config,
            session: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            last: ExecResult::default(),
            in_transaction: false,
            transaction_lost: false,
            broken: None,
        };
        conn.install(session);
        Outcome::Ok(conn)
    }

    pub fn config(&self) -> &DqliteConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn leader_address(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.leader.as_str())
    }

    pub fn heartbeat_timeout(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.heartbeat_timeout)
    }

    pub fn last_insert_id(&self) -> i64 {
        self.last.last_insert_id
    }

    pub fn rows_affected(&self) -> u64 {
        self.last.rows_affected
    }

    /// Stays true after the transaction was lost to a broken socket, until
    /// [`rollback_async`](Self::rollback_async).
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn transaction_lost(&self) -> bool {
        self.transaction_lost
    }

    fn install(&mut self, session: Session) {
        self.session = Some(session);
        self.generation = self.generation.wrapping_add(1);
        self.state = ConnectionState::Ready;
        self.in_transaction = false;
        self.broken = None;
    }

    /// Session to talk on, reconnecting once if the last call broke it.
    async fn ready(&mut self, cx: &Cx) -> Result<(&mut Session, u32)> {
        if self.transaction_lost {
            return Err(transaction_lost(self.broken.as_ref()));
        }
        match self.state {
            ConnectionState::Closed => return Err(connection_error("Connection is closed")),
            ConnectionState::Error | ConnectionState::Disconnected => {
                let broken = self.broken.take().unwrap_or(Broken {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection is not established".to_string(),
                });
                tracing::info!(reason = %broken.message, "Rediscovering dqlite leader");
                self.state = ConnectionState::Connecting;
                match connect_session(cx, &self.config).await {
                    Ok(session) => self.install(session),
                    Err(Error::Cancelled) => {
                        self.state = ConnectionState::Error;
                        self.broken = Some(broken);
                        return Err(Error::Cancelled);
                    }
                    Err(e) => {
                        self.state = ConnectionState::Error;
                        let err = broken.rediscovery_failed(e);
                        self.broken = Some(broken);
                        return Err(err);
                    }
                }
            }
            _ => {}
        }
        let generation = self.generation;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| connection_error("Connection is not established"))?;
        Ok((session, generation))
    }

    /// Record an error; socket and leader errors leave the connection to be
    /// rediscovered on the next call.
    ///
    /// A break inside a transaction moves to `TransactionLost` instead.
    fn observe<T>(&mut self, cx: &Cx, result: Result<T>) -> Outcome<T, Error> {
        if let Err(e) = &result {
            if !matches!(
                self.state,
                ConnectionState::Error | ConnectionState::Closed | ConnectionState::TransactionLost
            ) {
                if let Some(broken) = Broken::from_error(e) {
                    tracing::warn!(error = %e, "dqlite connection broken");
                    self.session = None;
                    if self.in_transaction {
                        self.transaction_lost = true;
                        self.state = ConnectionState::TransactionLost;
                    } else {
                        self.state = ConnectionState::Error;
                    }
                    self.broken = Some(broken);
                }
            }
        }
        settle(cx, result)
    }

    async fn query_inner(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let (session, _) = self.ready(cx).await?;
        session
            .transport
            .send(&Request::QuerySql {
                db: session.db_id,
                sql: sql.to_string(),
                params: params.to_vec(),
            })
            .await?;
        collect_rows(&mut session.transport, sql).await
    }

    async fn exec_inner(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let (session, _) = self.ready(cx).await?;
        let response = session
            .transport
            .round_trip(&Request::ExecSql {
                db: session.db_id,
                sql: sql.to_string(),
                params: params.to_vec(),
            })
            .await?;
        let result = expect_result(response, sql)?;
        self.last = result;
        Ok(result)
    }

    /// Run a query and return all rows.
    #[tracing::instrument(level = "debug", skip(self, cx, params), fields(params = params.len()))]
    pub async fn query_async(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        let result = self.query_inner(cx, sql, params).await.map(|r| r.rows);
        self.observe(cx, result)
    }

    /// Run a query and return its rows and column names.
    pub async fn query_result_async(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<QueryResult, Error> {
        let result = self.query_inner(cx, sql, params).await;
        self.observe(cx, result)
    }

    /// Execute a statement and return the rows affected.
    #[tracing::instrument(level = "debug", skip(self, cx, params), fields(params = params.len()))]
    pub async fn execute_async(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<u64, Error> {
        let result = self.exec_inner(cx, sql, params).await.map(|r| r.rows_affected);
        self.observe(cx, result)
    }

    /// Execute an INSERT and return the new row id.
    /// Execute a statement and return both row id and rows affected.
    pub async fn execute_result_async(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<ExecResult, Error> {
        let result = self.exec_inner(cx, sql, params).await;
        self.observe(cx, result)
    }

    pub async fn insert_async(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<i64, Error> {
        let result = self.exec_inner(cx, sql, params).await.map(|r| r.last_insert_id);
        self.observe(cx, result)
    }

    pub async fn prepare_async(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        let result = async {
            let (session, generation) = self.ready(cx).await?;
            let response = session
                .transport
                .round_trip(&Request::Prepare {
                    db: session.db_id,
                    sql: sql.to_string(),
                })
                .await?;
            let (id, params) = expect_stmt(response, sql)?;
            Ok(statement_handle(generation, id, sql, params))
        }
        .await;
        self.observe(cx, result)
    }

    pub async fn query_prepared_async(
        &mut self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        let result = async {
            let (session, generation) = self.ready(cx).await?;
            let id = bound_statement_id(stmt, generation, params)?;
            session
                .transport
                .send(&Request::Query {
                    db: session.db_id,
                    stmt: id,
                    params: params.to_vec(),
                })
                .await?;
            collect_rows(&mut session.transport, stmt.sql())
                .await
                .map(|r| r.rows)
        }
        .await;
        self.observe(cx, result)
    }

    pub async fn execute_prepared_async(
        &mut self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Outcome<u64, Error> {
        let result = async {
            let (session, generation) = self.ready(cx).await?;
            let id = bound_statement_id(stmt, generation, params)?;
            let response = session
                .transport
                .round_trip(&Request::Exec {
                    db: session.db_id,
                    stmt: id,
                    params: params.to_vec(),
                })
                .await?;
            expect_result(response, stmt.sql())
        }
        .await;
        if let Ok(r) = &result {
            self.last = *r;
        }
        self.observe(cx, result.map(|r| r.rows_affected))
    }

    pub async fn finalize_async(
        &mut self,
        cx: &Cx,
        stmt: &PreparedStatement,
    ) -> Outcome<(), Error> {
        let result = async {
            let (session, generation) = self.ready(cx).await?;
            let id = statement_id(stmt, generation)?;
            let response = session
                .transport
                .round_trip(&Request::Finalize {
                    db: session.db_id,
                    stmt: id,
                })
                .await?;
            expect_empty(response, Some(stmt.sql()))
        }
        .await;
        self.observe(cx, result)
    }

    /// List the cluster members.
    pub async fn cluster_async(&mut self, cx: &Cx) -> Outcome<Vec<NodeInfo>, Error> {
        let result = async {
            let (session, _) = self.ready(cx).await?;
            expect_servers(
                session
                    .transport
                    .round_trip(&Request::Cluster {
                        format: CLUSTER_FORMAT_V1,
                    })
                    .await?,
            )
        }
        .await;
        self.observe(cx, result)
    }

    /// Ask the connected node who the leader is now.
    pub async fn leader_async(&mut self, cx: &Cx) -> Outcome<Option<NodeInfo>, Error> {
        let result = async {
            let (session, _) = self.ready(cx).await?;
            expect_leader(session.transport.round_trip(&Request::Leader).await?)
        }
        .await;
        self.observe(cx, result)
    }

    pub async fn describe_async(&mut self, cx: &Cx) -> Outcome<NodeMetadata, Error> {
        let result = async {
            let (session, _) = self.ready(cx).await?;
            expect_metadata(
                session
                    .transport
                    .round_trip(&Request::Describe { format: 0 })
                    .await?,
            )
        }
        .await;
        self.observe(cx, result)
    }

    /// Send `Interrupt` for the database and drain the leader's reply.
    ///
    /// `&mut self` means no other statement runs on this connection
    /// meanwhile; this stops a query whose remaining row batches the leader
    /// still holds for the session, discarding any already in flight.
    pub async fn interrupt_async(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let result = async {
            let (session, _) = self.ready(cx).await?;
            session
                .transport
                .send(&Request::Interrupt { db: session.db_id })
                .await?;
            while !interrupt_drained(session.transport.recv().await?)? {}
            Ok(())
        }
        .await;
        self.observe(cx, result)
    }

    pub async fn ping_async(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.query_async(cx, "SELECT 1", &[]).await.map(|_| ())
    }

    pub async fn begin_async(&mut self, cx: &Cx, isolation: IsolationLevel) -> Outcome<(), Error> {
        if self.transaction_lost {
            return Outcome::Err(transaction_lost(self.broken.as_ref()));
        }
        if self.in_transaction {
            return Outcome::Err(Error::Transaction(TransactionError {
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
        let result = self.exec_inner(cx, "BEGIN", &[]).await;
        if result.is_ok() {
            self.set_in_transaction(true);
        }
        self.observe(cx, result.map(|_| ()))
    }

    pub async fn commit_async(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.finish_transaction(cx, "COMMIT").await
    }

    /// Roll back. A transaction lost to a broken socket is only forgotten;
    /// the server already discarded it.
    pub async fn rollback_async(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.transaction_lost {
            tracing::debug!("Discarding transaction lost with the previous connection");
            self.transaction_lost = false;
            self.in_transaction = false;
            self.state = ConnectionState::Error;
            return Outcome::Ok(());
        }
        self.finish_transaction(cx, "ROLLBACK").await
    }

    async fn finish_transaction(&mut self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Err(not_in_transaction());
        }
        let result = self.exec_inner(cx, sql, &[]).await;
        if result.is_ok() {
            self.set_in_transaction(false);
        }
        self.observe(cx, result.map(|_| ()))
    }

    pub async fn savepoint_async(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        self.savepoint_statement(cx, "SAVEPOINT", name).await
    }

    pub async fn rollback_to_async(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        self.savepoint_statement(cx, "ROLLBACK TO", name).await
    }

    pub async fn release_async(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        self.savepoint_statement(cx, "RELEASE", name).await
    }

    async fn savepoint_statement(&mut self, cx: &Cx, verb: &str, name: &str) -> Outcome<(), Error> {
        if let Err(e) = validate_savepoint_name(name) {
            return Outcome::Err(e);
        }
        let result = self.exec_inner(cx, &format!("{} {}", verb, name), &[]).await;
        self.observe(cx, result.map(|_| ()))
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

    /// Close the connection.
    pub async fn close_async(mut self, _cx: &Cx) -> Result<()> {
        self.session = None;
        self.state = ConnectionState::Closed;
        self.in_transaction = false;
        self.transaction_lost = false;
        Ok(())
    }
}

/// A thread-safe, shared dqlite connection with interior mutability.
///
/// ```ignore
/// let conn = DqliteAsyncConnection::connect(&cx, config).await?;
/// let shared = SharedDqliteConnection::new(conn);
/// let rows = shared.query(&cx, "SELECT * FROM users", &[]).await?;
/// ```
pub struct SharedDqliteConnection {
    inner: Arc<Mutex<DqliteAsyncConnection>>,
}

impl SharedDqliteConnection {
    pub fn new(conn: DqliteAsyncConnection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// Connect and wrap the connection.
    pub async fn connect(cx: &Cx, config: DqliteConfig) -> Outcome<Self, Error> {
        DqliteAsyncConnection::connect(cx, config).await.map(Self::new)
    }

    /// The shared connection cell.
    pub fn inner(&self) -> &Arc<Mutex<DqliteAsyncConnection>> {
        &self.inner
    }

    /// List the cluster members.
    pub async fn cluster(&self, cx: &Cx) -> Outcome<Vec<NodeInfo>, Error> {
        let mut guard = lock!(self.inner, cx);
        guard.cluster_async(cx).await
    }

    /// Ask the connected node who the leader is now.
    pub async fn leader(&self, cx: &Cx) -> Outcome<Option<NodeInfo>, Error> {
        let mut guard = lock!(self.inner, cx);
        guard.leader_async(cx).await
    }

    pub async fn finalize(&self, cx: &Cx, stmt: &PreparedStatement) -> Outcome<(), Error> {
        let mut guard = lock!(self.inner, cx);
        guard.finalize_async(cx, stmt).await
    }

    /// Run a query and return its rows and column names.
    pub async fn query_result(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<QueryResult, Error> {
        let mut guard = lock!(self.inner, cx);
        guard.query_result_async(cx, sql, params).await
    }

    /// Execute a statement and return both row id and rows affected.
    pub async fn execute_result(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<ExecResult, Error> {
        let mut guard = lock!(self.inner, cx);
        guard.execute_result_async(cx, sql, params).await
    }

    /// `BEGIN` without a [`SharedDqliteTransaction`] guard; finish it with
    /// [`commit`](Self::commit) or [`rollback`](Self::rollback).
    pub async fn start_transaction(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> Outcome<(), Error> {
        let mut guard = lock!(self.inner, cx);
        guard.begin_async(cx, isolation).await
    }

    /// `COMMIT` the transaction open on the connection, outside any
    /// [`SharedDqliteTransaction`].
    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let mut guard = lock!(self.inner, cx);
        guard.commit_async(cx).await
    }

    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let mut guard = lock!(self.inner, cx);
        guard.rollback_async(cx).await
    }

    /// Whether a transaction is open.
    pub async fn in_transaction(&self, cx: &Cx) -> Outcome<bool, Error> {
        Outcome::Ok(lock!(self.inner, cx).in_transaction())
    }

    /// Row id of the last successful INSERT.
    pub async fn last_insert_id(&self, cx: &Cx) -> Outcome<i64, Error> {
        Outcome::Ok(lock!(self.inner, cx).last_insert_id())
    }

    /// Rows changed by the last successful statement.
    pub async fn rows_affected(&self, cx: &Cx) -> Outcome<u64, Error> {
        Outcome::Ok(lock!(self.inner, cx).rows_affected())
    }

    async fn begin_transaction_impl(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> Outcome<SharedDqliteTransaction<'_>, Error> {
        let inner = Arc::clone(&self.inner);
        let begun = lock!(inner, cx).begin_async(cx, isolation).await;
        begun.map(|()| SharedDqliteTransaction {
            inner,
            finished: false,
            _marker: std::marker::PhantomData,
        })
    }
}

impl Clone for SharedDqliteConnection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for SharedDqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDqliteConnection")
            .field("inner", &"Arc<Mutex<DqliteAsyncConnection>>")
            .finish()
    }
}

fn lock_error() -> Error {
    connection_error("Failed to acquire connection lock")
}

/// Transaction type for [`SharedDqliteConnection`].
///
/// Each operation takes the connection lock. Drop cannot run async code,
/// so a transaction dropped without `commit` or `rollback` stays open on
/// the leader until the connection closes or the next `BEGIN` fails.
pub struct SharedDqliteTransaction<'conn> {
    inner: Arc<Mutex<DqliteAsyncConnection>>,
    finished: bool,
    _marker: std::marker::PhantomData<&'conn ()>,
}

impl Connection for SharedDqliteConnection {
    type Tx<'conn>
        = SharedDqliteTransaction<'conn>
    where
        Self: 'conn;

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard.query_async(cx, &sql, &params).await
        }
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard
                .query_async(cx, &sql, &params)
                .await
                .map(|rows| rows.into_iter().next())
        }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard.execute_async(cx, &sql, &params).await
        }
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard.insert_async(cx, &sql, &params).await
        }
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let statements = statements.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            let mut results = Vec::with_capacity(statements.len());
            for (sql, params) in &statements {
                match guard.execute_async(cx, sql, params).await {
                    Outcome::Ok(n) => results.push(n),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(results)
        }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.begin_transaction_impl(cx, IsolationLevel::default())
    }

    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.begin_transaction_impl(cx, isolation)
    }

    fn prepare(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        async move {
            let mut guard = lock!(inner, cx);
            guard.prepare_async(cx, &sql).await
        }
    }

    fn query_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let stmt = stmt.clone();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard.query_prepared_async(cx, &stmt, &params).await
        }
    }

    fn execute_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let stmt = stmt.clone();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard.execute_prepared_async(cx, &stmt, &params).await
        }
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            let mut guard = lock!(inner, cx);
            guard.ping_async(cx).await
        }
    }

    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send {
        async move {
            match Arc::try_unwrap(self.inner) {
                Ok(mutex) => mutex.into_inner().close_async(cx).await,
                Err(_) => Err(connection_error(
                    "Cannot close: other references to connection exist",
                )),
            }
        }
    }
}

impl TransactionOps for SharedDqliteTransaction<'_> {
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard.query_async(cx, &sql, &params).await
        }
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard
                .query_async(cx, &sql, &params)
                .await
                .map(|rows| rows.into_iter().next())
        }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = lock!(inner, cx);
            guard.execute_async(cx, &sql, &params).await
        }
    }

    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        async move {
            let mut guard = lock!(inner, cx);
            guard.savepoint_async(cx, &name).await
        }
    }

    fn rollback_to(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        async move {
            let mut guard = lock!(inner, cx);
            guard.rollback_to_async(cx, &name).await
        }
    }

    fn release(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        async move {
            let mut guard = lock!(inner, cx);
            guard.release_async(cx, &name).await
        }
    }

    // `finished` is read by Drop.
    #[allow(unused_assignments)]
    fn commit(mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let mut guard = lock!(self.inner, cx);
            let outcome = guard.commit_async(cx).await;
            drop(guard);
            self.finished = true;
            outcome
        }
    }

    #[allow(unused_assignments)]
    fn rollback(mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let mut guard = lock!(self.inner, cx);
            let outcome = guard.rollback_async(cx).await;
            drop(guard);
            self.finished = true;
            outcome
        }
    }
}

impl Drop for SharedDqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                "SharedDqliteTransaction dropped without commit/rollback; \
                 the transaction stays open on the leader"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestServer, exec_result, not_leader, rows};
    use asupersync::runtime::RuntimeBuilder;
    use dqlite_wire::Response;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn config(address: &str) -> DqliteConfig {
        DqliteConfig::from_address(address)
            .shuffle_nodes(false)
            .retry_backoff(Duration::from_millis(1))
            .connect_timeout(Duration::from_secs(1))
    }

    fn statements(request: &Request) -> Vec<Response> {
        match request {
            Request::QuerySql { .. } => vec![rows(
                &["id", "name"],
                vec![
                    vec![Value::BigInt(1), Value::Text("a".into())],
                    vec![Value::BigInt(2), Value::Null],
                ],
            )],
            Request::ExecSql { sql, .. } if sql.starts_with("INSERT") => vec![exec_result(11, 1)],
            Request::ExecSql { .. } => vec![exec_result(0, 0)],
            Request::Prepare { .. } => vec![Response::Stmt {
                db: 0,
                id: 2,
                params: 0,
            }],
            Request::Query { .. } => vec![rows(&["n"], vec![vec![Value::BigInt(3)]])],
            _ => vec![Response::Empty],
        }
    }

    #[test]
    fn test_lock_error_is_connection_error() {
        assert!(lock_error().is_connection_error());
    }

    #[test]
    fn test_settle_maps_results() {
        let cx = Cx::for_testing();
        assert!(matches!(settle(&cx, Ok(1)), Outcome::Ok(1)));
        assert!(matches!(
            settle::<()>(&cx, Err(Error::Timeout)),
            Outcome::Err(Error::Timeout)
        ));
        assert!(matches!(
            settle::<()>(&cx, Err(Error::Cancelled)),
            Outcome::Cancelled(_)
        ));
    }

    #[test]
    fn test_async_connect_honours_cancelled_cx() {
        let server = TestServer::leader(statements).unwrap();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);

        rt.block_on(async {
            match DqliteAsyncConnection::connect(&cx, config(server.address())).await {
                Outcome::Cancelled(_) => {}
                Outcome::Ok(_) => panic!("connected through a cancelled context"),
                _ => panic!("expected cancellation"),
            }
        });
        assert_eq!(server.connections(), 0);
    }

    #[test]
    fn test_async_break_inside_transaction_refuses_until_rollback() {
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
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let mut conn =
                unwrap_outcome(DqliteAsyncConnection::connect(&cx, config(server.address())).await);
            unwrap_outcome(conn.begin_async(&cx, IsolationLevel::default()).await);
            unwrap_outcome(conn.insert_async(&cx, "INSERT INTO t VALUES (1)", &[]).await);
            match conn.query_async(&cx, "SELECT 1", &[]).await {
                Outcome::Err(e) => assert!(e.is_leader_error()),
                _ => panic!("expected a not-leader failure"),
            }
            assert_eq!(conn.state(), ConnectionState::TransactionLost);
            assert!(conn.in_transaction());
            assert!(conn.transaction_lost());

            let refused = [
                conn.query_async(&cx, "SELECT 1", &[]).await.map(|_| ()),
                conn.insert_async(&cx, "INSERT INTO t VALUES (2)", &[]).await.map(|_| ()),
                conn.commit_async(&cx).await,
                conn.begin_async(&cx, IsolationLevel::default()).await,
            ];
            for outcome in refused {
                match outcome {
                    Outcome::Err(Error::Connection(c)) => {
                        assert_eq!(c.kind, ConnectionErrorKind::TransactionLost);
                    }
                    Outcome::Err(e) => panic!("unexpected error: {e}"),
                    _ => panic!("statement ran on a lost transaction"),
                }
            }
            assert_eq!(server.connections(), 1);

            unwrap_outcome(conn.rollback_async(&cx).await);
            assert!(!conn.in_transaction());
            unwrap_outcome(conn.ping_async(&cx).await);
            assert_eq!(conn.state(), ConnectionState::Ready);
        });
        assert_eq!(server.connections(), 2);

        let sql: Vec<String> = server
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::ExecSql { sql, .. } => Some(sql),
                _ => None,
            })
            .collect();
        assert_eq!(sql, vec!["BEGIN", "INSERT INTO t VALUES (1)"]);
    }

    #[test]
    fn test_async_query_and_execute() {
        let server = TestServer::leader(statements).unwrap();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let conn = unwrap_outcome(
                SharedDqliteConnection::connect(&cx, config(server.address())).await,
            );
            let rows = unwrap_outcome(conn.query(&cx, "SELECT id, name FROM t", &[]).await);
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].get_named::<String>("name").unwrap(), "a");
            assert_eq!(rows[1].get(1), Some(&Value::Null));

            let id = unwrap_outcome(
                conn.insert(&cx, "INSERT INTO t VALUES (?)", &[Value::Int(1)])
                    .await,
            );
            assert_eq!(id, 11);
            assert_eq!(unwrap_outcome(conn.rows_affected(&cx).await), 1);

            let one = unwrap_outcome(conn.query_one(&cx, "SELECT id, name FROM t", &[]).await);
            assert!(one.is_some());
            unwrap_outcome(conn.ping(&cx).await);
        });
    }

    #[test]
    fn test_async_prepared_statement() {
        let server = TestServer::leader(statements).unwrap();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let conn = unwrap_outcome(
                SharedDqliteConnection::connect(&cx, config(server.address())).await,
            );
            let stmt = unwrap_outcome(conn.prepare(&cx, "SELECT count(*) FROM t").await);
            let rows = unwrap_outcome(conn.query_prepared(&cx, &stmt, &[]).await);
            assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 3);
            unwrap_outcome(conn.finalize(&cx, &stmt).await);
        });
        assert!(server.requests().contains(&Request::Finalize { db: 0, stmt: 2 }));
    }

    #[test]
    fn test_async_transaction_commit() {
        let server = TestServer::leader(statements).unwrap();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let conn = unwrap_outcome(
                SharedDqliteConnection::connect(&cx, config(server.address())).await,
            );
            let tx = unwrap_outcome(conn.begin(&cx).await);
            unwrap_outcome(tx.execute(&cx, "UPDATE t SET name = 'b'", &[]).await);
            unwrap_outcome(tx.savepoint(&cx, "inner").await);
            unwrap_outcome(tx.release(&cx, "inner").await);
            unwrap_outcome(tx.commit(&cx).await);

            let guard = conn.inner().lock(&cx).await.expect("lock");
            assert!(!guard.in_transaction());
            assert_eq!(guard.state(), ConnectionState::Ready);
        });

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
            vec!["BEGIN", "UPDATE t SET name = 'b'", "SAVEPOINT inner", "RELEASE inner", "COMMIT"]
        );
    }

    #[test]
    fn test_async_rediscovers_after_not_leader() {
        let refusals = Arc::new(AtomicUsize::new(1));
        let server = {
            let refusals = Arc::clone(&refusals);
            TestServer::leader(move |request| match request {
                Request::ExecSql { .. } if refusals.load(Ordering::SeqCst) > 0 => {
                    refusals.fetch_sub(1, Ordering::SeqCst);
                    vec![not_leader()]
                }
                other => statements(other),
            })
            .unwrap()
        };
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let mut conn =
                unwrap_outcome(DqliteAsyncConnection::connect(&cx, config(server.address())).await);
            match conn.execute_async(&cx, "DELETE FROM t", &[]).await {
                Outcome::Err(e) => assert!(e.is_leader_error()),
                _ => panic!("expected a not-leader failure"),
            }
            assert_eq!(conn.state(), ConnectionState::Error);

            unwrap_outcome(conn.execute_async(&cx, "DELETE FROM t", &[]).await);
            assert_eq!(conn.state(), ConnectionState::Ready);
            conn.close_async(&cx).await.unwrap();
        });
        assert_eq!(server.connections(), 2);
    }

    #[test]
    fn test_async_cluster_and_leader() {
        let server = TestServer::leader(statements).unwrap();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let conn = unwrap_outcome(
                SharedDqliteConnection::connect(&cx, config(server.address())).await,
            );
            let nodes = unwrap_outcome(conn.cluster(&cx).await);
            assert_eq!(nodes[0].role, dqlite_wire::NodeRole::Voter);
            let leader = unwrap_outcome(conn.leader(&cx).await).expect("leader known");
            assert_eq!(leader.address, server.address());
            conn.close(&cx).await.unwrap();
        });
    }
}
