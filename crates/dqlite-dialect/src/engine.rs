//! Engines: a URL, its dialect and a pool of connections.
//!
//! ```ignore
//! let engine = create_engine("dqlite://node1:9001/app")?;
//! let conn = engine.connect()?;
//! let mut cursor = conn.execute("SELECT id, name FROM users", &[])?;
//! for row in cursor.fetchall() { /* ... */ }
//! ```

use dqlite_client::{DqliteConnection, SharedDqliteConnection};
use dqlite_core::{Cx, Error, IsolationLevel, Outcome, Result, Value};
use dqlite_pool::{Checkout, Pool, PoolStats, PooledConnection};

use crate::cursor::{AsyncAdaptedCursor, Cursor};
use crate::dialect::{ConnectArgs, Dialect, DqliteAioDialect, DqliteDialect};
use crate::registry::DialectRegistry;
use crate::url::DatabaseUrl;

/// Check the resolved dialect is the one this engine type drives.
#[allow(clippy::result_large_err)]
fn expect_driver(url: &DatabaseUrl, dialect: &dyn Dialect, want: &dyn Dialect) -> Result<()> {
    if dialect.is_async() != want.is_async() {
        let hint = if dialect.is_async() {
            "create_async_engine"
        } else {
            "create_engine"
        };
        return Err(Error::config(format!(
            "{} is a{} dialect; use {}",
            url.drivername(),
            if dialect.is_async() { "n async" } else { " sync" },
            hint
        )));
    }
    if dialect.name() != want.name() || dialect.driver() != want.driver() {
        return Err(Error::config(format!(
            "engines only drive {}+{}, not {}",
            want.name(),
            want.driver(),
            url.drivername()
        )));
    }
    Ok(())
}

/// Sync engine for a `dqlite://` URL.
#[allow(clippy::result_large_err)]
pub fn create_engine(url: &str) -> Result<Engine> {
    Engine::from_url(DatabaseUrl::parse(url)?, &DialectRegistry::with_defaults())
}

/// Async engine for a `dqlite+aio://` URL.
#[allow(clippy::result_large_err)]
pub fn create_async_engine(url: &str) -> Result<AsyncEngine> {
    AsyncEngine::from_url(DatabaseUrl::parse(url)?, &DialectRegistry::with_defaults())
}

/// Blocking connections to one database.
#[derive(Debug)]
pub struct Engine {
    url: DatabaseUrl,
    dialect: DqliteDialect,
    args: ConnectArgs,
    pool: Pool<DqliteConnection>,
}

impl Engine {
    /// Build an engine, resolving the dialect through `registry`.
    #[allow(clippy::result_large_err)]
    pub fn from_url(url: DatabaseUrl, registry: &DialectRegistry) -> Result<Self> {
        let dialect = registry.resolve(&url)?;
        expect_driver(&url, dialect.as_ref(), &DqliteDialect)?;
        let args = dialect.create_connect_args(&url)?;
        let pool = Pool::new(dialect.pool_kind(), dialect.pool_config(&url)?);
        tracing::info!(
            url = %url.render_masked(),
            pool = ?pool.kind(),
            "Created dqlite engine"
        );
        Ok(Self {
            url,
            dialect: DqliteDialect,
            args,
            pool,
        })
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    pub fn dialect(&self) -> &DqliteDialect {
        &self.dialect
    }

    pub fn connect_args(&self) -> &ConnectArgs {
        &self.args
    }

    /// Check out a connection, opening one when the pool has none idle.
    #[tracing::instrument(skip(self), fields(url = %self.url.render_masked()))]
    #[allow(clippy::result_large_err)]
    pub fn connect(&self) -> Result<EngineConnection> {
        loop {
            match self.pool.checkout_wait()? {
                Checkout::Reused(mut conn) => {
                    if self.pool.config().pre_ping && !self.dialect.do_ping(&conn) {
                        tracing::debug!("Discarding pooled connection that failed pre-ping");
                        conn.invalidate();
                        continue;
                    }
                    return Ok(EngineConnection::new(conn, self.dialect));
                }
                Checkout::Open(reservation) => {
                    let conn = self.dialect.connect(&self.args)?;
                    return Ok(EngineConnection::new(reservation.fill(conn), self.dialect));
                }
            }
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close idle pooled connections; returns how many were closed.
    pub fn dispose(&self) -> usize {
        let closed = self.pool.dispose();
        tracing::debug!(closed, "Disposed dqlite engine pool");
        closed
    }
}

/// A connection checked out of an [`Engine`].
///
/// Dropping it rolls back an open transaction and returns it to the pool.
#[derive(Debug)]
pub struct EngineConnection {
    conn: PooledConnection<DqliteConnection>,
    dialect: DqliteDialect,
    closed: bool,
}

impl EngineConnection {
    fn new(conn: PooledConnection<DqliteConnection>, dialect: DqliteDialect) -> Self {
        Self {
            conn,
            dialect,
            closed: false,
        }
    }

    /// The underlying driver connection.
    pub fn driver_connection(&self) -> &DqliteConnection {
        &self.conn
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(&self.conn)
    }

    /// Run a statement and return the cursor holding its results.
    #[allow(clippy::result_large_err)]
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<Cursor<'_>> {
        let mut cursor = self.cursor();
        cursor.execute(sql, params)?;
        Ok(cursor)
    }

    #[allow(clippy::result_large_err)]
    pub fn begin(&self) -> Result<()> {
        self.conn.begin_sync(IsolationLevel::default())
    }

    #[allow(clippy::result_large_err)]
    pub fn commit(&self) -> Result<()> {
        self.dialect.do_commit(&self.conn)
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback(&self) -> Result<()> {
        self.dialect.do_rollback(&self.conn)
    }

    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }

    pub fn ping(&self) -> bool {
        self.dialect.do_ping(&self.conn)
    }

    #[allow(clippy::result_large_err)]
    pub fn server_version_info(&self) -> Result<Vec<u32>> {
        self.dialect.server_version_info(&self.conn)
    }

    /// Roll back anything open and return the connection to the pool.
    #[allow(clippy::result_large_err)]
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self.reset();
        if result.is_err() {
            self.conn.invalidate();
        }
        result
    }

    #[allow(clippy::result_large_err)]
    fn reset(&self) -> Result<()> {
        if self.conn.in_transaction() {
            tracing::debug!("Rolling back open transaction on connection return");
            self.dialect.do_rollback(&self.conn)?;
        }
        Ok(())
    }
}

impl Drop for EngineConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.reset() {
            tracing::warn!(error = %e, "Rollback on return failed; discarding connection");
            self.conn.invalidate();
        }
    }
}

/// Async connections to one database, kept in a queue pool.
#[derive(Debug)]
pub struct AsyncEngine {
    url: DatabaseUrl,
    dialect: DqliteAioDialect,
    args: ConnectArgs,
    pool: Pool<SharedDqliteConnection>,
}

impl AsyncEngine {
    #[allow(clippy::result_large_err)]
    pub fn from_url(url: DatabaseUrl, registry: &DialectRegistry) -> Result<Self> {
        let dialect = registry.resolve(&url)?;
        expect_driver(&url, dialect.as_ref(), &DqliteAioDialect)?;
        let args = dialect.create_connect_args(&url)?;
        let pool = Pool::new(dialect.pool_kind(), dialect.pool_config(&url)?);
        tracing::info!(
            url = %url.render_masked(),
            pool = ?pool.kind(),
            "Created async dqlite engine"
        );
        Ok(Self {
            url,
            dialect: DqliteAioDialect,
            args,
            pool,
        })
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    pub fn dialect(&self) -> &DqliteAioDialect {
        &self.dialect
    }

    pub fn connect_args(&self) -> &ConnectArgs {
        &self.args
    }

    /// Check out a connection without blocking the executor.
    ///
    /// When every slot is in use this awaits a returned connection for up to
    /// the pool's `acquire_timeout`, then errors with `PoolErrorKind::Timeout`.
    #[tracing::instrument(skip(self, cx), fields(url = %self.url.render_masked()))]
    pub async fn connect(&self, cx: &Cx) -> Outcome<AsyncEngineConnection, Error> {
        loop {
            let checkout = match self.pool.checkout_async(cx).await {
                Outcome::Ok(checkout) => checkout,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(c) => return Outcome::Cancelled(c),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            match checkout {
                Checkout::Reused(mut conn) => {
                    if self.pool.config().pre_ping && !self.dialect.do_ping(cx, &conn).await {
                        tracing::debug!("Discarding pooled connection that failed pre-ping");
                        conn.invalidate();
                        continue;
                    }
                    return Outcome::Ok(AsyncEngineConnection::new(conn, self.dialect));
                }
                Checkout::Open(reservation) => {
                    return match self.dialect.connect(cx, &self.args).await {
                        Outcome::Ok(conn) => Outcome::Ok(AsyncEngineConnection::new(
                            reservation.fill(conn),
                            self.dialect,
                        )),
                        Outcome::Err(e) => Outcome::Err(e),
                        Outcome::Cancelled(c) => Outcome::Cancelled(c),
                        Outcome::Panicked(p) => Outcome::Panicked(p),
                    };
                }
            }
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close idle pooled connections; returns how many were closed.
    pub fn dispose(&self) -> usize {
        let closed = self.pool.dispose();
        tracing::debug!(closed, "Disposed async dqlite engine pool");
        closed
    }
}

/// A connection checked out of an [`AsyncEngine`].
///
/// Call [`close`](Self::close) to roll back and return it. A connection
/// dropped while a transaction started through [`begin`](Self::begin) is
/// still open is discarded rather than reused.
#[derive(Debug)]
pub struct AsyncEngineConnection {
    conn: PooledConnection<SharedDqliteConnection>,
    dialect: DqliteAioDialect,
    transaction_open: bool,
}

impl AsyncEngineConnection {
    fn new(conn: PooledConnection<SharedDqliteConnection>, dialect: DqliteAioDialect) -> Self {
        Self {
            conn,
            dialect,
            transaction_open: false,
        }
    }

    pub fn driver_connection(&self) -> &SharedDqliteConnection {
        &self.conn
    }

    pub fn cursor(&self) -> AsyncAdaptedCursor<'_> {
        AsyncAdaptedCursor::new(&self.conn)
    }

    /// Run a statement and return the cursor holding its results.
    pub async fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<AsyncAdaptedCursor<'_>, Error> {
        let mut cursor = self.cursor();
        match cursor.execute(cx, sql, params).await {
            Outcome::Ok(()) => Outcome::Ok(cursor),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let outcome = self
            .conn
            .start_transaction(cx, IsolationLevel::default())
            .await;
        if matches!(outcome, Outcome::Ok(())) {
            self.transaction_open = true;
        }
        outcome
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let outcome = self.dialect.do_commit(cx, &self.conn).await;
        if matches!(outcome, Outcome::Ok(())) {
            self.transaction_open = false;
        }
        outcome
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let outcome = self.dialect.do_rollback(cx, &self.conn).await;
        if matches!(outcome, Outcome::Ok(())) {
            self.transaction_open = false;
        }
        outcome
    }

    pub async fn in_transaction(&self, cx: &Cx) -> Outcome<bool, Error> {
        self.conn.in_transaction(cx).await
    }

    pub async fn ping(&self, cx: &Cx) -> bool {
        self.dialect.do_ping(cx, &self.conn).await
    }

    pub async fn server_version_info(&self, cx: &Cx) -> Outcome<Vec<u32>, Error> {
        self.dialect.server_version_info(cx, &self.conn).await
    }

    /// Roll back anything open and return the connection to the pool.
    pub async fn close(mut self, cx: &Cx) -> Outcome<(), Error> {
        let open = match self.conn.in_transaction(cx).await {
            Outcome::Ok(open) => open,
            Outcome::Err(e) => {
                self.conn.invalidate();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(c) => {
                self.conn.invalidate();
                return Outcome::Cancelled(c);
            }
            Outcome::Panicked(p) => {
                self.conn.invalidate();
                return Outcome::Panicked(p);
            }
        };
        if open {
            tracing::debug!("Rolling back open transaction on connection return");
            let outcome = self.dialect.do_rollback(cx, &self.conn).await;
            if !matches!(outcome, Outcome::Ok(())) {
                self.conn.invalidate();
                return outcome;
            }
        }
        self.transaction_open = false;
        Outcome::Ok(())
    }
}

impl Drop for AsyncEngineConnection {
    fn drop(&mut self) {
        if self.transaction_open {
            tracing::warn!("Async connection dropped inside a transaction; discarding it");
            self.conn.invalidate();
        }
    }
}
