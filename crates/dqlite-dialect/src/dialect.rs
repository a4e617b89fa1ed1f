//! The `dqlite` and `dqlite+aio` dialects.
//!
//! A dialect turns a [`DatabaseUrl`] into connect arguments, names the pool
//! an engine should use and smooths over the places where dqlite differs
//! from plain SQLite: commit and rollback outside a transaction, and a fixed
//! SERIALIZABLE isolation level.

use std::time::Duration;

use serde::Serialize;

use dqlite_client::{
    DEFAULT_DATABASE, DEFAULT_PORT, DqliteConfig, DqliteConnection, SharedDqliteConnection,
};
use dqlite_core::{Cx, Error, Outcome, Result, Row};
use dqlite_pool::{PoolConfig, PoolKind};

use crate::paramstyle::ParamStyle;
use crate::url::DatabaseUrl;

/// Message the server sends for COMMIT/ROLLBACK with nothing open.
pub const NO_ACTIVE_TRANSACTION: &str = "no transaction is active";

/// Version reported when `sqlite_version()` returns no row.
pub const FALLBACK_SERVER_VERSION: [u32; 3] = [3, 0, 0];

/// Backend features, for test suites that skip what a backend lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub datetime_literals: bool,
    pub time_microseconds: bool,
    pub datetime_historic: bool,
    pub unicode_ddl: bool,
    pub savepoints: bool,
    pub two_phase_transactions: bool,
    pub temp_table_reflection: bool,
}

/// What dqlite supports.
pub const DQLITE_CAPABILITIES: Capabilities = Capabilities {
    datetime_literals: false,
    time_microseconds: false,
    datetime_historic: false,
    unicode_ddl: true,
    savepoints: true,
    two_phase_transactions: false,
    temp_table_reflection: true,
};

/// DB-API module attributes of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DbApi {
    pub apilevel: &'static str,
    /// Connections may not be shared between threads without locking
    pub threadsafety: u8,
    pub paramstyle: ParamStyle,
}

/// Module attributes shared by both dqlite drivers.
pub const DQLITE_DBAPI: DbApi = DbApi {
    apilevel: "2.0",
    threadsafety: 1,
    paramstyle: ParamStyle::Qmark,
};

/// Arguments for opening a connection, derived from a URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectArgs {
    /// Positional arguments; always empty for dqlite
    pub args: Vec<String>,
    /// Seed node as `host:port`
    pub address: String,
    pub database: String,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl ConnectArgs {
    /// Client configuration for these arguments.
    pub fn to_config(&self) -> DqliteConfig {
        let mut config =
            DqliteConfig::from_address(self.address.clone()).database(self.database.clone());
        if let Some(timeout) = self.connect_timeout {
            config = config.connect_timeout(timeout);
        }
        if let Some(timeout) = self.request_timeout {
            config = config.request_timeout(timeout);
        }
        if let Some(attempts) = self.max_attempts {
            config = config.max_attempts(attempts);
        }
        config
    }
}

/// How to talk to a backend.
pub trait Dialect: std::fmt::Debug + Send + Sync {
    /// Backend name.
    fn name(&self) -> &'static str;

    /// DB-API driver name.
    fn driver(&self) -> &'static str;

    fn paramstyle(&self) -> ParamStyle {
        ParamStyle::Qmark
    }

    fn is_async(&self) -> bool {
        false
    }

    fn supports_statement_cache(&self) -> bool {
        true
    }

    /// Pool an engine for this dialect uses.
    fn pool_kind(&self) -> PoolKind;

    fn dbapi(&self) -> DbApi {
        DQLITE_DBAPI
    }

    /// Turn a URL into connect arguments.
    #[allow(clippy::result_large_err)]
    fn create_connect_args(&self, url: &DatabaseUrl) -> Result<ConnectArgs>;

    /// Pool settings from the URL's `pool_size`, `max_overflow` and
    /// `pool_timeout` (seconds to wait for a free connection).
    #[allow(clippy::result_large_err)]
    fn pool_config(&self, url: &DatabaseUrl) -> Result<PoolConfig> {
        let mut config = PoolConfig::default();
        if let Some(size) = url.query_value::<usize>("pool_size")? {
            config = config.pool_size(size);
        }
        if let Some(overflow) = url.query_value::<usize>("max_overflow")? {
            config = config.max_overflow(overflow);
        }
        if let Some(timeout) = seconds(url, "pool_timeout")? {
            config = config.acquire_timeout(timeout);
        }
        Ok(config)
    }

    fn isolation_level(&self) -> &'static str {
        "SERIALIZABLE"
    }

    /// Isolation level cannot be changed; accepted and ignored.
    fn set_isolation_level(&self, _level: Option<&str>) {}

    fn capabilities(&self) -> Capabilities {
        DQLITE_CAPABILITIES
    }
}

#[allow(clippy::result_large_err)]
fn dqlite_connect_args(url: &DatabaseUrl) -> Result<ConnectArgs> {
    let host = url.get_host().unwrap_or("localhost");
    let port = url.get_port().unwrap_or(DEFAULT_PORT);
    let address = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    Ok(ConnectArgs {
        args: Vec::new(),
        address,
        database: url.get_database().unwrap_or(DEFAULT_DATABASE).to_string(),
        connect_timeout: seconds(url, "connect_timeout")?,
        request_timeout: seconds(url, "request_timeout")?,
        max_attempts: url.query_value("max_attempts")?,
    })
}

#[allow(clippy::result_large_err)]
fn seconds(url: &DatabaseUrl, key: &str) -> Result<Option<Duration>> {
    match url.query_value::<f64>(key)? {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|_| {
                Error::config(format!("{} must be a non-negative number of seconds", key))
            }),
        None => Ok(None),
    }
}

/// Is this the failure the leader sends for COMMIT/ROLLBACK with no open
/// transaction?
///
/// Only server failures count. A transaction the client lost to a broken
/// connection is a connection error and must reach the caller.
pub fn is_no_active_transaction(err: &Error) -> bool {
    matches!(err, Error::Query(q) if q.message.contains(NO_ACTIVE_TRANSACTION))
}

#[allow(clippy::result_large_err)]
fn ignore_no_active_transaction(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if is_no_active_transaction(&e) => {
            tracing::trace!("Ignoring COMMIT/ROLLBACK without an active transaction");
            Ok(())
        }
        other => other,
    }
}

/// Parse the first column of a `SELECT sqlite_version()` row.
#[allow(clippy::result_large_err)]
pub fn parse_server_version(row: Option<&Row>) -> Result<Vec<u32>> {
    let Some(row) = row else {
        return Ok(FALLBACK_SERVER_VERSION.to_vec());
    };
    let version: String = row.get_as(0)?;
    version
        .split('.')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| Error::Custom(format!("unexpected sqlite_version() {:?}", version)))
        })
        .collect()
}

/// Synchronous dialect for `dqlite://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DqliteDialect;

impl DqliteDialect {
    /// Connect with the arguments from [`Dialect::create_connect_args`].
    #[allow(clippy::result_large_err)]
    pub fn connect(&self, args: &ConnectArgs) -> Result<DqliteConnection> {
        DqliteConnection::connect(args.to_config())
    }

    /// COMMIT, treating "no transaction is active" as success.
    ///
    /// Nothing is sent when the connection has no transaction open.
    #[allow(clippy::result_large_err)]
    pub fn do_commit(&self, conn: &DqliteConnection) -> Result<()> {
        if !conn.in_transaction() {
            tracing::trace!("COMMIT without an active transaction");
            return Ok(());
        }
        ignore_no_active_transaction(conn.commit_sync())
    }

    /// ROLLBACK, treating "no transaction is active" as success.
    #[allow(clippy::result_large_err)]
    pub fn do_rollback(&self, conn: &DqliteConnection) -> Result<()> {
        if !conn.in_transaction() {
            tracing::trace!("ROLLBACK without an active transaction");
            return Ok(());
        }
        ignore_no_active_transaction(conn.rollback_sync())
    }

    /// `SELECT 1`; false on any error.
    pub fn do_ping(&self, conn: &DqliteConnection) -> bool {
        match conn.query_sync("SELECT 1", &[]) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "dqlite ping failed");
                false
            }
        }
    }

    /// SQLite version of the leader, e.g. `[3, 45, 1]`.
    #[allow(clippy::result_large_err)]
    pub fn server_version_info(&self, conn: &DqliteConnection) -> Result<Vec<u32>> {
        let rows = conn.query_sync("SELECT sqlite_version()", &[])?;
        parse_server_version(rows.first())
    }
}

impl Dialect for DqliteDialect {
    fn name(&self) -> &'static str {
        "dqlite"
    }

    fn driver(&self) -> &'static str {
        "dqlitedbapi"
    }

    /// dqlite keeps its own leader connection; engines open per checkout.
    fn pool_kind(&self) -> PoolKind {
        PoolKind::Null
    }

    fn create_connect_args(&self, url: &DatabaseUrl) -> Result<ConnectArgs> {
        dqlite_connect_args(url)
    }
}

/// Asynchronous dialect for `dqlite+aio://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DqliteAioDialect;

impl DqliteAioDialect {
    pub async fn connect(
        &self,
        cx: &Cx,
        args: &ConnectArgs,
    ) -> Outcome<SharedDqliteConnection, Error> {
        SharedDqliteConnection::connect(cx, args.to_config()).await
    }

    pub async fn do_commit(&self, cx: &Cx, conn: &SharedDqliteConnection) -> Outcome<(), Error> {
        match conn.in_transaction(cx).await {
            Outcome::Ok(true) => {}
            Outcome::Ok(false) => {
                tracing::trace!("COMMIT without an active transaction");
                return Outcome::Ok(());
            }
            other => return other.map(|_| ()),
        }
        match conn.commit(cx).await {
            Outcome::Err(e) if is_no_active_transaction(&e) => Outcome::Ok(()),
            other => other,
        }
    }

    pub async fn do_rollback(&self, cx: &Cx, conn: &SharedDqliteConnection) -> Outcome<(), Error> {
        match conn.in_transaction(cx).await {
            Outcome::Ok(true) => {}
            Outcome::Ok(false) => {
                tracing::trace!("ROLLBACK without an active transaction");
                return Outcome::Ok(());
            }
            other => return other.map(|_| ()),
        }
        match conn.rollback(cx).await {
            Outcome::Err(e) if is_no_active_transaction(&e) => Outcome::Ok(()),
            other => other,
        }
    }

    pub async fn do_ping(&self, cx: &Cx, conn: &SharedDqliteConnection) -> bool {
        match conn.query_result(cx, "SELECT 1", &[]).await {
            Outcome::Ok(_) => true,
            Outcome::Err(e) => {
                tracing::debug!(error = %e, "dqlite ping failed");
                false
            }
            Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
        }
    }

    pub async fn server_version_info(
        &self,
        cx: &Cx,
        conn: &SharedDqliteConnection,
    ) -> Outcome<Vec<u32>, Error> {
        match conn.query_result(cx, "SELECT sqlite_version()", &[]).await {
            Outcome::Ok(result) => parse_server_version(result.rows.first())
                .map_or_else(Outcome::Err, Outcome::Ok),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

impl Dialect for DqliteAioDialect {
    fn name(&self) -> &'static str {
        "dqlite"
    }

    fn driver(&self) -> &'static str {
        "dqlitedbapi_aio"
    }

    fn is_async(&self) -> bool {
        true
    }

    fn pool_kind(&self) -> PoolKind {
        PoolKind::Queue
    }

    fn create_connect_args(&self, url: &DatabaseUrl) -> Result<ConnectArgs> {
        dqlite_connect_args(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqlite_core::Value;
    use dqlite_core::error::{
        ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind, TransactionError,
        TransactionErrorKind,
    };

    #[test]
    fn test_dialect_identity() {
        let sync = DqliteDialect;
        assert_eq!(sync.name(), "dqlite");
        assert_eq!(sync.driver(), "dqlitedbapi");
        assert_eq!(sync.paramstyle(), ParamStyle::Qmark);
        assert!(!sync.is_async());
        assert!(sync.supports_statement_cache());
        assert_eq!(sync.pool_kind(), PoolKind::Null);

        let aio = DqliteAioDialect;
        assert_eq!(aio.name(), "dqlite");
        assert_eq!(aio.driver(), "dqlitedbapi_aio");
        assert!(aio.is_async());
        assert!(aio.supports_statement_cache());
        assert_eq!(aio.pool_kind(), PoolKind::Queue);
    }

    #[test]
    fn test_connect_args_default() {
        let args = DqliteDialect
            .create_connect_args(&DatabaseUrl::create("dqlite"))
            .unwrap();
        assert!(args.args.is_empty());
        assert_eq!(args.address, "localhost:9001");
        assert_eq!(args.database, "default");
    }

    #[test]
    fn test_connect_args_custom() {
        let url = DatabaseUrl::create("dqlite")
            .host("node1")
            .port(9002)
            .database("mydb");
        let args = DqliteAioDialect.create_connect_args(&url).unwrap();
        assert_eq!(args.address, "node1:9002");
        assert_eq!(args.database, "mydb");

        let config = args.to_config();
        assert_eq!(config.addresses, vec!["node1:9002".to_string()]);
        assert_eq!(config.database, "mydb");
    }

    #[test]
    fn test_connect_args_from_query() {
        let url = DatabaseUrl::parse(
            "dqlite://[::1]/db?connect_timeout=0.5&request_timeout=10&max_attempts=7",
        )
        .unwrap();
        let args = DqliteDialect.create_connect_args(&url).unwrap();
        assert_eq!(args.address, "[::1]:9001");
        assert_eq!(args.connect_timeout, Some(Duration::from_millis(500)));
        assert_eq!(args.request_timeout, Some(Duration::from_secs(10)));
        assert_eq!(args.max_attempts, Some(7));

        let config = args.to_config();
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.max_attempts, 7);

        let bad = DatabaseUrl::parse("dqlite://node1/db?connect_timeout=-1").unwrap();
        assert!(matches!(
            DqliteDialect.create_connect_args(&bad),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_pool_config_from_query() {
        let url = "dqlite+aio://node1/db?pool_size=2&max_overflow=0&pool_timeout=1.5";
        let config = DqliteAioDialect
            .pool_config(&DatabaseUrl::parse(url).unwrap())
            .unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_overflow, 0);
        assert_eq!(config.acquire_timeout, Duration::from_millis(1500));

        let negative = DatabaseUrl::parse("dqlite+aio://node1/db?pool_timeout=-1").unwrap();
        assert!(matches!(
            DqliteAioDialect.pool_config(&negative),
            Err(Error::Config(_))
        ));

        let defaults = DqliteAioDialect
            .pool_config(&DatabaseUrl::create("dqlite+aio"))
            .unwrap();
        assert_eq!(defaults.pool_size, 5);
    }

    #[test]
    fn test_isolation_level_is_fixed() {
        let dialect = DqliteDialect;
        dialect.set_isolation_level(Some("READ UNCOMMITTED"));
        assert_eq!(dialect.isolation_level(), "SERIALIZABLE");
    }

    #[test]
    fn test_dbapi_attributes() {
        for dbapi in [DqliteDialect.dbapi(), DqliteAioDialect.dbapi()] {
            assert_eq!(dbapi.apilevel, "2.0");
            assert_eq!(dbapi.threadsafety, 1);
            assert_eq!(dbapi.paramstyle, ParamStyle::Qmark);
        }
        let json = serde_json::to_value(DQLITE_DBAPI).unwrap();
        assert_eq!(json["paramstyle"], "qmark");
    }

    #[test]
    fn test_capabilities() {
        let caps = DqliteDialect.capabilities();
        assert!(caps.savepoints);
        assert!(caps.unicode_ddl);
        assert!(caps.temp_table_reflection);
        assert!(!caps.two_phase_transactions);
        assert!(!caps.datetime_literals);
        assert!(!caps.time_microseconds);
        assert!(!caps.datetime_historic);
        assert_eq!(DqliteAioDialect.capabilities(), caps);
    }

    #[test]
    fn test_no_active_transaction_detection() {
        let server = Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            code: Some(1),
            sql: Some("COMMIT".into()),
            message: "cannot commit - no transaction is active".into(),
            source: None,
        });
        assert!(is_no_active_transaction(&server));
        assert!(!is_no_active_transaction(&Error::Timeout));

        // Client-side states are never swallowed, whatever their text says.
        let local = Error::Transaction(TransactionError {
            kind: TransactionErrorKind::NotActive,
            message: "no transaction is active".into(),
        });
        assert!(!is_no_active_transaction(&local));
        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::TransactionLost,
            message: "transaction was lost; no transaction is active".into(),
            source: None,
        });
        assert!(!is_no_active_transaction(&lost));
        assert!(ignore_no_active_transaction(Err(lost)).is_err());

        assert!(ignore_no_active_transaction(Err(server)).is_ok());
        assert!(matches!(
            ignore_no_active_transaction(Err(Error::Timeout)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_parse_server_version() {
        let row = Row::new(vec!["v".into()], vec![Value::Text("3.45.1".into())]);
        assert_eq!(parse_server_version(Some(&row)).unwrap(), vec![3, 45, 1]);
        assert_eq!(parse_server_version(None).unwrap(), vec![3, 0, 0]);

        let bad = Row::new(vec!["v".into()], vec![Value::Text("3.x".into())]);
        assert!(parse_server_version(Some(&bad)).is_err());
    }
}
