//! Error types for dqlite operations.
//!
//! Errors raised by the wire protocol or by the cluster travel through the
//! dialect layer unchanged, so everything a caller can observe is one of the
//! variants below.

use std::fmt;

/// dqlite/SQLite failure code for "not the leader".
pub const SQLITE_IOERR_NOT_LEADER: u64 = 10 | (40 << 8);

/// dqlite/SQLite failure code for "leadership lost while committing".
pub const SQLITE_IOERR_LEADERSHIP_LOST: u64 = 10 | (41 << 8);

/// Underlying cause attached to an error.
pub type BoxedSource = Option<Box<dyn std::error::Error + Send + Sync>>;

/// The primary error type for all dqlite operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, leader redirection)
    Connection(ConnectionError),
    /// Query execution errors reported by the cluster
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration and URL errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: BoxedSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
    /// DNS resolution failed
    DnsResolution,
    /// No node in the seed list knows the current leader
    NoLeader,
    /// The node we talk to is not the leader
    NotLeader,
    /// Leadership changed while a statement was in flight
    LeadershipLost,
    /// The connection broke inside a transaction; only ROLLBACK is accepted
    TransactionLost,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Failure code as sent by the server (SQLite extended result code)
    pub code: Option<u64>,
    pub sql: Option<String>,
    pub message: String,
    pub source: BoxedSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Database is busy or locked (retry may succeed)
    Busy,
    /// Statement was interrupted
    Interrupted,
    /// Read-only database or permission denied
    Permission,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open on this connection
    AlreadyActive,
    /// No transaction is active
    NotActive,
    /// Invalid savepoint name
    InvalidSavepoint,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: BoxedSource,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: BoxedSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: BoxedSource,
}

impl Error {
    /// Is this a retryable error (leader change, busy database, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Busy),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::NotLeader
                    | ConnectionErrorKind::LeadershipLost
                    | ConnectionErrorKind::NoLeader
                    | ConnectionErrorKind::PoolExhausted
            ),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Protocol(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Is this a leader redirection that a fresh leader lookup can resolve?
    pub fn is_leader_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::NotLeader | ConnectionErrorKind::LeadershipLost,
                ..
            })
        )
    }

    /// Get the failure code sent by the server, if any.
    pub fn failure_code(&self) -> Option<u64> {
        match self {
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation? (SQLITE_CONSTRAINT_UNIQUE)
    pub fn is_unique_violation(&self) -> bool {
        self.code == Some(2067) || self.code == Some(1555)
    }

    /// Is this a foreign key violation? (SQLITE_CONSTRAINT_FOREIGNKEY)
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == Some(787)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => match e.code {
                Some(code) => write!(f, "Query error (code {}): {}", code, e.message),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

fn as_source(source: &BoxedSource) -> Option<&(dyn std::error::Error + 'static)> {
    source
        .as_deref()
        .map(|err| err as &(dyn std::error::Error + 'static))
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => as_source(&e.source),
            Error::Query(e) => as_source(&e.source),
            Error::Protocol(e) => as_source(&e.source),
            Error::Pool(e) => as_source(&e.source),
            Error::Config(e) => as_source(&e.source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// `Display` for detail structs that only carry a message.
macro_rules! display_message {
    ($($ty:ty),* $(,)?) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.message)
            }
        })*
    };
}

display_message!(ConnectionError, TransactionError, ProtocolError, PoolError, ConfigError);

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}", self.expected)?;
        if let Some(col) = &self.column {
            write!(f, " for column '{}'", col)?;
        }
        write!(f, ", found {}", self.actual)
    }
}

macro_rules! from_detail {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self {
                Error::$variant(err)
            }
        })*
    };
}

from_detail! {
    std::io::Error => Io,
    ConnectionError => Connection,
    QueryError => Query,
    TypeError => Type,
    TransactionError => Transaction,
    ProtocolError => Protocol,
    PoolError => Pool,
    ConfigError => Config,
}

/// Result type alias for dqlite operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_code_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::Constraint,
            code: Some(2067),
            sql: Some("INSERT INTO t VALUES (1)".to_string()),
            message: "UNIQUE constraint failed: t.id".to_string(),
            source: None,
        };

        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.failure_code(), Some(2067));
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
        assert_eq!(
            err.to_string(),
            "Query error (code 2067): UNIQUE constraint failed: t.id"
        );
    }

    #[test]
    fn leader_errors_are_retryable_connection_errors() {
        let not_leader = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::NotLeader,
            message: "not leader".to_string(),
            source: None,
        });
        assert!(not_leader.is_leader_error());
        assert!(not_leader.is_retryable());
        assert!(not_leader.is_connection_error());

        let busy = Error::Query(QueryError {
            kind: QueryErrorKind::Busy,
            code: Some(5),
            sql: None,
            message: "database is locked".to_string(),
            source: None,
        });
        assert!(busy.is_retryable());
        assert!(!busy.is_leader_error());
        assert!(!busy.is_connection_error());
    }

    #[test]
    fn leader_codes_match_sqlite_extended_codes() {
        assert_eq!(SQLITE_IOERR_NOT_LEADER, 10250);
        assert_eq!(SQLITE_IOERR_LEADERSHIP_LOST, 10506);
    }

    #[test]
    fn io_error_is_exposed_as_source() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::other("boom"));
        assert!(err.source().is_some());
        assert!(err.is_connection_error());
    }
}
