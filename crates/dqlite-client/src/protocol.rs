//! Interpreting responses.
//!
//! Both connection flavours send the same requests and expect the same
//! answers, so the mapping from `Response` to results and errors lives
//! here.

use std::sync::Arc;

use dqlite_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind,
    SQLITE_IOERR_LEADERSHIP_LOST, SQLITE_IOERR_NOT_LEADER,
};
use dqlite_core::{ColumnInfo, Error, PreparedStatement, Result, Row, Value};
use dqlite_wire::{NodeInfo, NodeRole, Response, RowsBatch};

/// Node failure domain and weight, as reported by `Describe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMetadata {
    pub failure_domain: u64,
    pub weight: u64,
}

/// Outcome of an `ExecSql`/`Exec` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
}

/// Rows of a query with their column names.
///
/// `columns` is filled from the first batch even when it carries no rows.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Arc<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn column_names(&self) -> &[String] {
        self.columns.names()
    }
}

/// Map a `Failure` response to an error.
pub(crate) fn failure_error(code: u64, message: String, sql: Option<&str>) -> Error {
    match code {
        SQLITE_IOERR_NOT_LEADER => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::NotLeader,
            message: format!("not leader: {}", message),
            source: None,
        }),
        SQLITE_IOERR_LEADERSHIP_LOST => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::LeadershipLost,
            message: format!("leadership lost: {}", message),
            source: None,
        }),
        _ => {
            let kind = match code & 0xff {
                1 if message.contains("syntax error") => QueryErrorKind::Syntax,
                1 if message.contains("no such") => QueryErrorKind::NotFound,
                5 | 6 => QueryErrorKind::Busy,
                9 => QueryErrorKind::Interrupted,
                3 | 8 | 23 => QueryErrorKind::Permission,
                19 => QueryErrorKind::Constraint,
                _ => QueryErrorKind::Database,
            };
            Error::Query(QueryError {
                kind,
                code: Some(code),
                sql: sql.map(str::to_string),
                message,
                source: None,
            })
        }
    }
}

/// Error for a response that is not the one the request calls for.
pub(crate) fn unexpected(response: Response, expected: &str, sql: Option<&str>) -> Error {
    match response {
        Response::Failure { code, message } => failure_error(code, message, sql),
        other => Error::Protocol(ProtocolError {
            message: format!("expected {} response, got {}", expected, other.name()),
            raw_data: None,
            source: None,
        }),
    }
}

pub(crate) fn connection_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn query_error_msg(kind: QueryErrorKind, msg: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind,
        code: None,
        sql: None,
        message: msg.into(),
        source: None,
    })
}

#[allow(clippy::result_large_err)]
pub(crate) fn expect_welcome(response: Response) -> Result<u64> {
    match response {
        Response::Welcome { heartbeat_timeout } => Ok(heartbeat_timeout),
        other => Err(unexpected(other, "welcome", None)),
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn expect_db(response: Response) -> Result<u32> {
    match response {
        Response::Db { id } => Ok(id),
        other => Err(unexpected(other, "db", None)),
    }
}

/// Leader reported by a `Server` response; `None` when no leader is known.
#[allow(clippy::result_large_err)]
pub(crate) fn expect_leader(response: Response) -> Result<Option<NodeInfo>> {
    match response {
        Response::Server { address, .. } if address.is_empty() => Ok(None),
        Response::Server { id, address } => Ok(Some(NodeInfo {
            id,
            address,
            role: NodeRole::Voter,
        })),
        other => Err(unexpected(other, "server", None)),
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn expect_servers(response: Response) -> Result<Vec<NodeInfo>> {
    match response {
        Response::Servers(nodes) => Ok(nodes),
        other => Err(unexpected(other, "servers", None)),
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn expect_metadata(response: Response) -> Result<NodeMetadata> {
    match response {
        Response::Metadata {
            failure_domain,
            weight,
        } => Ok(NodeMetadata {
            failure_domain,
            weight,
        }),
        other => Err(unexpected(other, "metadata", None)),
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn expect_result(response: Response, sql: &str) -> Result<ExecResult> {
    match response {
        Response::Result {
            last_insert_id,
            rows_affected,
        } => Ok(ExecResult {
            last_insert_id: last_insert_id as i64,
            rows_affected,
        }),
        other => Err(unexpected(other, "result", Some(sql))),
    }
}

/// Statement id and parameter count from a `Stmt` response.
#[allow(clippy::result_large_err)]
pub(crate) fn expect_stmt(response: Response, sql: &str) -> Result<(u32, usize)> {
    match response {
        Response::Stmt { id, params, .. } => {
            let params = usize::try_from(params).map_err(|_| {
                dqlite_wire::protocol_error(format!("parameter count {} out of range", params))
            })?;
            Ok((id, params))
        }
        other => Err(unexpected(other, "stmt", Some(sql))),
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn expect_empty(response: Response, sql: Option<&str>) -> Result<()> {
    match response {
        Response::Empty => Ok(()),
        other => Err(unexpected(other, "empty", sql)),
    }
}

/// Drain the responses to an `Interrupt` up to its `Empty`.
///
/// Any `Rows` still buffered for the interrupted query arrive first and are
/// discarded.
#[allow(clippy::result_large_err)]
pub(crate) fn interrupt_drained(response: Response) -> Result<bool> {
    match response {
        Response::Empty => Ok(true),
        Response::Rows(_) => Ok(false),
        other => Err(unexpected(other, "empty", None)),
    }
}

/// Accumulates `Rows` batches into rows sharing one column table.
#[derive(Debug, Default)]
pub(crate) struct RowCollector {
    columns: Option<Arc<ColumnInfo>>,
    rows: Vec<Row>,
}

impl RowCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add the next response. Returns true while more batches follow.
    #[allow(clippy::result_large_err)]
    pub(crate) fn push(&mut self, response: Response, sql: &str) -> Result<bool> {
        let RowsBatch {
            columns,
            rows,
            more,
        } = match response {
            Response::Rows(batch) => batch,
            other => return Err(unexpected(other, "rows", Some(sql))),
        };
        let info = self
            .columns
            .get_or_insert_with(|| Arc::new(ColumnInfo::new(columns)));
        self.rows.extend(
            rows.into_iter()
                .map(|values| Row::with_columns(Arc::clone(info), values)),
        );
        Ok(more)
    }

    pub(crate) fn finish(self) -> QueryResult {
        QueryResult {
            columns: self
                .columns
                .unwrap_or_else(|| Arc::new(ColumnInfo::new(Vec::new()))),
            rows: self.rows,
        }
    }
}

/// Pack a statement id with the connection generation it belongs to.
pub(crate) fn statement_handle(
    generation: u32,
    stmt: u32,
    sql: &str,
    params: usize,
) -> PreparedStatement {
    PreparedStatement::new(
        (u64::from(generation) << 32) | u64::from(stmt),
        sql.to_string(),
        params,
    )
}

/// Statement id for a handle prepared on this connection generation.
#[allow(clippy::result_large_err, clippy::cast_possible_truncation)]
pub(crate) fn statement_id(stmt: &PreparedStatement, generation: u32) -> Result<u32> {
    if (stmt.id() >> 32) as u32 != generation {
        return Err(query_error_msg(
            QueryErrorKind::NotFound,
            "prepared statement belongs to a previous connection",
        ));
    }
    Ok(stmt.id() as u32)
}

/// Statement id, after checking the parameter count against the handle.
#[allow(clippy::result_large_err)]
pub(crate) fn bound_statement_id(
    stmt: &PreparedStatement,
    generation: u32,
    params: &[Value],
) -> Result<u32> {
    if !stmt.validate_params(params) {
        return Err(query_error_msg(
            QueryErrorKind::Database,
            format!(
                "prepared statement expects {} parameters, got {}",
                stmt.param_count(),
                params.len()
            ),
        ));
    }
    statement_id(stmt, generation)
}

/// Why a connection had to be abandoned.
#[derive(Debug, Clone)]
pub(crate) struct Broken {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl Broken {
    /// Does this error leave the socket unusable or pointed at a follower?
    pub(crate) fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::Connection(c) => Some(Self {
                kind: c.kind,
                message: c.message.clone(),
            }),
            Error::Protocol(_) | Error::Io(_) | Error::Timeout => Some(Self {
                kind: ConnectionErrorKind::Disconnected,
                message: err.to_string(),
            }),
            _ => None,
        }
    }

    /// Error returned when rediscovery after this break failed too.
    pub(crate) fn rediscovery_failed(&self, err: Error) -> Error {
        Error::Connection(ConnectionError {
            kind: self.kind,
            message: format!("{}; rediscovery failed: {}", self.message, err),
            source: Some(Box::new(err)),
        })
    }
}
