//! Request encoders.

use crate::tuple::{decode_params, encode_params, params_schema, read_string, truncated};
use crate::{Header, WireReader, WireWriter, protocol_error, request_type};
use dqlite_core::Value;
use dqlite_core::error::Result;

/// Cluster description format requesting id, address and role.
pub const CLUSTER_FORMAT_V1: u64 = 1;

/// A client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Ask for the current leader.
    Leader,
    /// Register the client id.
    Client { id: u64 },
    /// Keep-alive carrying a timestamp.
    Heartbeat { timestamp: u64 },
    /// Open a database by name.
    Open {
        name: String,
        flags: u64,
        vfs: String,
    },
    /// Prepare a statement.
    Prepare { db: u32, sql: String },
    /// Execute a prepared statement.
    Exec {
        db: u32,
        stmt: u32,
        params: Vec<Value>,
    },
    /// Query with a prepared statement.
    Query {
        db: u32,
        stmt: u32,
        params: Vec<Value>,
    },
    /// Finalize a prepared statement.
    Finalize { db: u32, stmt: u32 },
    /// Execute SQL text directly.
    ExecSql {
        db: u32,
        sql: String,
        params: Vec<Value>,
    },
    /// Query with SQL text directly.
    QuerySql {
        db: u32,
        sql: String,
        params: Vec<Value>,
    },
    /// Interrupt the statement running on a database.
    Interrupt { db: u32 },
    /// List the cluster members.
    Cluster { format: u64 },
    /// Describe the node (failure domain and weight).
    Describe { format: u64 },
}

impl Request {
    /// Wire type code of this request.
    pub fn kind(&self) -> u8 {
        match self {
            Request::Leader => request_type::LEADER,
            Request::Client { .. } => request_type::CLIENT,
            Request::Heartbeat { .. } => request_type::HEARTBEAT,
            Request::Open { .. } => request_type::OPEN,
            Request::Prepare { .. } => request_type::PREPARE,
            Request::Exec { .. } => request_type::EXEC,
            Request::Query { .. } => request_type::QUERY,
            Request::Finalize { .. } => request_type::FINALIZE,
            Request::ExecSql { .. } => request_type::EXEC_SQL,
            Request::QuerySql { .. } => request_type::QUERY_SQL,
            Request::Interrupt { .. } => request_type::INTERRUPT,
            Request::Cluster { .. } => request_type::CLUSTER,
            Request::Describe { .. } => request_type::DESCRIBE,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Leader => "leader",
            Request::Client { .. } => "client",
            Request::Heartbeat { .. } => "heartbeat",
            Request::Open { .. } => "open",
            Request::Prepare { .. } => "prepare",
            Request::Exec { .. } => "exec",
            Request::Query { .. } => "query",
            Request::Finalize { .. } => "finalize",
            Request::ExecSql { .. } => "exec_sql",
            Request::QuerySql { .. } => "query_sql",
            Request::Interrupt { .. } => "interrupt",
            Request::Cluster { .. } => "cluster",
            Request::Describe { .. } => "describe",
        }
    }

    /// Encode the request as a complete frame (header and body).
    #[allow(clippy::result_large_err)]
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        let mut schema = 0;
        match self {
            Request::Leader => w.write_u64(0),
            Request::Client { id } => w.write_u64(*id),
            Request::Heartbeat { timestamp } => w.write_u64(*timestamp),
            Request::Open { name, flags, vfs } => {
                w.write_text(name);
                w.write_u64(*flags);
                w.write_text(vfs);
            }
            Request::Prepare { db, sql } => {
                w.write_u64(u64::from(*db));
                w.write_text(sql);
            }
            Request::Exec { db, stmt, params } | Request::Query { db, stmt, params } => {
                w.write_u32(*db);
                w.write_u32(*stmt);
                schema = params_schema(params.len());
                encode_params(&mut w, params)?;
            }
            Request::Finalize { db, stmt } => {
                w.write_u32(*db);
                w.write_u32(*stmt);
            }
            Request::ExecSql { db, sql, params } | Request::QuerySql { db, sql, params } => {
                w.write_u64(u64::from(*db));
                w.write_text(sql);
                schema = params_schema(params.len());
                encode_params(&mut w, params)?;
            }
            Request::Interrupt { db } => w.write_u64(u64::from(*db)),
            Request::Cluster { format } | Request::Describe { format } => w.write_u64(*format),
        }
        Ok(w.into_frame(self.kind(), schema))
    }

    /// Decode a request body. The client never needs this; the in-process
    /// test server does.
    #[allow(clippy::result_large_err, clippy::cast_possible_truncation)]
    pub fn decode(header: &Header, body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let u64_field =
            |r: &mut WireReader<'_>, what: &str| r.read_u64().ok_or_else(|| truncated(what));
        let request = match header.kind {
            request_type::LEADER => {
                u64_field(&mut r, "leader")?;
                Request::Leader
            }
            request_type::CLIENT => Request::Client {
                id: u64_field(&mut r, "client id")?,
            },
            request_type::HEARTBEAT => Request::Heartbeat {
                timestamp: u64_field(&mut r, "heartbeat")?,
            },
            request_type::OPEN => Request::Open {
                name: read_string(&mut r)?,
                flags: u64_field(&mut r, "open flags")?,
                vfs: read_string(&mut r)?,
            },
            request_type::PREPARE => Request::Prepare {
                db: u64_field(&mut r, "db id")? as u32,
                sql: read_string(&mut r)?,
            },
            request_type::EXEC | request_type::QUERY => {
                let db = r.read_u32().ok_or_else(|| truncated("db id"))?;
                let stmt = r.read_u32().ok_or_else(|| truncated("stmt id"))?;
                let params = decode_params(&mut r, header.schema)?;
                if header.kind == request_type::EXEC {
                    Request::Exec { db, stmt, params }
                } else {
                    Request::Query { db, stmt, params }
                }
            }
            request_type::FINALIZE => Request::Finalize {
                db: r.read_u32().ok_or_else(|| truncated("db id"))?,
                stmt: r.read_u32().ok_or_else(|| truncated("stmt id"))?,
            },
            request_type::EXEC_SQL | request_type::QUERY_SQL => {
                let db = u64_field(&mut r, "db id")? as u32;
                let sql = read_string(&mut r)?;
                let params = decode_params(&mut r, header.schema)?;
                if header.kind == request_type::EXEC_SQL {
                    Request::ExecSql { db, sql, params }
                } else {
                    Request::QuerySql { db, sql, params }
                }
            }
            request_type::INTERRUPT => Request::Interrupt {
                db: u64_field(&mut r, "db id")? as u32,
            },
            request_type::CLUSTER => Request::Cluster {
                format: u64_field(&mut r, "cluster format")?,
            },
            request_type::DESCRIBE => Request::Describe {
                format: u64_field(&mut r, "describe format")?,
            },
            other => return Err(protocol_error(format!("unknown request type {}", other))),
        };
        Ok(request)
    }
}
