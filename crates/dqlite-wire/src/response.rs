//! Response decoders.

use crate::tuple::{decode_row, encode_row, read_string, truncated};
use crate::{Header, ROWS_DONE, ROWS_PART, WireReader, WireWriter, protocol_error, response_type};
use dqlite_core::Value;
use dqlite_core::error::Result;
use std::fmt;

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Votes in elections and replicates the log
    Voter,
    /// Replicates the log without voting
    StandBy,
    /// Neither votes nor replicates
    Spare,
}

impl NodeRole {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(NodeRole::Voter),
            1 => Some(NodeRole::StandBy),
            2 => Some(NodeRole::Spare),
            _ => None,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            NodeRole::Voter => 0,
            NodeRole::StandBy => 1,
            NodeRole::Spare => 2,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Voter => write!(f, "voter"),
            NodeRole::StandBy => write!(f, "stand-by"),
            NodeRole::Spare => write!(f, "spare"),
        }
    }
}

/// One member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: u64,
    pub address: String,
    pub role: NodeRole,
}

/// One `Rows` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowsBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Another `Rows` message follows (the batch ended with the PART marker).
    pub more: bool,
}

/// A server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Failure {
        code: u64,
        message: String,
    },
    /// Leader address. Empty when no leader is known.
    Server {
        id: u64,
        address: String,
    },
    Welcome {
        heartbeat_timeout: u64,
    },
    Servers(Vec<NodeInfo>),
    Db {
        id: u32,
    },
    Stmt {
        db: u32,
        id: u32,
        params: u64,
    },
    Result {
        last_insert_id: u64,
        rows_affected: u64,
    },
    Rows(RowsBatch),
    Empty,
    Metadata {
        failure_domain: u64,
        weight: u64,
    },
}

impl Response {
    /// Wire type code of this response.
    pub fn kind(&self) -> u8 {
        match self {
            Response::Failure { .. } => response_type::FAILURE,
            Response::Server { .. } => response_type::SERVER,
            Response::Welcome { .. } => response_type::WELCOME,
            Response::Servers(_) => response_type::SERVERS,
            Response::Db { .. } => response_type::DB,
            Response::Stmt { .. } => response_type::STMT,
            Response::Result { .. } => response_type::RESULT,
            Response::Rows(_) => response_type::ROWS,
            Response::Empty => response_type::EMPTY,
            Response::Metadata { .. } => response_type::METADATA,
        }
    }

    /// Short name for logging and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Response::Failure { .. } => "failure",
            Response::Server { .. } => "server",
            Response::Welcome { .. } => "welcome",
            Response::Servers(_) => "servers",
            Response::Db { .. } => "db",
            Response::Stmt { .. } => "stmt",
            Response::Result { .. } => "result",
            Response::Rows(_) => "rows",
            Response::Empty => "empty",
            Response::Metadata { .. } => "metadata",
        }
    }

    /// Decode a response body.
    #[allow(clippy::result_large_err)]
    pub fn decode(header: &Header, body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let response = match header.kind {
            response_type::FAILURE => Response::Failure {
                code: read_u64(&mut r, "failure code")?,
                message: read_string(&mut r)?,
            },
            response_type::SERVER => Response::Server {
                id: read_u64(&mut r, "server id")?,
                address: read_string(&mut r)?,
            },
            response_type::WELCOME => Response::Welcome {
                heartbeat_timeout: read_u64(&mut r, "heartbeat timeout")?,
            },
            response_type::SERVERS => {
                let count = read_u64(&mut r, "server count")?;
                let mut nodes = Vec::new();
                for _ in 0..count {
                    let id = read_u64(&mut r, "node id")?;
                    let address = read_string(&mut r)?;
                    let code = read_u64(&mut r, "node role")?;
                    let role = NodeRole::from_code(code)
                        .ok_or_else(|| protocol_error(format!("unknown node role {}", code)))?;
                    nodes.push(NodeInfo { id, address, role });
                }
                Response::Servers(nodes)
            }
            response_type::DB => {
                let id = r.read_u32().ok_or_else(|| truncated("db id"))?;
                r.read_u32().ok_or_else(|| truncated("db padding"))?;
                Response::Db { id }
            }
            response_type::STMT => Response::Stmt {
                db: r.read_u32().ok_or_else(|| truncated("db id"))?,
                id: r.read_u32().ok_or_else(|| truncated("stmt id"))?,
                params: read_u64(&mut r, "stmt params")?,
            },
            response_type::RESULT => Response::Result {
                last_insert_id: read_u64(&mut r, "last insert id")?,
                rows_affected: read_u64(&mut r, "rows affected")?,
            },
            response_type::ROWS => Response::Rows(decode_rows(&mut r)?),
            response_type::EMPTY => Response::Empty,
            response_type::METADATA => Response::Metadata {
                failure_domain: read_u64(&mut r, "failure domain")?,
                weight: read_u64(&mut r, "weight")?,
            },
            other => return Err(protocol_error(format!("unknown response type {}", other))),
        };
        Ok(response)
    }

    /// Encode the response as a complete frame. Used by the test server.
    #[allow(clippy::result_large_err, clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        match self {
            Response::Failure { code, message } => {
                w.write_u64(*code);
                w.write_text(message);
            }
            Response::Server { id, address } => {
                w.write_u64(*id);
                w.write_text(address);
            }
            Response::Welcome { heartbeat_timeout } => w.write_u64(*heartbeat_timeout),
            Response::Servers(nodes) => {
                w.write_u64(nodes.len() as u64);
                for node in nodes {
                    w.write_u64(node.id);
                    w.write_text(&node.address);
                    w.write_u64(node.role.code());
                }
            }
            Response::Db { id } => {
                w.write_u32(*id);
                w.write_u32(0);
            }
            Response::Stmt { db, id, params } => {
                w.write_u32(*db);
                w.write_u32(*id);
                w.write_u64(*params);
            }
            Response::Result {
                last_insert_id,
                rows_affected,
            } => {
                w.write_u64(*last_insert_id);
                w.write_u64(*rows_affected);
            }
            Response::Rows(batch) => {
                w.write_u64(batch.columns.len() as u64);
                for name in &batch.columns {
                    w.write_text(name);
                }
                for row in &batch.rows {
                    encode_row(&mut w, row)?;
                }
                w.write_u64(if batch.more { ROWS_PART } else { ROWS_DONE });
            }
            Response::Empty => w.write_u64(0),
            Response::Metadata {
                failure_domain,
                weight,
            } => {
                w.write_u64(*failure_domain);
                w.write_u64(*weight);
            }
        }
        Ok(w.into_frame(self.kind(), 0))
    }
}

#[allow(clippy::result_large_err)]
fn read_u64(r: &mut WireReader<'_>, what: &str) -> Result<u64> {
    r.read_u64().ok_or_else(|| truncated(what))
}

#[allow(clippy::result_large_err)]
fn decode_rows(r: &mut WireReader<'_>) -> Result<RowsBatch> {
    let count = read_u64(r, "column count")?;
    let count = usize::try_from(count)
        .map_err(|_| protocol_error(format!("column count {} out of range", count)))?;
    let mut columns = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        columns.push(read_string(r)?);
    }

    let mut rows = Vec::new();
    loop {
        match r.peek_u64() {
            Some(ROWS_DONE) => {
                r.read_u64();
                return Ok(RowsBatch {
                    columns,
                    rows,
                    more: false,
                });
            }
            Some(ROWS_PART) => {
                r.read_u64();
                return Ok(RowsBatch {
                    columns,
                    rows,
                    more: true,
                });
            }
            Some(_) if count > 0 => rows.push(decode_row(r, count)?),
            _ => return Err(protocol_error("rows response missing end marker")),
        }
    }
}
