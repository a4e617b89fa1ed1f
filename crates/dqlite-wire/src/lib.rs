//! dqlite wire protocol.
//!
//! Every message is an 8-byte header followed by a body whose length is a
//! whole number of 8-byte words:
//! - 4 bytes: body length in words (little-endian)
//! - 1 byte: message type
//! - 1 byte: schema (request) or revision (response)
//! - 2 bytes: reserved
//!
//! A connection opens with the client sending the protocol version as a
//! little-endian u64. After that the client sends one request at a time and
//! reads its response; there is no pipelining.

pub mod reader;
pub mod request;
pub mod response;
pub mod time;
pub mod tuple;
pub mod writer;

pub use reader::WireReader;
pub use request::Request;
pub use response::{NodeInfo, NodeRole, Response, RowsBatch};
pub use writer::WireWriter;

use dqlite_core::error::{Error, ProtocolError};

/// Protocol version sent during the handshake.
pub const PROTOCOL_VERSION: u64 = 1;

/// Pre-1.0 protocol version. Recognised but never sent.
pub const PROTOCOL_VERSION_LEGACY: u64 = 0x8610_4dd7_6043_3fe5;

/// Size of a protocol word in bytes.
pub const WORD_SIZE: usize = 8;

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest message body accepted from a peer.
///
/// Servers split large result sets into `Rows` batches well below this.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Terminates the final `Rows` batch of a result set.
pub const ROWS_DONE: u64 = 0xEEEE_EEEE_EEEE_EEEE;

/// Terminates a `Rows` batch that will be followed by another one.
pub const ROWS_PART: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Request message types.
pub mod request_type {
    pub const LEADER: u8 = 0;
    pub const CLIENT: u8 = 1;
    pub const HEARTBEAT: u8 = 2;
    pub const OPEN: u8 = 3;
    pub const PREPARE: u8 = 4;
    pub const EXEC: u8 = 5;
    pub const QUERY: u8 = 6;
    pub const FINALIZE: u8 = 7;
    pub const EXEC_SQL: u8 = 8;
    pub const QUERY_SQL: u8 = 9;
    pub const INTERRUPT: u8 = 10;
    pub const CLUSTER: u8 = 16;
    pub const DESCRIBE: u8 = 18;
}

/// Response message types.
pub mod response_type {
    pub const FAILURE: u8 = 0;
    pub const SERVER: u8 = 1;
    pub const WELCOME: u8 = 2;
    pub const SERVERS: u8 = 3;
    pub const DB: u8 = 4;
    pub const STMT: u8 = 5;
    pub const RESULT: u8 = 6;
    pub const ROWS: u8 = 7;
    pub const EMPTY: u8 = 8;
    pub const METADATA: u8 = 10;
}

/// Value type codes used in parameter and row tuples.
pub mod value_type {
    pub const INTEGER: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const TEXT: u8 = 3;
    pub const BLOB: u8 = 4;
    pub const NULL: u8 = 5;
    pub const UNIXTIME: u8 = 9;
    pub const ISO8601: u8 = 10;
    pub const BOOLEAN: u8 = 11;
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length in 8-byte words
    pub words: u32,
    /// Message type
    pub kind: u8,
    /// Schema (requests) or revision (responses)
    pub schema: u8,
}

impl Header {
    /// Parse a header from its 8 raw bytes.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            words: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            kind: bytes[4],
            schema: bytes[5],
        }
    }

    /// Encode the header to its 8 raw bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let w = self.words.to_le_bytes();
        [w[0], w[1], w[2], w[3], self.kind, self.schema, 0, 0]
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> usize {
        self.words as usize * WORD_SIZE
    }

    /// Body length in bytes, refusing bodies over [`MAX_MESSAGE_SIZE`].
    ///
    /// Check this before allocating: a peer that is not a dqlite node (an
    /// HTTP server, say) produces arbitrary lengths.
    #[allow(clippy::result_large_err)]
    pub fn checked_body_len(&self) -> Result<usize, Error> {
        let len = self.body_len();
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(ProtocolError {
                message: format!(
                    "message body of {} bytes exceeds the {} byte limit",
                    len, MAX_MESSAGE_SIZE
                ),
                raw_data: Some(self.to_bytes().to_vec()),
                source: None,
            }));
        }
        Ok(len)
    }
}

/// Encode the handshake sent right after the TCP connection is established.
pub fn handshake() -> [u8; WORD_SIZE] {
    PROTOCOL_VERSION.to_le_bytes()
}

/// Number of zero bytes needed to pad `len` to a word boundary.
pub const fn padding(len: usize) -> usize {
    (WORD_SIZE - len % WORD_SIZE) % WORD_SIZE
}

/// Build a protocol error.
pub fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}
