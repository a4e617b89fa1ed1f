//! dqlite client.
//!
//! `dqlite-client` finds the leader of a dqlite cluster, opens a database on
//! it and runs statements over the dqlite wire protocol.
//!
//! # Connections
//!
//! - [`DqliteConnection`]: blocking sockets behind a mutex; implements
//!   `Connection` with ready futures and works from any thread
//! - [`DqliteAsyncConnection`]: asupersync sockets, `&mut self` methods
//! - [`SharedDqliteConnection`]: the async connection behind an async
//!   mutex, implementing `Connection`
//!
//! # Leader changes
//!
//! A `not leader` or `leadership lost` failure, or a dead socket, marks the
//! connection broken. The next call runs leader discovery once more before
//! sending its request; if that fails too the call returns the original
//! error kind with the discovery failure attached.
//!
//! # Example
//!
//! ```rust,ignore
//! use dqlite_client::{DqliteConfig, DqliteConnection};
//!
//! let config = DqliteConfig::new()
//!     .addresses(["node1:9001", "node2:9001", "node3:9001"])
//!     .database("app");
//! let conn = DqliteConnection::connect(config)?;
//! let rows = conn.query_sync("SELECT id, name FROM users WHERE id = ?", &[Value::BigInt(1)])?;
//! ```

pub mod async_connection;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod protocol;
#[cfg(any(test, feature = "test-server"))]
pub mod testing;
pub mod transport;

pub use async_connection::{DqliteAsyncConnection, SharedDqliteConnection, SharedDqliteTransaction};
pub use config::{DEFAULT_DATABASE, DEFAULT_PORT, DqliteConfig, parse_address};
pub use connection::{ConnectionState, DqliteConnection, DqliteTransaction};
pub use dqlite_wire::{NodeInfo, NodeRole};
pub use protocol::{ExecResult, NodeMetadata, QueryResult};
