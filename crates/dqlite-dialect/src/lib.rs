//! dqlite dialects for SQLModel Rust.
//!
//! Two URL schemes select a dialect:
//!
//! - `dqlite://host:port/database` uses [`DqliteDialect`] over the blocking
//!   [`DqliteConnection`](dqlite_client::DqliteConnection) with a null pool
//! - `dqlite+aio://host:port/database` uses [`DqliteAioDialect`] over
//!   [`SharedDqliteConnection`](dqlite_client::SharedDqliteConnection) with a
//!   queue pool
//!
//! Host defaults to `localhost`, port to `9001` and database to `default`.
//! Query keys `connect_timeout`, `request_timeout`, `max_attempts`,
//! `pool_size` and `max_overflow` tune the client and pool.
//!
//! Statements go through DB-API style cursors. dqlite binds positionally,
//! so `$N`, `?N` and `:name` placeholders are rewritten to `?` first.
//!
//! ```ignore
//! use dqlite_core::Value;
//! use dqlite_dialect::create_engine;
//!
//! let engine = create_engine("dqlite://node1:9001/app")?;
//! let conn = engine.connect()?;
//! conn.begin()?;
//! conn.execute("INSERT INTO users (name) VALUES (?)", &[Value::Text("ann".into())])?;
//! conn.commit()?;
//! ```

pub mod cursor;
pub mod dialect;
pub mod engine;
pub mod paramstyle;
pub mod registry;
pub mod url;

pub use cursor::{AsyncAdaptedCursor, ColumnDescription, Cursor, ResultBuffer, returns_rows};
pub use dialect::{
    Capabilities, ConnectArgs, DQLITE_CAPABILITIES, DQLITE_DBAPI, DbApi, Dialect, DqliteAioDialect,
    DqliteDialect, FALLBACK_SERVER_VERSION, NO_ACTIVE_TRANSACTION, is_no_active_transaction,
    parse_server_version,
};
pub use engine::{
    AsyncEngine, AsyncEngineConnection, Engine, EngineConnection, create_async_engine,
    create_engine,
};
pub use paramstyle::{ParamStyle, to_qmark, to_qmark_named};
pub use registry::DialectRegistry;
pub use url::DatabaseUrl;
