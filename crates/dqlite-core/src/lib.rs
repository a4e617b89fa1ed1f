//! Core types and traits shared by the dqlite crates.
//!
//! - `Connection` and `TransactionOps` for async database access
//! - `Value` and `Row` for parameters and results
//! - `Error` for everything that can go wrong on the way to the cluster
//! - `Outcome` and `Cx` re-exported from asupersync

pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod row;
pub mod value;

pub use connection::{
    Connection, IsolationLevel, PreparedStatement, TransactionOps, validate_savepoint_name,
};
pub use error::{Error, Result};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
