//! Connection pooling for dqlite.
//!
//! Two pools, matching the two dialects:
//!
//! - [`NullPool`]: every checkout opens a new connection and returning it
//!   closes it. The synchronous dialect uses this.
//! - [`QueuePool`]: keeps up to `pool_size` idle connections and lets
//!   `max_overflow` extra connections exist while the pool is busy. The
//!   async dialect uses this.
//!
//! Pools are generic over the connection type and never open connections
//! themselves:
//!
//! ```ignore
//! let conn = match pool.try_checkout()? {
//!     Checkout::Reused(conn) => conn,
//!     Checkout::Open(slot) => slot.fill(DqliteConnection::connect(config)?),
//! };
//! ```

pub mod config;
pub mod pool;

pub use config::{PoolConfig, PoolKind, PoolStats};
pub use pool::{Checkout, NullPool, Pool, PooledConnection, QueuePool, Reservation};
