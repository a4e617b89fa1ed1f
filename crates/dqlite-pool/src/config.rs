//! Pool configuration and statistics.

use std::time::Duration;

/// Which pool an engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// A fresh connection per checkout, closed on return
    Null,
    /// Idle connections are kept and reused
    Queue,
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept for reuse
    pub pool_size: usize,
    /// Connections allowed beyond `pool_size`; these are closed on return
    pub max_overflow: usize,
    /// How long a blocking checkout waits for a free slot
    pub acquire_timeout: Duration,
    /// Close connections older than this instead of reusing them
    pub recycle: Option<Duration>,
    /// Ping reused connections before handing them out
    pub pre_ping: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            acquire_timeout: Duration::from_secs(30),
            recycle: None,
            pre_ping: false,
        }
    }
}

impl PoolConfig {
    /// Create a configuration keeping `pool_size` idle connections.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn max_overflow(mut self, n: usize) -> Self {
        self.max_overflow = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the maximum connection age.
    pub fn recycle(mut self, age: Duration) -> Self {
        self.recycle = Some(age);
        self
    }

    pub fn pre_ping(mut self, enabled: bool) -> Self {
        self.pre_ping = enabled;
        self
    }

    /// Most connections that may be live at once.
    pub fn max_connections(&self) -> usize {
        self.pool_size.saturating_add(self.max_overflow)
    }

    pub(crate) fn expired(&self, age: Duration) -> bool {
        self.recycle.is_some_and(|limit| age >= limit)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections (checked out + idle + being opened)
    pub total_connections: usize,
    /// Connections waiting in the pool
    pub idle_connections: usize,
    /// Connections handed out
    pub active_connections: usize,
    /// Threads blocked in a checkout
    pub pending_requests: usize,
    /// Connections opened over the pool's lifetime
    pub opened: u64,
    /// Connections closed over the pool's lifetime
    pub closed: u64,
}
