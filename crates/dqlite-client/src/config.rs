//! dqlite connection configuration.
//!
//! A configuration names a seed list of cluster nodes rather than a single
//! server. The client asks the seeds who the leader is and talks to that
//! node.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use dqlite_core::Error;
use dqlite_core::error::{ConnectionError, ConnectionErrorKind};

/// Port dqlite nodes listen on when none is given.
pub const DEFAULT_PORT: u16 = 9001;

/// Database opened when none is given.
pub const DEFAULT_DATABASE: &str = "default";

/// dqlite connection configuration.
#[derive(Debug, Clone)]
pub struct DqliteConfig {
    /// Cluster seed list as `host:port` strings
    pub addresses: Vec<String>,
    /// Database name to open on the leader (default: "default")
    pub database: String,
    /// Timeout for each TCP connect
    pub connect_timeout: Duration,
    /// Timeout for reading a response (sync connections)
    pub request_timeout: Duration,
    /// Leader discovery rounds before giving up
    pub max_attempts: u32,
    /// Sleep before the second round; doubled for each later round
    pub retry_backoff: Duration,
    /// Visit seeds in random order each round
    pub shuffle_nodes: bool,
    /// Client id registered with the leader
    pub client_id: u64,
}

impl Default for DqliteConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            database: DEFAULT_DATABASE.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            shuffle_nodes: true,
            client_id: rand::random(),
        }
    }
}

impl DqliteConfig {
    /// Create a new configuration with default values and no seeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration with a single seed.
    pub fn from_address(address: impl Into<String>) -> Self {
        Self::new().address(address)
    }

    /// Add a seed node.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    /// Replace the seed list.
    pub fn addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the number of leader discovery rounds (at least one).
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn shuffle_nodes(mut self, enabled: bool) -> Self {
        self.shuffle_nodes = enabled;
        self
    }

    pub fn client_id(mut self, id: u64) -> Self {
        self.client_id = id;
        self
    }

    /// Backoff to sleep after `round` (0-based) failed.
    pub fn backoff_after(&self, round: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(round.min(16)))
    }

    /// Seeds in the order one discovery round should visit them.
    pub fn seed_order(&self) -> Vec<String> {
        let mut seeds = self.addresses.clone();
        if self.shuffle_nodes {
            use rand::seq::SliceRandom;
            seeds.shuffle(&mut rand::thread_rng());
        }
        seeds
    }
}

/// Split `host`, `host:port` or `[v6]:port` into host and port.
///
/// The port defaults to 9001. Bracketed IPv6 hosts are returned without
/// the brackets; an unbracketed string with several colons is taken as a
/// bare IPv6 address.
#[allow(clippy::result_large_err)]
pub fn parse_address(address: &str) -> Result<(String, u16), Error> {
    let address = address.trim();
    if address.is_empty() {
        return Err(invalid_address(address, "empty address"));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid_address(address, "missing ']'"))?;
        let port = match tail {
            "" => DEFAULT_PORT,
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| invalid_address(address, "expected ':' after ']'"))?;
                parse_port(address, port)?
            }
        };
        return Ok((host.to_string(), port));
    }

    match address.matches(':').count() {
        0 => Ok((address.to_string(), DEFAULT_PORT)),
        1 => {
            let (host, port) = address
                .split_once(':')
                .ok_or_else(|| invalid_address(address, "bad port"))?;
            if host.is_empty() {
                return Err(invalid_address(address, "empty host"));
            }
            Ok((host.to_string(), parse_port(address, port)?))
        }
        _ => Ok((address.to_string(), DEFAULT_PORT)),
    }
}

/// Resolve a node address to the socket addresses to dial.
#[allow(clippy::result_large_err)]
pub fn resolve_address(address: &str) -> Result<Vec<SocketAddr>, Error> {
    let (host, port) = parse_address(address)?;
    let addrs: Vec<SocketAddr> = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::DnsResolution,
                message: format!("Failed to resolve {}: {}", address, e),
                source: Some(Box::new(e)),
            })
        })?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::DnsResolution,
            message: format!("No addresses found for {}", address),
            source: None,
        }));
    }
    Ok(addrs)
}

#[allow(clippy::result_large_err)]
fn parse_port(address: &str, port: &str) -> Result<u16, Error> {
    port.parse::<u16>()
        .map_err(|_| invalid_address(address, "bad port"))
}

fn invalid_address(address: &str, reason: &str) -> Error {
    Error::config(format!("invalid node address {:?}: {}", address, reason))
}
