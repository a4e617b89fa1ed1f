//! Leader discovery.
//!
//! Any node can say who the leader is, but only the leader runs statements.
//! Discovery walks the seed list asking each node with a `Leader` request:
//!
//! - an empty answer means the cluster has no leader yet, try the next seed
//! - an answer naming the node we asked keeps that socket
//! - any other answer is dialed and becomes the connection
//!
//! A round that finds nobody is retried after a backoff that doubles each
//! round, up to `max_attempts` rounds.

use std::net::SocketAddr;
use std::time::Duration;

use asupersync::time::{sleep, wall_now};
use asupersync::types::Time;
use dqlite_core::error::{ConnectionError, ConnectionErrorKind, Result};
use dqlite_core::{Cx, Error};
use dqlite_wire::{Request, Response};

use crate::config::{DqliteConfig, resolve_address};
use crate::protocol::expect_leader;
use crate::transport::{AsyncTransport, SyncTransport};

/// A transport connected to the node that claims leadership.
#[derive(Debug)]
pub struct Leader<T> {
    pub transport: T,
    /// Address of the leader as the cluster reports it
    pub address: String,
}

/// What one seed said about the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaderAnswer {
    Unknown,
    Here(String),
    Elsewhere(String),
}

impl LeaderAnswer {
    #[allow(clippy::result_large_err)]
    fn interpret(seed: &str, peer: SocketAddr, response: Response) -> Result<Self> {
        let Some(node) = expect_leader(response)? else {
            return Ok(LeaderAnswer::Unknown);
        };
        let is_self = node.address == seed
            || resolve_address(&node.address)
                .map(|addrs| addrs.contains(&peer))
                .unwrap_or(false);
        if is_self {
            Ok(LeaderAnswer::Here(node.address))
        } else {
            Ok(LeaderAnswer::Elsewhere(node.address))
        }
    }
}

/// Last failure seen for each node, in the order nodes were first tried.
#[derive(Debug, Default)]
struct Failures {
    nodes: Vec<(String, String)>,
}

impl Failures {
    fn record(&mut self, node: &str, err: &Error) {
        tracing::debug!(node = %node, error = %err, "Leader lookup failed");
        let message = err.to_string();
        match self.nodes.iter_mut().find(|(n, _)| n == node) {
            Some(entry) => entry.1 = message,
            None => self.nodes.push((node.to_string(), message)),
        }
    }

    fn into_error(self, attempts: u32) -> Error {
        let detail = self
            .nodes
            .iter()
            .map(|(node, message)| format!("{}: {}", node, message))
            .collect::<Vec<_>>()
            .join("; ");
        tracing::warn!(attempts, "No dqlite leader found");
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::NoLeader,
            message: format!(
                "no leader found after {} attempt(s): {}",
                attempts, detail
            ),
            source: None,
        })
    }
}

fn no_leader_known(seed: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::NoLeader,
        message: format!("{} does not know the leader", seed),
        source: None,
    })
}

#[allow(clippy::result_large_err)]
fn check_seeds(config: &DqliteConfig) -> Result<()> {
    if config.addresses.is_empty() {
        return Err(Error::config("no dqlite node addresses configured"));
    }
    Ok(())
}

/// Find the leader with blocking sockets.
#[tracing::instrument(level = "debug", skip(config), fields(seeds = config.addresses.len()))]
#[allow(clippy::result_large_err)]
pub fn find_leader(config: &DqliteConfig) -> Result<Leader<SyncTransport>> {
    check_seeds(config)?;
    let mut failures = Failures::default();
    for round in 0..config.max_attempts {
        if round > 0 {
            std::thread::sleep(config.backoff_after(round - 1));
        }
        for seed in config.seed_order() {
            match ask_seed(config, &seed) {
                Ok(leader) => {
                    tracing::debug!(leader = %leader.address, round, "Found dqlite leader");
                    return Ok(leader);
                }
                Err(e) => failures.record(&seed, &e),
            }
        }
    }
    Err(failures.into_error(config.max_attempts))
}

#[allow(clippy::result_large_err)]
fn ask_seed(config: &DqliteConfig, seed: &str) -> Result<Leader<SyncTransport>> {
    let mut transport =
        SyncTransport::dial(seed, config.connect_timeout, config.request_timeout)?;
    let response = transport.round_trip(&Request::Leader)?;
    match LeaderAnswer::interpret(seed, transport.peer(), response)? {
        LeaderAnswer::Unknown => Err(no_leader_known(seed)),
        LeaderAnswer::Here(address) => Ok(Leader { transport, address }),
        LeaderAnswer::Elsewhere(address) => {
            transport.shutdown();
            tracing::trace!(seed = %seed, leader = %address, "Redirected to leader");
            let transport =
                SyncTransport::dial(&address, config.connect_timeout, config.request_timeout)?;
            Ok(Leader { transport, address })
        }
    }
}

/// Find the leader with asupersync sockets.
///
/// Returns `Error::Cancelled` once `cx` is cancelled, checked before each
/// seed and throughout the backoff between rounds.
#[tracing::instrument(level = "debug", skip(cx, config), fields(seeds = config.addresses.len()))]
pub async fn find_leader_async(cx: &Cx, config: &DqliteConfig) -> Result<Leader<AsyncTransport>> {
    check_seeds(config)?;
    let mut failures = Failures::default();
    for round in 0..config.max_attempts {
        if round > 0 {
            backoff(cx, config.backoff_after(round - 1)).await?;
        }
        for seed in config.seed_order() {
            checkpoint(cx)?;
            match ask_seed_async(config, &seed).await {
                Ok(leader) => {
                    tracing::debug!(leader = %leader.address, round, "Found dqlite leader");
                    return Ok(leader);
                }
                Err(e) => failures.record(&seed, &e),
            }
        }
    }
    Err(failures.into_error(config.max_attempts))
}

async fn ask_seed_async(config: &DqliteConfig, seed: &str) -> Result<Leader<AsyncTransport>> {
    let mut transport = AsyncTransport::dial(seed, config.connect_timeout).await?;
    let response = transport.round_trip(&Request::Leader).await?;
    match LeaderAnswer::interpret(seed, transport.peer(), response)? {
        LeaderAnswer::Unknown => Err(no_leader_known(seed)),
        LeaderAnswer::Here(address) => Ok(Leader { transport, address }),
        LeaderAnswer::Elsewhere(address) => {
            drop(transport);
            tracing::trace!(seed = %seed, leader = %address, "Redirected to leader");
            let transport = AsyncTransport::dial(&address, config.connect_timeout).await?;
            Ok(Leader { transport, address })
        }
    }
}

/// Longest single sleep while backing off. Cancellation does not wake a
/// sleeping task, so it is noticed between slices.
const BACKOFF_SLICE: Duration = Duration::from_millis(20);

#[allow(clippy::result_large_err)]
fn checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| Error::Cancelled)
}

fn now(cx: &Cx) -> Time {
    cx.timer_driver().map_or_else(wall_now, |driver| driver.now())
}

/// Wait `delay` on the asupersync timer.
async fn backoff(cx: &Cx, delay: Duration) -> Result<()> {
    let deadline = now(cx) + delay;
    loop {
        checkpoint(cx)?;
        let current = now(cx);
        if current >= deadline {
            return Ok(());
        }
        let left = Duration::from_nanos(deadline.duration_since(current));
        sleep(current, left.min(BACKOFF_SLICE)).await;
    }
}
