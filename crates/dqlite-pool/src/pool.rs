//! Null and queue pools.
//!
//! Pools do not know how to open a connection. A checkout either hands back
//! an idle connection ([`Checkout::Reused`]) or a [`Reservation`] for a new
//! one, which the caller fills after connecting. Dropping an unfilled
//! reservation frees its slot, so a failed connect never leaks capacity.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use asupersync::sync::Notify;
use asupersync::time::{timeout, wall_now};
use asupersync::types::Time;
use dqlite_core::error::{PoolError, PoolErrorKind};
use dqlite_core::{Cx, Error, Outcome, Result};

use crate::config::{PoolConfig, PoolKind, PoolStats};

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

fn closed_error() -> Error {
    pool_error(PoolErrorKind::Closed, "pool is closed")
}

fn timed_out(after: Duration) -> Error {
    tracing::warn!(timeout = ?after, "Timed out waiting for a pooled connection");
    pool_error(
        PoolErrorKind::Timeout,
        format!("timed out after {:?} waiting for a connection", after),
    )
}

/// Longest single park of an async waiter; cancellation is checked between
/// parks.
const WAIT_SLICE: Duration = Duration::from_millis(20);

fn now(cx: &Cx) -> Time {
    cx.timer_driver().map_or_else(wall_now, |driver| driver.now())
}

/// Result of a checkout.
pub enum Checkout<C> {
    /// An idle connection from the pool
    Reused(PooledConnection<C>),
    /// A free slot; connect and call [`Reservation::fill`]
    Open(Reservation<C>),
}

impl<C> std::fmt::Debug for Checkout<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkout::Reused(_) => f.write_str("Checkout::Reused"),
            Checkout::Open(_) => f.write_str("Checkout::Open"),
        }
    }
}

enum Home<C> {
    Null(Arc<NullShared>),
    Queue(Arc<QueueShared<C>>),
}

impl<C> Clone for Home<C> {
    fn clone(&self) -> Self {
        match self {
            Home::Null(shared) => Home::Null(Arc::clone(shared)),
            Home::Queue(shared) => Home::Queue(Arc::clone(shared)),
        }
    }
}

impl<C> Home<C> {
    fn filled(&self) {
        match self {
            Home::Null(shared) => {
                shared.opened.fetch_add(1, Ordering::Relaxed);
            }
            Home::Queue(shared) => shared.lock().opened += 1,
        }
    }

    /// Give up a slot that never got a connection, or one whose connection
    /// was detached.
    fn release_slot(&self) {
        match self {
            Home::Null(shared) => {
                shared.active.fetch_sub(1, Ordering::Relaxed);
            }
            Home::Queue(shared) => {
                let mut state = shared.lock();
                state.live -= 1;
                state.checked_out -= 1;
                drop(state);
                shared.wake_one();
            }
        }
    }

    fn checkin(&self, conn: C, created: Instant, epoch: u64, invalid: bool) {
        match self {
            Home::Null(shared) => {
                shared.active.fetch_sub(1, Ordering::Relaxed);
                shared.closed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Closing connection returned to null pool");
                drop(conn);
            }
            Home::Queue(shared) => shared.checkin(conn, created, epoch, invalid),
        }
    }
}

/// A slot reserved for a connection the caller is about to open.
pub struct Reservation<C> {
    home: Option<Home<C>>,
    epoch: u64,
}

impl<C> Reservation<C> {
    /// Hand the freshly opened connection to the pool's accounting.
    pub fn fill(mut self, conn: C) -> PooledConnection<C> {
        let home = self.home.take();
        if let Some(home) = &home {
            home.filled();
        }
        PooledConnection {
            conn: Some(conn),
            created: Instant::now(),
            reused: false,
            invalid: false,
            epoch: self.epoch,
            home,
        }
    }
}

impl<C> Drop for Reservation<C> {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            tracing::debug!("Connection reservation released without a connection");
            home.release_slot();
        }
    }
}

/// A connection checked out of a pool.
///
/// Returns to its pool on drop unless [`invalidate`](Self::invalidate)d.
pub struct PooledConnection<C> {
    conn: Option<C>,
    created: Instant,
    reused: bool,
    invalid: bool,
    epoch: u64,
    home: Option<Home<C>>,
}

impl<C> PooledConnection<C> {
    /// Wrap a connection that belongs to no pool.
    pub fn new(conn: C) -> Self {
        Self {
            conn: Some(conn),
            created: Instant::now(),
            reused: false,
            invalid: false,
            epoch: 0,
            home: None,
        }
    }

    /// Was this connection used by an earlier checkout?
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Close the connection instead of returning it to the pool.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    /// Take the connection out of the pool for good.
    pub fn into_inner(mut self) -> C {
        if let Some(home) = self.home.take() {
            home.release_slot();
        }
        self.conn
            .take()
            .expect("pooled connection is present until dropped")
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("pooled connection is present until dropped")
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("pooled connection is present until dropped")
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let (Some(conn), Some(home)) = (self.conn.take(), self.home.take()) {
            home.checkin(conn, self.created, self.epoch, self.invalid);
        }
    }
}

impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("reused", &self.reused)
            .field("invalid", &self.invalid)
            .field("age", &self.created.elapsed())
            .finish_non_exhaustive()
    }
}

struct NullShared {
    active: AtomicUsize,
    opened: AtomicU64,
    closed: AtomicU64,
    shut: AtomicBool,
}

/// Opens a connection per checkout and closes it on return.
pub struct NullPool<C> {
    shared: Arc<NullShared>,
    config: PoolConfig,
    _conn: PhantomData<fn() -> C>,
}

impl<C> NullPool<C> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(NullShared {
                active: AtomicUsize::new(0),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                shut: AtomicBool::new(false),
            }),
            config,
            _conn: PhantomData,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Always a reservation for a new connection.
    #[allow(clippy::result_large_err)]
    pub fn checkout(&self) -> Result<Reservation<C>> {
        if self.shared.shut.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        self.shared.active.fetch_add(1, Ordering::Relaxed);
        Ok(Reservation {
            home: Some(Home::Null(Arc::clone(&self.shared))),
            epoch: 0,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.shared.active.load(Ordering::Relaxed);
        PoolStats {
            total_connections: active,
            idle_connections: 0,
            active_connections: active,
            pending_requests: 0,
            opened: self.shared.opened.load(Ordering::Relaxed),
            closed: self.shared.closed.load(Ordering::Relaxed),
        }
    }

    /// Refuse further checkouts.
    pub fn close(&self) {
        self.shared.shut.store(true, Ordering::Release);
    }
}

impl<C> Clone for NullPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            _conn: PhantomData,
        }
    }
}

struct Idle<C> {
    conn: C,
    created: Instant,
}

struct QueueState<C> {
    idle: VecDeque<Idle<C>>,
    /// Connections that exist or are being opened
    live: usize,
    checked_out: usize,
    waiting: usize,
    opened: u64,
    closed: u64,
    /// Bumped by `dispose`; older connections are closed on return
    epoch: u64,
    shut: bool,
}

struct QueueShared<C> {
    config: PoolConfig,
    state: Mutex<QueueState<C>>,
    /// Blocking waiters
    available: Condvar,
    /// Async waiters
    returned: Notify,
}

impl<C> QueueShared<C> {
    fn lock(&self) -> MutexGuard<'_, QueueState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_one(&self) {
        self.available.notify_one();
        self.returned.notify_waiters();
    }

    fn wake_all(&self) {
        self.available.notify_all();
        self.returned.notify_waiters();
    }

    fn checkin(&self, conn: C, created: Instant, epoch: u64, invalid: bool) {
        let mut state = self.lock();
        state.checked_out -= 1;
        let keep = !invalid
            && !state.shut
            && epoch == state.epoch
            && !self.config.expired(created.elapsed())
            && state.idle.len() < self.config.pool_size;
        let discard = if keep {
            state.idle.push_back(Idle { conn, created });
            None
        } else {
            state.live -= 1;
            state.closed += 1;
            Some(conn)
        };
        drop(state);
        self.wake_one();

        if discard.is_some() {
            tracing::debug!(invalid, "Closing connection on return to pool");
        } else {
            tracing::trace!("Connection returned to pool");
        }
        drop(discard);
    }
}

/// Counts one parked async waiter; dropping the checkout future mid-wait
/// still releases it.
struct Waiting<'a, C>(&'a QueueShared<C>);

impl<C> Drop for Waiting<'_, C> {
    fn drop(&mut self) {
        self.0.lock().waiting -= 1;
    }
}

/// Keeps up to `pool_size` idle connections and allows `max_overflow` more
/// to be live while the pool is busy.
pub struct QueuePool<C> {
    shared: Arc<QueueShared<C>>,
}

impl<C> QueuePool<C> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                config,
                state: Mutex::new(QueueState {
                    idle: VecDeque::new(),
                    live: 0,
                    checked_out: 0,
                    waiting: 0,
                    opened: 0,
                    closed: 0,
                    epoch: 0,
                    shut: false,
                }),
                available: Condvar::new(),
                returned: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out without waiting; errors with `Exhausted` when every slot
    /// is taken.
    #[tracing::instrument(level = "trace", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn try_checkout(&self) -> Result<Checkout<C>> {
        let mut expired = Vec::new();
        let mut state = self.shared.lock();
        let result = match self.take(&mut state, &mut expired) {
            Some(checkout) => Ok(checkout),
            None if state.shut => Err(closed_error()),
            None => Err(self.exhausted()),
        };
        drop(state);
        drop(expired);
        result
    }

    /// Check out, blocking up to `acquire_timeout` for a slot to free up.
    #[tracing::instrument(level = "trace", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn checkout_wait(&self) -> Result<Checkout<C>> {
        let deadline = Instant::now() + self.shared.config.acquire_timeout;
        let mut expired = Vec::new();
        let mut state = self.shared.lock();
        loop {
            if state.shut {
                return Err(closed_error());
            }
            if let Some(checkout) = self.take(&mut state, &mut expired) {
                drop(state);
                drop(expired);
                return Ok(checkout);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(self.shared.config.acquire_timeout));
            }
            state.waiting += 1;
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.waiting -= 1;
        }
    }

    /// Check out, awaiting up to `acquire_timeout` for a slot to free up.
    ///
    /// The wait parks on the pool's notifier, so it holds no thread. A
    /// cancelled `cx` ends the wait with [`Outcome::Cancelled`].
    pub async fn checkout_async(&self, cx: &Cx) -> Outcome<Checkout<C>, Error> {
        let acquire_timeout = self.shared.config.acquire_timeout;
        let deadline = now(cx) + acquire_timeout;
        loop {
            if cx.checkpoint().is_err() {
                return Outcome::Cancelled(cx.cancel_reason().unwrap_or_default());
            }
            // Registered before the state is read so a return in between
            // still wakes this waiter.
            let notified = self.shared.returned.notified();
            let current = {
                let mut expired = Vec::new();
                let mut state = self.shared.lock();
                if state.shut {
                    return Outcome::Err(closed_error());
                }
                if let Some(checkout) = self.take(&mut state, &mut expired) {
                    drop(state);
                    drop(expired);
                    return Outcome::Ok(checkout);
                }
                let current = now(cx);
                if current >= deadline {
                    return Outcome::Err(timed_out(acquire_timeout));
                }
                state.waiting += 1;
                current
            };
            let _waiting = Waiting(&self.shared);
            let left = Duration::from_nanos(deadline.duration_since(current));
            let _ = timeout(current, left.min(WAIT_SLICE), notified).await;
        }
    }

    fn take(
        &self,
        state: &mut QueueState<C>,
        expired: &mut Vec<C>,
    ) -> Option<Checkout<C>> {
        if state.shut {
            return None;
        }
        while let Some(idle) = state.idle.pop_front() {
            if self.shared.config.expired(idle.created.elapsed()) {
                state.live -= 1;
                state.closed += 1;
                expired.push(idle.conn);
                continue;
            }
            state.checked_out += 1;
            tracing::trace!(idle = state.idle.len(), "Reusing pooled connection");
            return Some(Checkout::Reused(PooledConnection {
                conn: Some(idle.conn),
                created: idle.created,
                reused: true,
                invalid: false,
                epoch: state.epoch,
                home: Some(Home::Queue(Arc::clone(&self.shared))),
            }));
        }
        if state.live < self.shared.config.max_connections() {
            state.live += 1;
            state.checked_out += 1;
            if state.live > self.shared.config.pool_size {
                tracing::debug!(live = state.live, "Opening overflow connection");
            }
            return Some(Checkout::Open(Reservation {
                home: Some(Home::Queue(Arc::clone(&self.shared))),
                epoch: state.epoch,
            }));
        }
        None
    }

    fn exhausted(&self) -> Error {
        let config = &self.shared.config;
        pool_error(
            PoolErrorKind::Exhausted,
            format!(
                "QueuePool limit of size {} overflow {} reached",
                config.pool_size, config.max_overflow
            ),
        )
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total_connections: state.live,
            idle_connections: state.idle.len(),
            active_connections: state.checked_out,
            pending_requests: state.waiting,
            opened: state.opened,
            closed: state.closed,
        }
    }

    /// Close idle connections. Connections checked out now are closed when
    /// they come back. Returns how many were closed.
    pub fn dispose(&self) -> usize {
        let mut state = self.shared.lock();
        let drained: Vec<Idle<C>> = state.idle.drain(..).collect();
        state.live -= drained.len();
        state.closed += drained.len() as u64;
        state.epoch += 1;
        drop(state);
        self.shared.wake_all();
        tracing::debug!(closed = drained.len(), "Disposed pool");
        drained.len()
    }

    /// Dispose and refuse further checkouts.
    pub fn close(&self) {
        self.shared.lock().shut = true;
        self.dispose();
    }
}

impl<C> Clone for QueuePool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Either pool, picked by [`PoolKind`].
pub enum Pool<C> {
    Null(NullPool<C>),
    Queue(QueuePool<C>),
}

impl<C> Pool<C> {
    pub fn new(kind: PoolKind, config: PoolConfig) -> Self {
        match kind {
            PoolKind::Null => Pool::Null(NullPool::new(config)),
            PoolKind::Queue => Pool::Queue(QueuePool::new(config)),
        }
    }

    pub fn kind(&self) -> PoolKind {
        match self {
            Pool::Null(_) => PoolKind::Null,
            Pool::Queue(_) => PoolKind::Queue,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        match self {
            Pool::Null(pool) => pool.config(),
            Pool::Queue(pool) => pool.config(),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn try_checkout(&self) -> Result<Checkout<C>> {
        match self {
            Pool::Null(pool) => pool.checkout().map(Checkout::Open),
            Pool::Queue(pool) => pool.try_checkout(),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn checkout_wait(&self) -> Result<Checkout<C>> {
        match self {
            Pool::Null(pool) => pool.checkout().map(Checkout::Open),
            Pool::Queue(pool) => pool.checkout_wait(),
        }
    }

    pub async fn checkout_async(&self, cx: &Cx) -> Outcome<Checkout<C>, Error> {
        match self {
            Pool::Null(pool) => match pool.checkout() {
                Ok(reservation) => Outcome::Ok(Checkout::Open(reservation)),
                Err(e) => Outcome::Err(e),
            },
            Pool::Queue(pool) => pool.checkout_async(cx).await,
        }
    }

    pub fn stats(&self) -> PoolStats {
        match self {
            Pool::Null(pool) => pool.stats(),
            Pool::Queue(pool) => pool.stats(),
        }
    }

    pub fn dispose(&self) -> usize {
        match self {
            Pool::Null(_) => 0,
            Pool::Queue(pool) => pool.dispose(),
        }
    }

    pub fn close(&self) {
        match self {
            Pool::Null(pool) => pool.close(),
            Pool::Queue(pool) => pool.close(),
        }
    }
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        match self {
            Pool::Null(pool) => Pool::Null(pool.clone()),
            Pool::Queue(pool) => Pool::Queue(pool.clone()),
        }
    }
}

impl<C> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("kind", &self.kind())
            .field("stats", &self.stats())
            .finish()
    }
}
