//! Async connection pool with bounded size and a bounded FIFO wait queue.
//!
//! A [`Pool`] opens `min_size` connections eagerly and up to `max_size`
//! lazily. Callers that find every connection busy queue up (at most
//! `max_queue` of them) and are served strictly in arrival order as
//! connections come back.
//!
//! Connections are handed out as [`PooledConnection`] guards. Dropping a
//! guard returns the connection; there is no way to forget to release one.
//!
//! ## Suspension points
//!
//! [`Pool::acquire`] suspends only while waiting for a connection to be
//! established or released. All bookkeeping happens under a short-lived
//! mutex that is never held across an `.await`, so the pool works the same
//! on a `current_thread` runtime and on the multi-threaded one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PoolConfig};
use crate::driver::{ConnectError, Connection, Cursor, Driver, QueryError, Value};

/// Errors produced while acquiring a connection.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Establishment kept failing after every configured retry.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectError),

    #[error("pool exhausted: {max_queue} callers already waiting")]
    Exhausted { max_queue: usize },

    #[error("pool is closed")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced by [`Pool::execute`].
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

// Ceiling for the delay between establishments that keep failing.
const MAX_REESTABLISH_DELAY: Duration = Duration::from_secs(30);

type Waiter = oneshot::Sender<Result<PooledConnection, PoolError>>;

struct State {
    // Most recently returned at the back.
    idle: VecDeque<Box<dyn Connection>>,
    // Established connections, idle or busy.
    live: usize,
    connecting: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl State {
    fn prune_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.is_closed());
    }

    fn needs_replacement(&self, config: &PoolConfig) -> bool {
        let total = self.live + self.connecting;
        !self.closed
            && total < config.max_size
            && (total < config.min_size || self.waiters.len() > self.connecting)
    }
}

struct Shared {
    driver: Arc<dyn Driver>,
    config: PoolConfig,
    runtime: Handle,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gives `conn` to the oldest waiter still listening, or parks it as idle.
    fn hand_off(self: &Arc<Self>, state: &mut State, conn: Box<dyn Connection>) {
        let mut conn = conn;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Ok(PooledConnection::new(conn, Arc::clone(self)))) {
                Ok(()) => {
                    debug!(waiting = state.waiters.len(), "connection handed to waiter");
                    return;
                }
                Err(rejected) => match rejected {
                    Ok(guard) => match guard.detach() {
                        Some(back) => conn = back,
                        None => return,
                    },
                    Err(_) => return,
                },
            }
        }
        state.idle.push_back(conn);
    }

    fn release(self: &Arc<Self>, conn: Box<dyn Connection>, broken: bool) {
        let mut replace = false;
        let discard = {
            let mut state = self.lock();
            if broken || state.closed {
                state.live -= 1;
                state.prune_waiters();
                if state.needs_replacement(&self.config) {
                    state.connecting += 1;
                    replace = true;
                }
                Some(conn)
            } else {
                self.hand_off(&mut state, conn);
                None
            }
        };

        if let Some(conn) = discard {
            if broken {
                debug!(replace, "discarding broken connection");
            }
            self.runtime.spawn(conn.close());
        }
        if replace {
            self.spawn_establish(Duration::ZERO);
        }
    }

    async fn connect_with_retry(&self) -> Result<Box<dyn Connection>, ConnectError> {
        let mut attempt = 0;
        loop {
            match self.driver.connect(&self.config.connection).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < self.config.connect_retries => {
                    let backoff = self.config.backoff_for(attempt);
                    warn!(attempt, error = %e, ?backoff, "connection attempt failed — retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Caller must already have counted the attempt in `state.connecting`.
    ///
    /// A failed establishment is followed by another one, after `delay` has
    /// grown by one backoff step, while queued waiters or the warm minimum
    /// still need a connection.
    fn spawn_establish(self: &Arc<Self>, delay: Duration) {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = shared.connect_with_retry().await;

            let mut retry = None;
            let late = {
                let mut state = shared.lock();
                state.connecting -= 1;
                match result {
                    Ok(conn) if state.closed => Some(conn),
                    Ok(conn) => {
                        state.live += 1;
                        debug!(live = state.live, "connection established");
                        shared.hand_off(&mut state, conn);
                        None
                    }
                    Err(e) => {
                        error!(error = %e, "giving up on connection establishment");
                        while let Some(waiter) = state.waiters.pop_front() {
                            if waiter.send(Err(PoolError::Connection(e.clone()))).is_ok() {
                                break;
                            }
                        }
                        state.prune_waiters();
                        if state.needs_replacement(&shared.config) {
                            state.connecting += 1;
                            let next = shared.config.retry_backoff.max(delay.saturating_mul(2));
                            retry = Some(next.min(MAX_REESTABLISH_DELAY));
                        }
                        None
                    }
                }
            };

            if let Some(delay) = retry {
                debug!(?delay, "scheduling another establishment");
                shared.spawn_establish(delay);
            }
            if let Some(conn) = late {
                conn.close().await;
            }
        });
    }

    fn spawn_cleanup(self: &Arc<Self>) {
        let period = self.config.cleanup_interval;
        if period.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };

                let surplus = {
                    let mut state = shared.lock();
                    if state.closed {
                        break;
                    }
                    let excess = state
                        .live
                        .saturating_sub(shared.config.min_size)
                        .min(state.idle.len());
                    state.live -= excess;
                    state.idle.drain(..excess).collect::<Vec<_>>()
                };

                if !surplus.is_empty() {
                    debug!(closed = surplus.len(), "closing surplus idle connections");
                }
                for conn in surplus {
                    conn.close().await;
                }
            }
        });
    }
}

/// Point-in-time view of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    /// Established connections, idle or busy.
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    /// Establishments in flight.
    pub connecting: usize,
    /// Callers queued for a connection.
    pub waiting: usize,
}

/// A pool of database connections.
///
/// Cloning is cheap and yields a handle to the same pool; build one at
/// process start and pass it to every consumer.
///
/// # Examples
///
/// ```rust,no_run
/// use chainpool::config::{ConnectParams, PoolConfig};
/// use chainpool::driver::MemoryDriver;
/// use chainpool::pool::Pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = PoolConfig::new(1, 20, 10, ConnectParams::new("localhost", "app"));
///     let pool = Pool::connect(MemoryDriver::new(), config).await?;
///
///     let mut conn = pool.acquire().await?;
///     let cursor = conn.execute("SELECT 1;", &[]).await?;
///     println!("{:?}", cursor.fetch_all());
///     pool.release(conn);
///
///     pool.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    /// Validates `config`, opens `min_size` connections and starts the idle
    /// cleanup task.
    ///
    /// Must be called from within a Tokio runtime; the pool spawns its
    /// background work onto that runtime.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Config`] if the sizing is invalid.
    /// - [`PoolError::Connection`] if a warm connection cannot be opened
    ///   within the retry budget. Connections already opened are closed.
    pub async fn connect<D: Driver>(driver: D, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            driver: Arc::new(driver),
            runtime: Handle::current(),
            state: Mutex::new(State {
                idle: VecDeque::with_capacity(config.max_size),
                live: 0,
                connecting: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
            config,
        });

        let mut warm = Vec::with_capacity(shared.config.min_size);
        for _ in 0..shared.config.min_size {
            match shared.connect_with_retry().await {
                Ok(conn) => warm.push(conn),
                Err(e) => {
                    for conn in warm {
                        conn.close().await;
                    }
                    return Err(e.into());
                }
            }
        }

        {
            let mut state = shared.lock();
            state.live = warm.len();
            state.idle.extend(warm);
        }
        shared.spawn_cleanup();

        info!(
            target_db = %shared.config.connection.target(),
            min = shared.config.min_size,
            max = shared.config.max_size,
            max_queue = shared.config.max_queue,
            "pool ready"
        );
        Ok(Self { shared })
    }

    /// Acquires a connection.
    ///
    /// Resolves at once with an idle connection when there is one. Otherwise
    /// the caller joins the FIFO queue; a new connection is established for
    /// it when the pool is below `max_size`.
    ///
    /// Dropping the returned future before it resolves removes the caller
    /// from the queue with no other effect.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Exhausted`] if the pool is at `max_size` and
    ///   `max_queue` callers are already waiting.
    /// - [`PoolError::Connection`] if the establishment serving this caller
    ///   failed after every retry.
    /// - [`PoolError::Closed`] if the pool is, or gets, closed.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let (rx, establish) = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = state.idle.pop_back() {
                return Ok(PooledConnection::new(conn, Arc::clone(&self.shared)));
            }

            state.prune_waiters();
            let establish = state.live + state.connecting < self.shared.config.max_size;
            // Waiters already covered by an in-flight establishment do not count.
            let queued = state.waiters.len().saturating_sub(state.connecting);
            if !establish && queued >= self.shared.config.max_queue {
                warn!(max_queue = self.shared.config.max_queue, "pool exhausted");
                return Err(PoolError::Exhausted {
                    max_queue: self.shared.config.max_queue,
                });
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            if establish {
                state.connecting += 1;
            }
            (rx, establish)
        };

        if establish {
            self.shared.spawn_establish(Duration::ZERO);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Returns `conn` to the pool.
    ///
    /// The oldest queued waiter receives it directly, without passing
    /// through the idle set. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Runs a single statement on a pooled connection and returns its cursor.
    ///
    /// # Errors
    ///
    /// [`ExecuteError::Pool`] if no connection could be acquired,
    /// [`ExecuteError::Query`] if the statement failed.
    pub async fn execute(&self, text: &str, params: &[Value]) -> Result<Cursor, ExecuteError> {
        let mut conn = self.acquire().await?;
        Ok(conn.execute(text, params).await?)
    }

    /// Shuts the pool down.
    ///
    /// Queued waiters fail with [`PoolError::Closed`] and idle connections are
    /// closed. Connections still checked out are closed when they come back.
    /// No `acquire` succeeds once this has been called.
    pub async fn close(&self) {
        let (waiters, idle) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.live -= idle.len();
            (std::mem::take(&mut state.waiters), idle)
        };

        let cancelled = waiters
            .into_iter()
            .filter_map(|waiter| waiter.send(Err(PoolError::Closed)).ok())
            .count();
        let closed = idle.len();
        for conn in idle {
            conn.close().await;
        }

        info!(cancelled, closed, "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn status(&self) -> PoolStatus {
        let mut state = self.shared.lock();
        state.prune_waiters();
        PoolStatus {
            size: state.live,
            idle: state.idle.len(),
            busy: state.live - state.idle.len(),
            connecting: state.connecting,
            waiting: state.waiters.len(),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

/// A connection checked out of a [`Pool`].
///
/// Exclusively owned by its holder until dropped (or passed to
/// [`Pool::release`]), at which point it goes back to the pool exactly once.
///
/// A connection is discarded instead of reused when the driver reported a
/// fatal error on it, when [`mark_broken`](Self::mark_broken) was called, or
/// when the guard is dropped while a statement is still in flight (the
/// session state is unknown at that point).
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    shared: Arc<Shared>,
    broken: bool,
    in_flight: bool,
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, shared: Arc<Shared>) -> Self {
        Self {
            conn: Some(conn),
            shared,
            broken: false,
            in_flight: false,
        }
    }

    /// Executes one statement and materializes its rows.
    ///
    /// # Errors
    ///
    /// Returns the driver's [`QueryError`]. Fatal errors also mark this
    /// connection broken.
    pub async fn execute(&mut self, text: &str, params: &[Value]) -> Result<Cursor, QueryError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(QueryError::fatal("connection already returned to the pool"));
        };

        self.in_flight = true;
        let result = conn.execute(text, params).await;
        self.in_flight = false;

        if matches!(&result, Err(e) if e.fatal) {
            self.broken = true;
        }
        result
    }

    /// Forces the connection to be closed instead of reused on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    // Takes the connection out without releasing it.
    fn detach(mut self) -> Option<Box<dyn Connection>> {
        self.conn.take()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let broken = self.broken || self.in_flight;
            self.shared.release(conn, broken);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
