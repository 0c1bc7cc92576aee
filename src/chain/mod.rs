//! Query chains — ordered queries and callbacks sharing one pooled connection.
//!
//! A [`QueryChain`] holds a list of [`Step`]s. Running it acquires a single
//! connection from the [`Pool`], then walks the steps in declaration order:
//!
//! - a **query** step is submitted to the connection and awaited; its
//!   [`Cursor`] becomes the "current" result;
//! - a **callback** step is called synchronously with the current cursor,
//!   right after the query that produced it and before anything else in the
//!   chain happens.
//!
//! The connection goes back to the pool exactly once, whether the chain
//! finished, a query failed, a callback returned an error or panicked, or the
//! `run` future was dropped.
//!
//! ```rust,no_run
//! use chainpool::chain::QueryChain;
//! use chainpool::pool::Pool;
//! use chainpool::params;
//!
//! async fn handler(pool: Pool) -> Result<(), chainpool::chain::ChainError> {
//!     QueryChain::new(pool)
//!         .query_with("SELECT 42, 12, %s, 11;", params![23])
//!         .callback(|cursor| {
//!             println!("first: {:?}", cursor.fetch_all());
//!             Ok(())
//!         })
//!         .query("SELECT 1, 2, 3, 4, 5;")
//!         .callback(|cursor| {
//!             println!("last: {:?}", cursor.fetch_all());
//!             Ok(())
//!         })
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::driver::{Cursor, QueryError, Value};
use crate::pool::{Pool, PoolError, PooledConnection};

/// Error type user callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A callback step. Runs at most once, with the most recent cursor.
pub type Callback = Box<dyn FnOnce(&Cursor) -> Result<(), CallbackError> + Send>;

/// Errors produced by running a chain.
///
/// Every variant means the chain stopped; no later step ran.
#[derive(Debug, Error)]
pub enum ChainError {
    /// No connection could be acquired. No step ran.
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("query at step {step} failed: {source}")]
    Query {
        step: usize,
        #[source]
        source: QueryError,
    },

    #[error("callback at step {step} failed: {source}")]
    Callback {
        step: usize,
        #[source]
        source: CallbackError,
    },
}

impl ChainError {
    /// Index of the failing step, if a step was reached.
    pub fn step(&self) -> Option<usize> {
        match self {
            Self::Pool(_) => None,
            Self::Query { step, .. } | Self::Callback { step, .. } => Some(*step),
        }
    }
}

/// One entry of a chain.
pub enum Step {
    Query { text: String, params: Vec<Value> },
    Callback(Callback),
}

impl Step {
    pub fn query(text: impl Into<String>) -> Self {
        Self::Query {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn query_with(text: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Query {
            text: text.into(),
            params,
        }
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(&Cursor) -> Result<(), CallbackError> + Send + 'static,
    {
        Self::Callback(Box::new(f))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query { text, params } => f
                .debug_struct("Query")
                .field("text", text)
                .field("params", params)
                .finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Where a chain is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    AcquiringConnection,
    ExecutingStep(usize),
    Succeeded,
    Failed,
    /// Returning the connection to the pool.
    Draining,
    Done,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::AcquiringConnection => f.write_str("acquiring connection"),
            Self::ExecutingStep(i) => write!(f, "executing step {i}"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed => f.write_str("failed"),
            Self::Draining => f.write_str("draining"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainReport {
    pub steps: usize,
    pub queries: usize,
    pub elapsed: Duration,
}

/// An ordered list of queries and callbacks run on one pooled connection.
pub struct QueryChain {
    pool: Pool,
    steps: Vec<Step>,
    state: ChainState,
}

impl QueryChain {
    pub fn new(pool: Pool) -> Self {
        Self::from_steps(pool, Vec::new())
    }

    pub fn from_steps(pool: Pool, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            pool,
            steps: steps.into_iter().collect(),
            state: ChainState::Idle,
        }
    }

    /// Appends a query without parameters.
    #[must_use]
    pub fn query(self, text: impl Into<String>) -> Self {
        self.step(Step::query(text))
    }

    /// Appends a query with positional parameters.
    #[must_use]
    pub fn query_with(self, text: impl Into<String>, params: Vec<Value>) -> Self {
        self.step(Step::query_with(text, params))
    }

    /// Appends a callback that receives the latest cursor.
    ///
    /// A callback placed before any query sees an empty cursor. Returning an
    /// error aborts the chain.
    #[must_use]
    pub fn callback<F>(self, f: F) -> Self
    where
        F: FnOnce(&Cursor) -> Result<(), CallbackError> + Send + 'static,
    {
        self.step(Step::callback(f))
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Acquires a connection and executes every step in order.
    ///
    /// Suspends only while acquiring the connection and while each query is
    /// in flight. A callback runs in the same poll as the completion of the
    /// query before it.
    ///
    /// If a callback panics, the connection is released first and the panic
    /// then resumes.
    ///
    /// # Errors
    ///
    /// - [`ChainError::Pool`] if no connection could be acquired.
    /// - [`ChainError::Query`] if a query failed.
    /// - [`ChainError::Callback`] if a callback returned an error.
    pub async fn run(mut self) -> Result<ChainReport, ChainError> {
        let started = Instant::now();
        let steps = std::mem::take(&mut self.steps);
        let total = steps.len();

        self.transition(ChainState::AcquiringConnection);
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "chain could not acquire a connection");
                self.transition(ChainState::Failed);
                return Err(e.into());
            }
        };

        let mut cursor = Cursor::empty();
        let mut queries = 0;
        let mut outcome = Ok(());

        for (index, step) in steps.into_iter().enumerate() {
            self.transition(ChainState::ExecutingStep(index));
            match step {
                Step::Query { text, params } => match conn.execute(&text, &params).await {
                    Ok(next) => {
                        cursor = next;
                        queries += 1;
                    }
                    Err(source) => {
                        outcome = Err(ChainError::Query {
                            step: index,
                            source,
                        });
                        break;
                    }
                },
                Step::Callback(callback) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| callback(&cursor))) {
                        Ok(Ok(())) => {}
                        Ok(Err(source)) => {
                            outcome = Err(ChainError::Callback {
                                step: index,
                                source,
                            });
                            break;
                        }
                        Err(payload) => {
                            self.transition(ChainState::Failed);
                            self.drain(conn);
                            panic::resume_unwind(payload);
                        }
                    }
                }
            }
        }

        match &outcome {
            Ok(()) => self.transition(ChainState::Succeeded),
            Err(e) => {
                debug!(error = %e, "chain aborted");
                self.transition(ChainState::Failed);
            }
        }
        self.drain(conn);

        outcome.map(|()| ChainReport {
            steps: total,
            queries,
            elapsed: started.elapsed(),
        })
    }

    // The only place a chain gives its connection back.
    fn drain(&mut self, conn: PooledConnection) {
        self.transition(ChainState::Draining);
        self.pool.release(conn);
        self.transition(ChainState::Done);
    }

    fn transition(&mut self, next: ChainState) {
        trace!(from = %self.state, to = %next, "chain transition");
        self.state = next;
    }
}

impl fmt::Debug for QueryChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryChain")
            .field("steps", &self.steps)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::{ConnectParams, PoolConfig};
    use crate::driver::MemoryDriver;
    use crate::params;

    async fn pool(driver: &MemoryDriver) -> Pool {
        let config = PoolConfig::new(1, 2, 10, ConnectParams::new("localhost", "test"));
        Pool::connect(driver.clone(), config).await.unwrap()
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(
        log: Log,
        label: &'static str,
    ) -> impl FnOnce(&Cursor) -> Result<(), CallbackError> + Send + 'static {
        move |cursor: &Cursor| {
            log.lock()
                .unwrap()
                .push(format!("{label}:{:?}", cursor.fetch_all()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn builder_collects_steps() {
        let driver = MemoryDriver::new();
        let chain = QueryChain::new(pool(&driver).await)
            .query("SELECT 1;")
            .callback(|_| Ok(()))
            .query_with("SELECT %s;", params![2]);
        assert_eq!(chain.len(), 3);
        assert!(!chain.is_empty());
        assert_eq!(chain.state(), ChainState::Idle);
        assert!(format!("{chain:?}").contains("Callback"));
    }

    #[tokio::test]
    async fn callbacks_see_preceding_query() {
        let driver = MemoryDriver::new();
        let log = Log::default();

        let report = QueryChain::new(pool(&driver).await)
            .query_with("SELECT 42, 12, %s, 11;", params![23])
            .callback(recorder(Arc::clone(&log), "first"))
            .query("SELECT 1, 2, 3, 4, 5;")
            .query("SELECT 123, 132, 678;")
            .callback(recorder(Arc::clone(&log), "last"))
            .run()
            .await
            .unwrap();

        assert_eq!(report.steps, 5);
        assert_eq!(report.queries, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                format!("first:{:?}", vec![params![42, 12, 23, 11]]),
                format!("last:{:?}", vec![params![123, 132, 678]]),
            ]
        );
    }

    #[tokio::test]
    async fn callback_runs_before_next_query_is_submitted() {
        let driver = MemoryDriver::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let probe = {
            let driver = driver.clone();
            let seen = Arc::clone(&seen);
            move |_: &Cursor| -> Result<(), CallbackError> {
                seen.lock().unwrap().extend(driver.executed());
                Ok(())
            }
        };

        QueryChain::new(pool(&driver).await)
            .query("SELECT 1;")
            .callback(probe)
            .query("SELECT 2;")
            .run()
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["SELECT 1;".to_string()]);
        assert_eq!(driver.executed().len(), 2);
    }

    #[tokio::test]
    async fn leading_callback_gets_empty_cursor() {
        let driver = MemoryDriver::new();
        let log = Log::default();
        QueryChain::new(pool(&driver).await)
            .callback(recorder(Arc::clone(&log), "pre"))
            .run()
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["pre:[]".to_string()]);
    }

    #[tokio::test]
    async fn query_failure_stops_chain_and_releases() {
        let driver = MemoryDriver::new();
        let pool = pool(&driver).await;
        let log = Log::default();

        let err = QueryChain::new(pool.clone())
            .query("SELECT 1;")
            .query("SELECT 1/0;")
            .callback(recorder(Arc::clone(&log), "never"))
            .query("SELECT 3;")
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Query { step: 1, .. }));
        assert_eq!(err.step(), Some(1));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(driver.executed(), vec!["SELECT 1;", "SELECT 1/0;"]);
        assert_eq!(pool.status().busy, 0);
    }

    #[tokio::test]
    async fn callback_error_stops_chain_and_releases() {
        let driver = MemoryDriver::new();
        let pool = pool(&driver).await;

        let err = QueryChain::new(pool.clone())
            .query("SELECT 1;")
            .callback(|_| Err("client went away".into()))
            .query("SELECT 2;")
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Callback { step: 1, .. }));
        assert!(err.to_string().contains("client went away"));
        assert_eq!(driver.executed().len(), 1);
        assert_eq!(pool.status().busy, 0);
    }

    #[tokio::test]
    async fn callback_panic_releases_then_propagates() {
        let driver = MemoryDriver::new();
        let pool = pool(&driver).await;

        let chain = QueryChain::new(pool.clone())
            .query("SELECT 1;")
            .callback(|_| panic!("boom"));
        let joined = tokio::spawn(chain.run()).await;

        assert!(joined.unwrap_err().is_panic());
        let status = pool.status();
        assert_eq!(status.busy, 0);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn acquire_failure_runs_no_step() {
        let driver = MemoryDriver::new();
        let pool = pool(&driver).await;
        pool.close().await;

        let log = Log::default();
        let err = QueryChain::new(pool)
            .callback(recorder(Arc::clone(&log), "never"))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Pool(PoolError::Closed)));
        assert_eq!(err.step(), None);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_still_releases() {
        let driver = MemoryDriver::new().with_latency(Duration::from_millis(50));
        let pool = pool(&driver).await;

        let run = QueryChain::new(pool.clone()).query("SELECT 1;").run();
        let cancelled = tokio::time::timeout(Duration::from_millis(5), run).await;
        assert!(cancelled.is_err());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let status = pool.status();
        assert_eq!(status.busy, 0);
        assert_eq!(status.size, 1);
    }

    #[test]
    fn state_display() {
        assert_eq!(ChainState::ExecutingStep(3).to_string(), "executing step 3");
        assert_eq!(ChainState::AcquiringConnection.to_string(), "acquiring connection");
    }
}
