//! Batch queries — independent named queries run concurrently.
//!
//! Where a [`QueryChain`](crate::chain::QueryChain) serializes its steps on
//! one connection, a [`BatchQuery`] gives every query its own pooled
//! connection and runs them side by side. Results come back keyed by name.
//!
//! A batch larger than `max_size + max_queue` can fail with
//! [`PoolError::Exhausted`](crate::pool::PoolError::Exhausted).

use std::collections::BTreeMap;

use tokio::task::JoinSet;
use tracing::debug;

use crate::chain::ChainError;
use crate::driver::{Cursor, Value};
use crate::pool::{ExecuteError, Pool};

struct Named {
    name: String,
    text: String,
    params: Vec<Value>,
}

/// A set of named queries run concurrently on separate connections.
///
/// # Examples
///
/// ```rust,no_run
/// use chainpool::batch::BatchQuery;
/// use chainpool::pool::Pool;
///
/// async fn dashboard(pool: Pool) -> Result<(), chainpool::chain::ChainError> {
///     let results = BatchQuery::new(pool)
///         .query("users", "SELECT 10;")
///         .query("orders", "SELECT 42;")
///         .run()
///         .await?;
///     println!("{:?}", results["orders"].fetch_one());
///     Ok(())
/// }
/// ```
pub struct BatchQuery {
    pool: Pool,
    queries: Vec<Named>,
}

impl BatchQuery {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            queries: Vec::new(),
        }
    }

    #[must_use]
    pub fn query(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.query_with(name, text, Vec::new())
    }

    /// Adds a parameterized query. A name already in the batch is replaced.
    #[must_use]
    pub fn query_with(
        mut self,
        name: impl Into<String>,
        text: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        let name = name.into();
        self.queries.retain(|q| q.name != name);
        self.queries.push(Named {
            name,
            text: text.into(),
            params,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Runs every query and collects the cursors by name.
    ///
    /// Each connection is released as soon as its own query finishes.
    ///
    /// # Errors
    ///
    /// Returns the failure of the earliest-added query that failed. The
    /// step index in [`ChainError::Query`] is that query's position in the
    /// batch.
    pub async fn run(self) -> Result<BTreeMap<String, Cursor>, ChainError> {
        let mut set = JoinSet::new();
        for (index, Named { name, text, params }) in self.queries.into_iter().enumerate() {
            let pool = self.pool.clone();
            set.spawn(async move {
                let result = pool.execute(&text, &params).await.map_err(|e| match e {
                    ExecuteError::Query(source) => ChainError::Query {
                        step: index,
                        source,
                    },
                    ExecuteError::Pool(e) => ChainError::Pool(e),
                });
                (index, name, result)
            });
        }

        let mut cursors = BTreeMap::new();
        let mut first_error: Option<(usize, ChainError)> = None;

        while let Some(joined) = set.join_next().await {
            let (index, name, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                // Only `abort` cancels these tasks, and nothing here aborts.
                Err(_) => continue,
            };
            match result {
                Ok(cursor) => {
                    cursors.insert(name, cursor);
                }
                Err(e) => {
                    if first_error.as_ref().is_none_or(|(seen, _)| index < *seen) {
                        first_error = Some((index, e));
                    }
                }
            }
        }

        match first_error {
            Some((index, e)) => {
                debug!(index, error = %e, "batch failed");
                Err(e)
            }
            None => Ok(cursors),
        }
    }
}
