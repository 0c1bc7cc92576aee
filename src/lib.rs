//! # chainpool
//!
//! Non-blocking database access for event-driven Tokio servers: an async
//! connection pool with bounded concurrency, and a query-chain executor that
//! threads each query's cursor into the callbacks that follow it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainpool::{ConnectParams, MemoryDriver, Pool, PoolConfig, QueryChain, params};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PoolConfig::new(1, 20, 10, ConnectParams::new("localhost", "app"));
//!     let pool = Pool::connect(MemoryDriver::new(), config).await?;
//!
//!     QueryChain::new(pool.clone())
//!         .query_with("SELECT 42, %s;", params![23])
//!         .callback(|cursor| {
//!             println!("{:?}", cursor.fetch_all());
//!             Ok(())
//!         })
//!         .run()
//!         .await?;
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

// ── Core ──────────────────────────────────────────────────────────────────────
pub mod chain;
pub mod pool;

// ── Supporting modules ────────────────────────────────────────────────────────
pub mod batch;
pub mod config;
pub mod driver;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use batch::BatchQuery;
pub use chain::{ChainError, ChainReport, QueryChain, Step};
pub use config::{ConfigError, ConnectParams, PoolConfig};
pub use driver::{Cursor, MemoryDriver, QueryError, Value};
pub use pool::{ExecuteError, Pool, PoolError, PoolStatus, PooledConnection};
