//! Database driver capability — the seam between the pool and a real client.
//!
//! The pool never speaks a wire protocol itself. It consumes a [`Driver`]
//! that can open [`Connection`]s, and each connection can execute one
//! statement at a time, producing a fully materialized [`Cursor`].
//!
//! This module provides the core primitives:
//! [`Driver`], [`Connection`], [`Cursor`], [`Row`] and [`Value`].
//!
//! An in-process implementation, [`MemoryDriver`], lives in [`memory`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::config::ConnectParams;

pub mod memory;

pub use memory::MemoryDriver;

/// Heap-allocated, `Send` future returned by driver trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure to establish a database session.
#[derive(Debug, Clone, Error)]
#[error("failed to connect to {target}: {message}")]
pub struct ConnectError {
    /// `host/database` the attempt was aimed at.
    pub target: String,
    /// Driver-reported reason.
    pub message: String,
}

impl ConnectError {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Failure reported by the driver while executing a statement.
///
/// `fatal` errors mean the session itself is unusable (lost socket, protocol
/// desync); the pool closes such connections instead of reusing them.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
    pub fatal: bool,
}

impl QueryError {
    /// A statement-level failure; the connection stays usable.
    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// A session-level failure; the connection must be discarded.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// A single column value.
///
/// # Examples
///
/// ```
/// use chainpool::driver::Value;
///
/// let v: Value = 23.into();
/// assert_eq!(v, Value::Int(23));
/// assert_eq!(v.to_string(), "23");
/// assert!(Value::Null.is_null());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer payload, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the text payload, if this is a `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Builds a `Vec<Value>` of query parameters.
///
/// ```
/// use chainpool::{params, driver::Value};
///
/// let p = params![23, "abc", None::<i64>];
/// assert_eq!(p, vec![Value::Int(23), Value::Text("abc".into()), Value::Null]);
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::driver::Value>::new() };
    ($($v:expr),+ $(,)?) => {
        ::std::vec![$($crate::driver::Value::from($v)),+]
    };
}

/// One result row.
pub type Row = Vec<Value>;

/// A statement's fully fetched result set.
///
/// There is no server-side cursor behind it: the driver materializes every
/// row before resolving `execute`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cursor {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Cursor {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// A cursor with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Returns a copy of every row.
    pub fn fetch_all(&self) -> Vec<Row> {
        self.rows.clone()
    }

    /// Returns the first row, if any.
    pub fn fetch_one(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// A live database session capable of executing one statement at a time.
///
/// `&mut self` on [`execute`](Connection::execute) is what enforces the
/// one-statement-at-a-time rule: the borrow lasts until the returned future
/// resolves or is dropped. Dropping that future aborts the statement.
pub trait Connection: Send {
    /// Submits `text` with positional `params` and resolves once every row is fetched.
    fn execute<'a>(
        &'a mut self,
        text: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Result<Cursor, QueryError>>;

    /// Terminates the session.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Factory for [`Connection`]s.
///
/// Drivers are shared by every establishment task of a pool, so they must be
/// `Send + Sync + 'static`.
pub trait Driver: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, ConnectError>>;
}
