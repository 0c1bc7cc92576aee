//! In-process [`Driver`] that evaluates constant `SELECT` statements.
//!
//! `MemoryDriver` exists so hosts can exercise pools and chains without a
//! database server: in unit tests, demos and local development. It
//! understands a deliberately tiny dialect:
//!
//! ```text
//! SELECT expr [, expr]* [;]
//! expr := term (('+' | '-') term)*
//! term := atom (('*' | '/') atom)*
//! atom := integer | float | 'text' | NULL | TRUE | FALSE | %s | '(' expr ')' | '-' atom
//! ```
//!
//! Integer division by zero fails with a statement error, like a real server.
//! The driver can also be scripted to fail connection attempts, to delay
//! every statement, and to treat chosen statements as fatal session errors.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

use super::{BoxFuture, ConnectError, Connection, Cursor, Driver, QueryError, Row, Value};
use crate::config::ConnectParams;

#[derive(Debug, Default)]
struct Script {
    failing_connects: usize,
    latency: Duration,
    fatal_statements: HashSet<String>,
    connects: usize,
    open: usize,
    executed: Vec<String>,
}

/// Scriptable in-memory driver. Cloning shares the script and counters.
///
/// # Examples
///
/// ```
/// use chainpool::driver::{Driver, MemoryDriver, Value};
/// use chainpool::config::ConnectParams;
///
/// # tokio_test_block(async {
/// let driver = MemoryDriver::new();
/// let mut conn = driver.connect(&ConnectParams::default()).await.unwrap();
/// let cursor = conn.execute("SELECT 42, %s;", &[Value::Int(23)]).await.unwrap();
/// assert_eq!(cursor.fetch_all(), vec![vec![Value::Int(42), Value::Int(23)]]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    script: Arc<Mutex<Script>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// Delays every statement by `latency` before it resolves.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Executing exactly `text` fails with a fatal (session-level) error.
    #[must_use]
    pub fn with_fatal_statement(self, text: impl Into<String>) -> Self {
        self.lock().fatal_statements.insert(text.into());
        self
    }

    /// Successful connection attempts so far.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Connections opened and not yet closed or dropped.
    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    /// Every statement submitted, in submission order.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        // The script holds plain counters; a poisoned guard is still consistent.
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Driver for MemoryDriver {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, ConnectError>> {
        Box::pin(async move {
            let mut script = self.lock();
            if script.failing_connects > 0 {
                script.failing_connects -= 1;
                return Err(ConnectError::new(params.target(), "connection refused"));
            }
            script.connects += 1;
            script.open += 1;
            let id = script.connects;
            drop(script);
            trace!(id, target = %params.target(), "memory connection opened");
            Ok(Box::new(MemoryConnection {
                id,
                driver: self.clone(),
            }) as Box<dyn Connection>)
        })
    }
}

struct MemoryConnection {
    id: usize,
    driver: MemoryDriver,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut script = self.driver.lock();
        script.open = script.open.saturating_sub(1);
    }
}

impl Connection for MemoryConnection {
    fn execute<'a>(
        &'a mut self,
        text: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Result<Cursor, QueryError>> {
        Box::pin(async move {
            let (latency, fatal) = {
                let mut script = self.driver.lock();
                script.executed.push(text.to_owned());
                (script.latency, script.fatal_statements.contains(text))
            };
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            trace!(id = self.id, text, "memory statement");
            if fatal {
                return Err(QueryError::fatal("server closed the connection unexpectedly"));
            }
            evaluate(text, params)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        trace!(id = self.id, "memory connection closed");
        drop(self);
        Box::pin(async {})
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Text(String),
    Word(String),
    Placeholder,
    Op(char),
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut number = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = if number.contains('.') {
                    number.parse().map(Token::Float).ok()
                } else {
                    number.parse().map(Token::Int).ok()
                };
                tokens.push(token.ok_or_else(|| {
                    QueryError::statement(format!("invalid number literal \"{number}\""))
                })?);
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            text.push('\'');
                        }
                        Some('\'') => break,
                        Some(ch) => text.push(ch),
                        None => return Err(QueryError::statement("unterminated string literal")),
                    }
                }
                tokens.push(Token::Text(text));
            }
            '%' => {
                chars.next();
                if chars.next() != Some('s') {
                    return Err(QueryError::statement("only %s placeholders are supported"));
                }
                tokens.push(Token::Placeholder);
            }
            '+' | '-' | '*' | '/' | '(' | ')' | ',' | ';' => {
                chars.next();
                tokens.push(Token::Op(c));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&w) = chars.peek() {
                    if w.is_alphanumeric() || w == '_' {
                        word.push(w);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            other => {
                return Err(QueryError::statement(format!(
                    "syntax error at or near \"{other}\""
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [Value],
    next_param: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, op: char) -> bool {
        if self.peek() == Some(&Token::Op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn select(&mut self) -> Result<Row, QueryError> {
        match self.bump() {
            Some(Token::Word(w)) if w == "SELECT" => {}
            _ => return Err(QueryError::statement("only SELECT statements are supported")),
        }

        let mut row = vec![self.expr()?];
        while self.eat_op(',') {
            row.push(self.expr()?);
        }
        self.eat_op(';');

        if self.pos < self.tokens.len() {
            return Err(QueryError::statement("unexpected trailing input"));
        }
        if self.next_param != self.params.len() {
            return Err(QueryError::statement(format!(
                "statement uses {} parameters but {} were supplied",
                self.next_param,
                self.params.len()
            )));
        }
        Ok(row)
    }

    fn expr(&mut self) -> Result<Value, QueryError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ('+' | '-'))) => *op,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = arithmetic(op, lhs, rhs)?;
        }
    }

    fn term(&mut self) -> Result<Value, QueryError> {
        let mut lhs = self.atom()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ('*' | '/'))) => *op,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.atom()?;
            lhs = arithmetic(op, lhs, rhs)?;
        }
    }

    fn atom(&mut self) -> Result<Value, QueryError> {
        match self.bump() {
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(x)) => Ok(Value::Float(x)),
            Some(Token::Text(s)) => Ok(Value::Text(s)),
            Some(Token::Word(w)) => match w.as_str() {
                "NULL" => Ok(Value::Null),
                "TRUE" => Ok(Value::Bool(true)),
                "FALSE" => Ok(Value::Bool(false)),
                _ => Err(QueryError::statement(format!(
                    "column \"{}\" does not exist",
                    w.to_lowercase()
                ))),
            },
            Some(Token::Placeholder) => {
                let value = self.params.get(self.next_param).cloned().ok_or_else(|| {
                    QueryError::statement("not enough parameters for placeholders")
                })?;
                self.next_param += 1;
                Ok(value)
            }
            Some(Token::Op('(')) => {
                let value = self.expr()?;
                if !self.eat_op(')') {
                    return Err(QueryError::statement("expected \")\""));
                }
                Ok(value)
            }
            Some(Token::Op('-')) => arithmetic('-', Value::Int(0), self.atom()?),
            _ => Err(QueryError::statement("syntax error at end of input")),
        }
    }
}

fn arithmetic(op: char, lhs: Value, rhs: Value) -> Result<Value, QueryError> {
    match (lhs, rhs) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(a), Value::Int(b)) => {
            let result = match op {
                '+' => a.checked_add(b),
                '-' => a.checked_sub(b),
                '*' => a.checked_mul(b),
                _ if b == 0 => return Err(QueryError::statement("division by zero")),
                _ => a.checked_div(b),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| QueryError::statement("integer out of range"))
        }
        (a, b) => {
            let (a, b) = (as_float(&a)?, as_float(&b)?);
            Ok(Value::Float(match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                _ if b == 0.0 => return Err(QueryError::statement("division by zero")),
                _ => a / b,
            }))
        }
    }
}

fn as_float(value: &Value) -> Result<f64, QueryError> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(x) => Ok(*x),
        other => Err(QueryError::statement(format!(
            "operator does not exist for {other}"
        ))),
    }
}

fn evaluate(text: &str, params: &[Value]) -> Result<Cursor, QueryError> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
        params,
        next_param: 0,
    };
    let row = parser.select()?;
    let columns = vec!["?column?".to_owned(); row.len()];
    Ok(Cursor::new(columns, vec![row]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn eval(text: &str) -> Result<Row, QueryError> {
        evaluate(text, &[]).map(|c| c.into_rows().remove(0))
    }

    #[test]
    fn literals() {
        assert_eq!(eval("SELECT 1;").unwrap(), params![1]);
        assert_eq!(
            eval("select 42, 12, 'a''b', null, true").unwrap(),
            vec![
                Value::Int(42),
                Value::Int(12),
                Value::Text("a'b".into()),
                Value::Null,
                Value::Bool(true)
            ]
        );
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval("SELECT 1 + 2 * 3, (1 + 2) * 3, -4 / 2;").unwrap(), params![7, 9, -2]);
        assert_eq!(eval("SELECT 1.5 * 2;").unwrap(), params![3.0]);
    }

    #[test]
    fn division_by_zero_fails() {
        let err = eval("SELECT 1/0;").unwrap_err();
        assert_eq!(err.message, "division by zero");
        assert!(!err.fatal);
    }

    #[test]
    fn placeholders_bind_in_order() {
        let cursor = evaluate("SELECT 42, %s, 11, %s;", &params![23, "x"]).unwrap();
        assert_eq!(cursor.fetch_all(), vec![params![42, 23, 11, "x"]]);
        assert_eq!(cursor.columns().len(), 4);
    }

    #[test]
    fn placeholder_count_mismatch() {
        assert!(evaluate("SELECT %s;", &[]).is_err());
        assert!(evaluate("SELECT 1;", &params![1]).is_err());
    }

    #[test]
    fn rejects_unknown_statements() {
        assert!(eval("DELETE FROM users;").is_err());
        assert!(eval("SELECT foo;").is_err());
        assert!(eval("SELECT 1 2;").is_err());
        assert!(eval("SELECT 'open").is_err());
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(1);
        let params = ConnectParams::new("localhost", "test");

        let err = driver.connect(&params).await.err().unwrap();
        assert_eq!(err.target, "localhost/test");

        let conn = driver.connect(&params).await.unwrap();
        assert_eq!(driver.connects(), 1);
        assert_eq!(driver.open_connections(), 1);

        conn.close().await;
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test]
    async fn fatal_statement() {
        let driver = MemoryDriver::new().with_fatal_statement("SELECT 2;");
        let mut conn = driver.connect(&ConnectParams::default()).await.unwrap();
        let err = conn.execute("SELECT 2;", &[]).await.unwrap_err();
        assert!(err.fatal);
        assert_eq!(driver.executed(), vec!["SELECT 2;".to_string()]);
    }
}
