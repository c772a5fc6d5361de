//! Contracts consumed from the outside world: the connection pool and the
//! remote-join client.
//!
//! The engine never opens connections itself; it acquires them from a caller
//! supplied [`Pool`] and releases them by dropping the [`Connection`]. Column
//! values travel as raw bytes so the JSON the database already assembled is
//! never reparsed on the way through.

use async_trait::async_trait;

use crate::{Error, Result};

/// Positional bind argument. The driver maps these onto its own parameter
/// types; `Null` binds SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// A JSON document bound as `json`/`jsonb`.
    Json(serde_json::Value),
}

impl Param {
    pub fn from_json(v: &serde_json::Value) -> Param {
        match v {
            serde_json::Value::Null => Param::Null,
            serde_json::Value::Bool(b) => Param::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Param::Int(i),
                None => Param::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Param::Text(s.clone()),
            other => Param::Json(other.clone()),
        }
    }
}

/// One result row; values are the driver's raw column bytes, `None` for NULL.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub values: Vec<Option<Vec<u8>>>,
}

#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub rows: Vec<Row>,
}

impl Rows {
    /// The first column of the first row, where the shaped JSON lives.
    pub fn first_value(&self) -> Option<&[u8]> {
        self.rows.first()?.values.first()?.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
pub trait Pool: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Box<dyn Connection>>;
}

/// A pooled connection. Dropping it returns it to the pool, which guarantees
/// release on every exit path.
#[async_trait]
pub trait Connection: Send {
    async fn exec(&mut self, sql: &str, args: &[Param]) -> Result<u64>;
    async fn query(&mut self, sql: &str, args: &[Param]) -> Result<Rows>;
}

/// Performs the HTTP call backing a remote relationship. `url` already has the
/// key value substituted in; the response body comes back as raw JSON bytes.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Decode a driver byte value as UTF-8 text.
pub(crate) fn text_value(v: &Option<Vec<u8>>) -> Result<String> {
    match v {
        Some(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| Error::Execution(format!("non-utf8 column value: {e}"))),
        None => Ok(String::new()),
    }
}

pub(crate) fn bool_value(v: &Option<Vec<u8>>) -> bool {
    matches!(
        v.as_deref(),
        Some(b"t") | Some(b"true") | Some(b"YES") | Some(b"1")
    )
}
