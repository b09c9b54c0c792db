//! Execution seam: the value model, the single-connection executor
//! contract, connection-spec parsing, and result-set checksums.
//!
//! Real engines (DuckDB, PostgreSQL, Snowflake) plug in behind
//! [`ExecutorFactory`]; the crate ships a [`rusqlite`]-backed executor for
//! local runs and tests when the `sqlite` feature is enabled.

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteExecutor, SqliteFactory};

use std::fmt;
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// One cell of a result row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Canonical text used for checksums and unordered sort keys.
    ///
    /// Floats are rounded to 9 significant digits so that values the
    /// equivalence tolerance treats as equal canonicalize identically.
    pub fn canonical(&self) -> String {
        match self {
            Value::Null => "∅".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => canonical_float(*f),
            Value::Text(s) => s.clone(),
        }
    }
}

fn canonical_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }
    // 9 significant digits: {:.8e} keeps one digit before the point.
    format!("{f:.8e}")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

pub type Row = Vec<Value>;

/// Rows plus column names, as returned by one execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Row-order-insensitive 16-hex checksum of the whole result set.
    ///
    /// Per-row digests are combined with wrapping addition, so any
    /// permutation of the same row multiset yields the same checksum.
    pub fn checksum(&self) -> String {
        let mut combined: u64 = 0x9e37_79b9_7f4a_7c15 ^ self.rows.len() as u64;
        for row in &self.rows {
            let mut canon = String::new();
            for value in row {
                canon.push_str(&value.canonical());
                canon.push('\u{1f}');
            }
            combined = combined.wrapping_add(xxh3_64(canon.as_bytes()));
        }
        format!("{combined:016x}")
    }
}

/// Sentinel used for baselines that are known to time out: their row count
/// and checksum are unknown, and candidates skip the correctness compare.
pub const UNKNOWN_CHECKSUM: &str = "unknown";

/// Errors crossing the executor seam.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecError {
    #[error("connection failed: {message}")]
    #[diagnostic(code(sqlbeam::exec::connect))]
    Connection { message: String },

    #[error("execution failed: {message}")]
    #[diagnostic(code(sqlbeam::exec::execute))]
    Execution { message: String },

    #[error("timeout")]
    #[diagnostic(
        code(sqlbeam::exec::timeout),
        help("the statement exceeded the per-query budget")
    )]
    Timeout { budget: Duration },

    #[error("no executor backend for engine {engine}")]
    #[diagnostic(
        code(sqlbeam::exec::unsupported_backend),
        help("supply an ExecutorFactory for this engine when calling run_session")
    )]
    UnsupportedBackend { engine: EngineKind },
}

/// One open database connection executing statements sequentially.
///
/// Implementations must not share the underlying connection across threads;
/// the benchmark runner holds the executor for the whole call.
pub trait SqlExecutor: Send {
    fn execute(&mut self, sql: &str, timeout: Duration) -> Result<ResultSet, ExecError>;

    /// Fetch the engine's plan text for `sql`.
    fn explain(&mut self, sql: &str) -> Result<String, ExecError>;
}

/// Opens connections. A benchmark call invokes `open` exactly once.
pub trait ExecutorFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn SqlExecutor>, ExecError>;
}

/// Engine addressed by a connection URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    DuckDb,
    Postgres,
    Snowflake,
    Sqlite,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::DuckDb => "duckdb",
            EngineKind::Postgres => "postgres",
            EngineKind::Snowflake => "snowflake",
            EngineKind::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

/// Parsed connection target plus per-session knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub engine: EngineKind,
    pub target: String,
    pub knobs: FxHashMap<String, String>,
}

impl ConnectionSpec {
    /// Recognize a connection URI.
    ///
    /// `postgres://…` and `snowflake://…` keep their full DSN as the
    /// target; `sqlite://path`, `:memory:`, `*.db`/`*.sqlite` map to the
    /// bundled backend; anything ending in `.duckdb` (or a bare path) is a
    /// DuckDB file.
    pub fn parse(uri: &str) -> Self {
        let trimmed = uri.trim();
        let (engine, target) = if let Some(rest) = trimmed.strip_prefix("postgres://") {
            (EngineKind::Postgres, format!("postgres://{rest}"))
        } else if let Some(rest) = trimmed.strip_prefix("postgresql://") {
            (EngineKind::Postgres, format!("postgresql://{rest}"))
        } else if let Some(rest) = trimmed.strip_prefix("snowflake://") {
            (EngineKind::Snowflake, format!("snowflake://{rest}"))
        } else if let Some(rest) = trimmed.strip_prefix("sqlite://") {
            (EngineKind::Sqlite, rest.to_string())
        } else if trimmed == ":memory:"
            || trimmed.ends_with(".sqlite")
            || trimmed.ends_with(".db")
        {
            (EngineKind::Sqlite, trimmed.to_string())
        } else {
            (EngineKind::DuckDb, trimmed.to_string())
        };
        Self {
            engine,
            target,
            knobs: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_knob(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.knobs.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(rows: Vec<Row>) -> ResultSet {
        ResultSet {
            columns: vec!["a".into(), "b".into()],
            rows,
        }
    }

    #[test]
    fn checksum_is_order_insensitive() {
        let forward = rs(vec![
            vec![Value::Int(1), Value::Text("x".into())],
            vec![Value::Int(2), Value::Text("y".into())],
        ]);
        let backward = rs(vec![
            vec![Value::Int(2), Value::Text("y".into())],
            vec![Value::Int(1), Value::Text("x".into())],
        ]);
        assert_eq!(forward.checksum(), backward.checksum());
    }

    #[test]
    fn checksum_detects_value_changes() {
        let a = rs(vec![vec![Value::Int(1), Value::Null]]);
        let b = rs(vec![vec![Value::Int(2), Value::Null]]);
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn float_noise_inside_tolerance_shares_a_checksum() {
        let a = rs(vec![vec![Value::Float(1.0), Value::Null]]);
        let b = rs(vec![vec![Value::Float(1.0 + 1e-13), Value::Null]]);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn null_and_empty_string_differ() {
        let a = rs(vec![vec![Value::Null, Value::Null]]);
        let b = rs(vec![vec![Value::Text(String::new()), Value::Null]]);
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn connection_specs_route_by_scheme() {
        assert_eq!(
            ConnectionSpec::parse("postgres://u@h/db").engine,
            EngineKind::Postgres
        );
        assert_eq!(
            ConnectionSpec::parse("snowflake://acct/db").engine,
            EngineKind::Snowflake
        );
        assert_eq!(ConnectionSpec::parse(":memory:").engine, EngineKind::Sqlite);
        assert_eq!(
            ConnectionSpec::parse("tpcds.duckdb").engine,
            EngineKind::DuckDb
        );
    }
}
