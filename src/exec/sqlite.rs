//! Bundled SQLite backend for local runs and tests.
//!
//! SQLite is not an optimization target dialect; this backend exists so
//! the Tier-2/Tier-3 validators and the benchmark runner can execute
//! against a real engine without external services. Timeouts are advisory:
//! SQLite has no statement-level budget, so overruns surface as slow runs
//! rather than `ExecError::Timeout`.

use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::{EngineKind, ExecError, ExecutorFactory, ResultSet, Row, SqlExecutor, Value};

pub struct SqliteExecutor {
    conn: Connection,
}

impl SqliteExecutor {
    pub fn open(target: &str) -> Result<Self, ExecError> {
        let conn = if target == ":memory:" || target.is_empty() {
            Connection::open_in_memory()
        } else {
            Connection::open(target)
        }
        .map_err(|e| ExecError::Connection {
            message: e.to_string(),
        })?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    fn run_one(&mut self, sql: &str) -> Result<ResultSet, ExecError> {
        let mut statement = self.conn.prepare(sql).map_err(exec_err)?;
        let columns: Vec<String> = statement
            .column_names()
            .iter()
            .map(|c| c.to_string())
            .collect();
        let column_count = columns.len();

        let mut rows = statement.query([]).map_err(exec_err)?;
        let mut out: Vec<Row> = Vec::new();
        while let Some(row) = rows.next().map_err(exec_err)? {
            let mut converted = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = match row.get_ref(i).map_err(exec_err)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::Int(v),
                    ValueRef::Real(v) => Value::Float(v),
                    ValueRef::Text(bytes) => {
                        Value::Text(String::from_utf8_lossy(bytes).into_owned())
                    }
                    ValueRef::Blob(bytes) => Value::Text(hex(bytes)),
                };
                converted.push(value);
            }
            out.push(converted);
        }
        Ok(ResultSet { columns, rows: out })
    }
}

impl SqlExecutor for SqliteExecutor {
    fn execute(&mut self, sql: &str, _timeout: Duration) -> Result<ResultSet, ExecError> {
        let mut last = ResultSet::default();
        for statement in split_statements(sql) {
            last = self.run_one(&statement)?;
        }
        Ok(last)
    }

    fn explain(&mut self, sql: &str) -> Result<String, ExecError> {
        let explained = format!("EXPLAIN QUERY PLAN {sql}");
        let result = self.run_one(&explained)?;
        let mut lines = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let text = row
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(" | ");
            lines.push(text);
        }
        Ok(lines.join("\n"))
    }
}

/// Split a script into statements, respecting string literals.
///
/// Falls back to the raw text when the generic parser rejects the script
/// (vendor syntax SQLite may still accept).
fn split_statements(sql: &str) -> Vec<String> {
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) if !statements.is_empty() => {
            statements.iter().map(ToString::to_string).collect()
        }
        _ => vec![sql.to_string()],
    }
}

fn exec_err(e: rusqlite::Error) -> ExecError {
    ExecError::Execution {
        message: e.to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut acc, b| {
            use std::fmt::Write as _;
            let _ = write!(acc, "{b:02x}");
            acc
        },
    )
}

/// Factory for the bundled backend; `open` is invoked exactly once per
/// benchmark call.
pub struct SqliteFactory {
    target: String,
    setup_sql: Option<String>,
}

impl SqliteFactory {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            setup_sql: None,
        }
    }

    /// DDL/DML executed right after each open; in-memory databases use
    /// this to materialize fixtures.
    #[must_use]
    pub fn with_setup_sql(mut self, sql: impl Into<String>) -> Self {
        self.setup_sql = Some(sql.into());
        self
    }

    pub fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }
}

impl ExecutorFactory for SqliteFactory {
    fn open(&self) -> Result<Box<dyn SqlExecutor>, ExecError> {
        let executor = SqliteExecutor::open(&self.target)?;
        if let Some(setup) = &self.setup_sql {
            executor
                .conn
                .execute_batch(setup)
                .map_err(|e| ExecError::Connection {
                    message: format!("setup failed: {e}"),
                })?;
        }
        Ok(Box::new(executor))
    }
}
