//! Shared fixtures: a call-tracking fake executor and canned LLM replies.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use sqlbeam::exec::{ExecError, ExecutorFactory, ResultSet, Row, SqlExecutor, Value};

/// Rows returned for a SQL pattern, plus an optional artificial delay.
#[derive(Clone)]
pub struct CannedResponse {
    pub rows: Vec<Row>,
    pub delay: Duration,
}

/// Shared state between a [`FakeFactory`] and the executors it opens.
#[derive(Default)]
pub struct FakeState {
    pub open_count: AtomicUsize,
    pub execute_count: AtomicUsize,
    /// substring-of-SQL -> canned response
    pub responses: Mutex<Vec<(String, CannedResponse)>>,
    /// substring-of-SQL -> execution count
    pub per_sql_counts: Mutex<FxHashMap<String, usize>>,
}

/// Factory whose executors share counters; `open` is counted so tests
/// can assert the single-connection invariant.
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub state: Arc<FakeState>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register canned rows for any SQL containing `key`.
    pub fn respond(&self, key: &str, rows: Vec<Row>) -> &Self {
        self.respond_with_delay(key, rows, Duration::ZERO)
    }

    pub fn respond_with_delay(&self, key: &str, rows: Vec<Row>, delay: Duration) -> &Self {
        self.state
            .responses
            .lock()
            .unwrap()
            .push((key.to_string(), CannedResponse { rows, delay }));
        self
    }

    pub fn open_count(&self) -> usize {
        self.state.open_count.load(Ordering::SeqCst)
    }

    pub fn executions_matching(&self, key: &str) -> usize {
        self.state
            .per_sql_counts
            .lock()
            .unwrap()
            .iter()
            .filter(|(sql, _)| sql.contains(key))
            .map(|(_, n)| *n)
            .sum()
    }
}

impl ExecutorFactory for FakeFactory {
    fn open(&self) -> Result<Box<dyn SqlExecutor>, ExecError> {
        self.state.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeExecutor {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeExecutor {
    state: Arc<FakeState>,
}

impl SqlExecutor for FakeExecutor {
    fn execute(&mut self, sql: &str, _timeout: Duration) -> Result<ResultSet, ExecError> {
        self.state.execute_count.fetch_add(1, Ordering::SeqCst);
        *self
            .state
            .per_sql_counts
            .lock()
            .unwrap()
            .entry(sql.to_string())
            .or_insert(0) += 1;

        let canned = self
            .state
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(key, _)| sql.contains(key.as_str()))
            .map(|(_, response)| response.clone());

        let response = canned.unwrap_or_else(|| CannedResponse {
            rows: default_rows(),
            delay: Duration::ZERO,
        });
        if !response.delay.is_zero() {
            std::thread::sleep(response.delay);
        }
        Ok(ResultSet {
            columns: vec!["id".into(), "val".into()],
            rows: response.rows,
        })
    }

    fn explain(&mut self, _sql: &str) -> Result<String, ExecError> {
        Ok("SEQ_SCAN table (rows=100)".to_string())
    }
}

pub fn default_rows() -> Vec<Row> {
    (0..10)
        .map(|i| vec![Value::Int(i), Value::Int(i * 10)])
        .collect()
}

pub fn int_rows(n: i64) -> Vec<Row> {
    (0..n).map(|i| vec![Value::Int(i), Value::Int(i * 10)]).collect()
}

/// The correlated-subquery query used across the end-to-end tests.
pub const CORRELATED_SQL: &str = "SELECT sr.customer_sk AS ctr_customer_sk \
     FROM store_returns AS sr \
     WHERE sr.return_amt > (SELECT AVG(sr2.return_amt) * 1.2 \
                            FROM store_returns AS sr2 \
                            WHERE sr2.store_sk = sr.store_sk)";

/// A decorrelating patch plan for [`CORRELATED_SQL`]: pre-aggregate per
/// store, join the averages in, drop the correlated predicate.
pub fn decorrelation_plan_json(plan_id: &str) -> String {
    format!(
        r#"{{
  "plan_id": "{plan_id}",
  "dialect": "duckdb",
  "steps": [
    {{
      "step_id": "s1",
      "op": "insert_cte",
      "target": {{"by_node_id": "S0"}},
      "payload": {{
        "cte_name": "store_avg",
        "cte_query_sql": "SELECT store_sk, AVG(return_amt) * 1.2 AS threshold FROM store_returns GROUP BY store_sk"
      }},
      "description": "pre-aggregate per-store thresholds"
    }},
    {{
      "step_id": "s2",
      "op": "replace_from",
      "target": {{"by_node_id": "S0"}},
      "payload": {{
        "from_sql": "store_returns AS sr JOIN store_avg ON store_avg.store_sk = sr.store_sk"
      }},
      "description": "join the thresholds instead of re-scanning"
    }},
    {{
      "step_id": "s3",
      "op": "replace_where_predicate",
      "target": {{"by_node_id": "S0"}},
      "payload": {{"expr_sql": "sr.return_amt > store_avg.threshold"}},
      "description": "drop the correlated subquery"
    }}
  ]
}}"#
    )
}

/// A wide analyst dispatch with a single decorrelation probe.
pub fn analyst_response_one_probe() -> String {
    r#"{
  "dispatch": {
    "hypothesis": "Correlated subquery re-executes per row",
    "probe_count": 1,
    "equivalence_tier": "unordered",
    "reasoning_trace": ["nested loop dominates the plan"],
    "do_not_do": []
  },
  "probes": [
    {
      "probe_id": "p01",
      "transform_id": "decorrelate_scalar_subquery",
      "family": "B",
      "target": "replace the correlated AVG subquery with a pre-aggregated join",
      "confidence": 0.9,
      "recommended_patch_ops": ["insert_cte", "replace_from", "replace_where_predicate"]
    }
  ]
}"#
    .to_string()
}
