//! Session orchestration: one run of the beam search over a single query.
//!
//! The public entry point is [`run_session`] — synchronous by design; the
//! orchestrator owns a Tokio runtime internally and async never leaks
//! into the API. Per-query state machine:
//!
//! ```text
//! INIT → ANALYST → WORKERS(parallel) → VALIDATE → BENCHMARK
//!      → [RETRY_TIER1 → VALIDATE → BENCHMARK]? → SNIPER? → COMPLETE
//! ```

mod analyze;
mod artifacts;
mod beam;
mod router;

pub use analyze::{
    analyze_sessions, dedup_candidates, format_report, PromotionCandidate, SessionScan,
};
pub use artifacts::{write_benchmark_csv, SessionArtifacts, StatusManifest};
pub use beam::{is_sniper_retry_error_candidate, BeamSession};
pub use router::{assign_importance_stars, route_mode};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bench::BenchmarkKnobs;
use crate::candidate::Candidate;
use crate::dialect::Dialect;
use crate::exec::{ExecError, ExecutorFactory};
use crate::ir::IrError;
use crate::llm::LlmClient;
use crate::validate::Validator;

/// Search mode for one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeamMode {
    /// Many shallow probes; fast worker lane.
    Wide,
    /// One to four deep targets; strong worker lane.
    Focused,
    /// Single-shot whole-query rewrite with a strong model.
    Reasoning,
}

/// Execution-plan input: a raw text block or a structured object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExplainInput {
    #[serde(default)]
    pub plan_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_json: Option<serde_json::Value>,
}

impl ExplainInput {
    pub fn from_text(plan_text: impl Into<String>) -> Self {
        Self {
            plan_text: plan_text.into(),
            execution_time_ms: None,
            plan_json: None,
        }
    }

    /// Accept either the JSON object form or a bare text block.
    pub fn parse(input: &str) -> Self {
        match serde_json::from_str::<ExplainInput>(input) {
            Ok(parsed) if !parsed.plan_text.is_empty() => parsed,
            _ => Self::from_text(input),
        }
    }
}

/// Final outcome of one session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionResult {
    pub query_id: String,
    pub baseline_ms: f64,
    pub baseline_rows: Option<usize>,
    pub baseline_checksum: String,
    pub candidates: Vec<Candidate>,
    pub best_patch_idx: Option<usize>,
    pub best_speedup: f64,
}

impl SessionResult {
    /// An aborted session: no candidates survived; the original SQL is
    /// the best known answer.
    pub fn aborted(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            baseline_ms: 0.0,
            baseline_rows: None,
            baseline_checksum: crate::exec::UNKNOWN_CHECKSUM.to_string(),
            candidates: Vec::new(),
            best_patch_idx: None,
            best_speedup: 1.0,
        }
    }

    pub fn best_sql(&self) -> Option<&str> {
        self.best_patch_idx
            .and_then(|i| self.candidates.get(i))
            .and_then(|c| c.output_sql.as_deref())
    }

    /// The SQL to ship: the winner's, or the original when nothing won.
    pub fn best_sql_or<'a>(&'a self, original: &'a str) -> &'a str {
        self.best_sql().unwrap_or(original)
    }
}

/// Errors that abort a session before it can produce a result.
#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    /// Missing API key, unresolvable DSN, bad knobs: checked before any
    /// LLM call.
    #[error("configuration error: {message}")]
    #[diagnostic(code(sqlbeam::session::config))]
    Config { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Exec(#[from] ExecError),

    #[error("runtime error: {message}")]
    #[diagnostic(code(sqlbeam::session::runtime))]
    Runtime { message: String },
}

/// Per-session tunables.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub dialect: Dialect,
    pub engine_version: Option<String>,
    pub mode: BeamMode,
    /// The strong-model lane; when off, focused/reasoning fall back to
    /// wide silently.
    pub enable_reasoning: bool,
    pub worker_parallelism: usize,
    pub retry_tier1: bool,
    pub sniper_enabled: bool,
    /// Confirmed speedup that cancels outstanding workers.
    pub early_stop_speedup: Option<f64>,
    pub importance_stars: u8,
    pub schema_context: String,
    /// Per-dialect playbook text for prompts; empty selects the built-in
    /// playbook from [`crate::knowledge`].
    pub engine_knowledge: String,
    /// Patch-plan output contract (vs whole-SQL).
    pub patch_mode: bool,
    /// Session-level guardrails injected into the analyst prompt.
    pub do_not_do: Vec<String>,
    pub gold_examples_per_prompt: usize,
    pub knobs: BenchmarkKnobs,
    pub validator: Validator,
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::DuckDb,
            engine_version: None,
            mode: BeamMode::Wide,
            enable_reasoning: false,
            worker_parallelism: 8,
            retry_tier1: true,
            sniper_enabled: true,
            early_stop_speedup: None,
            importance_stars: 1,
            schema_context: String::new(),
            engine_knowledge: String::new(),
            patch_mode: true,
            do_not_do: Vec::new(),
            gold_examples_per_prompt: 2,
            knobs: BenchmarkKnobs::default(),
            validator: Validator::default(),
            artifacts_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: BeamMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_reasoning_enabled(mut self, enabled: bool) -> Self {
        self.enable_reasoning = enabled;
        self
    }

    #[must_use]
    pub fn with_worker_parallelism(mut self, workers: usize) -> Self {
        self.worker_parallelism = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_early_stop(mut self, speedup: f64) -> Self {
        self.early_stop_speedup = Some(speedup);
        self
    }

    #[must_use]
    pub fn with_knobs(mut self, knobs: BenchmarkKnobs) -> Self {
        self.knobs = knobs;
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.knobs.timeout = timeout;
        self.validator.query_timeout = timeout;
        self
    }

    /// The mode this session actually runs: focused and reasoning demand
    /// the strong lane, and fall back to wide silently when it is off.
    pub fn effective_mode(&self) -> BeamMode {
        match self.mode {
            BeamMode::Wide => BeamMode::Wide,
            BeamMode::Focused | BeamMode::Reasoning if !self.enable_reasoning => BeamMode::Wide,
            other => other,
        }
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.worker_parallelism == 0 {
            return Err(SessionError::Config {
                message: "worker_parallelism must be at least 1".into(),
            });
        }
        if self.knobs.timeout.is_zero() {
            return Err(SessionError::Config {
                message: "query timeout must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Environment keys for the LLM lane. Resolution failures are fatal
/// configuration errors raised before any model call.
pub const ENV_LLM_PROVIDER: &str = "SQLBEAM_LLM_PROVIDER";
pub const ENV_LLM_MODEL: &str = "SQLBEAM_LLM_MODEL";

/// Resolve `(provider, model)` from the environment (`.env` honored).
pub fn resolve_llm_env() -> Result<(String, String), SessionError> {
    dotenvy::dotenv().ok();
    let provider = std::env::var(ENV_LLM_PROVIDER).map_err(|_| SessionError::Config {
        message: format!("{ENV_LLM_PROVIDER} is not set"),
    })?;
    let model = std::env::var(ENV_LLM_MODEL).map_err(|_| SessionError::Config {
        message: format!("{ENV_LLM_MODEL} is not set"),
    })?;
    if provider.trim().is_empty() {
        return Err(SessionError::Config {
            message: format!("{ENV_LLM_PROVIDER} is empty"),
        });
    }
    if model.trim().is_empty() {
        return Err(SessionError::Config {
            message: format!("{ENV_LLM_MODEL} is empty"),
        });
    }
    Ok((provider, model))
}

/// Library entry point: run one full session over one query.
pub fn run_session(
    query_id: &str,
    sql: &str,
    explain: &ExplainInput,
    llm: Arc<dyn LlmClient>,
    dataset_factory: Arc<dyn ExecutorFactory>,
    config: SessionConfig,
) -> Result<SessionResult, SessionError> {
    BeamSession::new(config, llm, dataset_factory).run(query_id, sql, explain)
}
