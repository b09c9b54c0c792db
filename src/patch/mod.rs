//! Patch plans: declarative, anchor-addressed edits to a Script IR.
//!
//! A [`PatchPlan`] is the wire format workers speak: an ordered list of
//! typed [`PatchStep`]s, each naming an operation from a closed set, a
//! target (statement id, CTE label, anchor hash) and a SQL payload. The
//! engine in [`apply_patch_plan`] executes plans; [`extract`] pulls them
//! out of raw LLM responses.

mod engine;
mod extract;

pub use engine::{apply_patch_plan, PatchResult};
pub use extract::{
    detect_format, extract_fenced_sql, extract_json, parse_patch_plan, parse_worker_response,
    ResponseFormat, WorkerReply, MAX_PLAN_STEPS,
};

use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialect::Dialect;

/// Closed set of edit operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    InsertCte,
    ReplaceFrom,
    ReplaceWherePredicate,
    ReplaceBody,
    ReplaceExprSubtree,
    DeleteExprSubtree,
    ReplaceBlockWithCtePair,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchOp::InsertCte => "insert_cte",
            PatchOp::ReplaceFrom => "replace_from",
            PatchOp::ReplaceWherePredicate => "replace_where_predicate",
            PatchOp::ReplaceBody => "replace_body",
            PatchOp::ReplaceExprSubtree => "replace_expr_subtree",
            PatchOp::DeleteExprSubtree => "delete_expr_subtree",
            PatchOp::ReplaceBlockWithCtePair => "replace_block_with_cte_pair",
        };
        f.write_str(name)
    }
}

/// Addressing for one step. `by_node_id` resolves a statement,
/// `by_anchor_hash` a unique expression subtree, `by_label` a named CTE.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_anchor_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_label: Option<String>,
}

/// SQL payload of one step. Which field is required depends on the op.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cte_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cte_query_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_fragment: Option<String>,
}

impl PatchPayload {
    /// All SQL-bearing fields, for lint checks (ellipsis guard).
    pub fn sql_fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("cte_query_sql", self.cte_query_sql.as_deref()),
            ("from_sql", self.from_sql.as_deref()),
            ("expr_sql", self.expr_sql.as_deref()),
            ("sql_fragment", self.sql_fragment.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}

/// One ordered edit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchStep {
    #[serde(default)]
    pub step_id: String,
    pub op: PatchOp,
    #[serde(default)]
    pub target: PatchTarget,
    #[serde(default)]
    pub payload: PatchPayload,
    #[serde(default)]
    pub description: String,
    /// Unknown keys are tolerated (and surfaced as parse warnings).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An ordered list of steps; steps execute left to right, each seeing the
/// IR state produced by its predecessors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchPlan {
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<Dialect>,
    pub steps: Vec<PatchStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postconditions: Vec<String>,
    /// Set when the plan deliberately changes the output column list; the
    /// column-preservation invariant is waived for such plans.
    #[serde(default)]
    pub select_list_change: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PatchPlan {
    /// An empty plan: applying it is the identity on rendered SQL.
    pub fn empty(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            dialect: None,
            steps: Vec::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            select_list_change: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// Failure mode of a step, reported to callers by code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchErrorKind {
    UnresolvedTarget,
    AmbiguousAnchor,
    PayloadParseError,
    CteNameCollision,
    ColumnInvariantViolated,
    PostconditionFailed,
}

impl fmt::Display for PatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchErrorKind::UnresolvedTarget => "UNRESOLVED_TARGET",
            PatchErrorKind::AmbiguousAnchor => "AMBIGUOUS_ANCHOR",
            PatchErrorKind::PayloadParseError => "PAYLOAD_PARSE_ERROR",
            PatchErrorKind::CteNameCollision => "CTE_NAME_COLLISION",
            PatchErrorKind::ColumnInvariantViolated => "COLUMN_INVARIANT_VIOLATED",
            PatchErrorKind::PostconditionFailed => "POSTCONDITION_FAILED",
        };
        f.write_str(name)
    }
}

/// Structured step failure: kind code, human message, offending step.
#[derive(Clone, Debug, Error, Diagnostic, Serialize, Deserialize)]
#[error("{kind}: {message} (step {step_id})")]
#[diagnostic(code(sqlbeam::patch::step_failed))]
pub struct PatchError {
    pub kind: PatchErrorKind,
    pub message: String,
    pub step_id: String,
}

impl PatchError {
    pub fn new(kind: PatchErrorKind, step_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_id: step_id.to_string(),
        }
    }
}

/// Errors from parsing plans out of raw responses (not step failures).
#[derive(Debug, Error, Diagnostic)]
pub enum PlanParseError {
    #[error("no JSON object found in response")]
    #[diagnostic(code(sqlbeam::patch::no_json))]
    NoJson,

    #[error("response JSON is malformed: {message}")]
    #[diagnostic(code(sqlbeam::patch::bad_json))]
    BadJson { message: String },

    #[error("missing required key {key:?}")]
    #[diagnostic(
        code(sqlbeam::patch::missing_key),
        help("patch-mode plans need `plan_id` and `steps`; whole-SQL replies need `optimized_sql`")
    )]
    MissingKey { key: &'static str },

    #[error("plan has {count} steps; the cap is {cap}")]
    #[diagnostic(code(sqlbeam::patch::too_many_steps))]
    TooManySteps { count: usize, cap: usize },

    #[error("payload field {field} of step {step_id} contains an ellipsis; payloads must be full executable SQL")]
    #[diagnostic(code(sqlbeam::patch::elided_payload))]
    ElidedPayload { step_id: String, field: &'static str },

    #[error("response contained {count} trees; at most {cap} are accepted")]
    #[diagnostic(code(sqlbeam::patch::too_many_trees))]
    TooManyTrees { count: usize, cap: usize },
}
