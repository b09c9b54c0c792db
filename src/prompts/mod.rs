//! Prompt assembly: the three archetypes (analyst, worker, sniper) plus
//! the worker retry variant.
//!
//! Everything here is text in, text out. Templates carry the normative
//! schema wording (required keys, step caps, no-ellipsis rule, the
//! always-allowed no-change fallback); the parsers in [`analyst`] and
//! [`crate::patch::extract`] enforce what the wording promises.

pub mod analyst;
pub mod sniper;
pub mod worker;

pub use analyst::{
    build_analyst_prompt, parse_analyst_response, AnalystMode, AnalystReply, FocusedTarget,
    ProbeSpec, ScoutResult, FOCUSED_MAX_TARGETS, WIDE_MAX_PROBES,
};
pub use sniper::{build_sniper_prompt, StrikeRow};
pub use worker::{build_worker_prompt, build_worker_retry_prompt};

use std::fmt;
use std::fmt::Write as _;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialect::Dialect;
use crate::gold::GoldExample;
use crate::transforms::GatedTransform;

/// Row-order significance communicated to the model and enforced by the
/// equivalence checker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquivalenceTier {
    Ordered,
    #[default]
    Unordered,
}

impl fmt::Display for EquivalenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EquivalenceTier::Ordered => "ordered",
            EquivalenceTier::Unordered => "unordered",
        })
    }
}

/// Shared inputs every archetype draws from.
#[derive(Clone, Copy, Debug)]
pub struct PromptInputs<'a> {
    pub query_id: &'a str,
    pub original_sql: &'a str,
    pub explain_text: &'a str,
    pub ir_node_map: &'a str,
    pub dialect: Dialect,
    pub engine_version: Option<&'a str>,
    pub schema_context: &'a str,
    /// Per-dialect playbook text injected verbatim.
    pub engine_knowledge: &'a str,
    pub importance_stars: u8,
    pub equivalence_tier: EquivalenceTier,
    pub do_not_do: &'a [String],
    pub transforms: &'a [GatedTransform],
    pub gold_examples: &'a [&'a GoldExample],
}

#[derive(Debug, Error, Diagnostic)]
pub enum PromptError {
    #[error("analyst response contains no JSON")]
    #[diagnostic(code(sqlbeam::prompts::no_json))]
    NoJson,

    #[error("analyst response JSON is malformed: {message}")]
    #[diagnostic(code(sqlbeam::prompts::bad_json))]
    BadJson { message: String },

    #[error("analyst proposed no probes")]
    #[diagnostic(
        code(sqlbeam::prompts::empty_reply),
        help("an empty analyst reply is a hard failure for the session")
    )]
    EmptyReply,
}

pub(crate) fn dialect_contract_section(
    out: &mut String,
    dialect: Dialect,
    engine_version: Option<&str>,
) {
    let _ = writeln!(out, "## Runtime Dialect Contract");
    let _ = writeln!(out, "target_dialect: {dialect}");
    if let Some(version) = engine_version {
        let _ = writeln!(out, "engine_version: {version}");
    }
    let _ = writeln!(
        out,
        "All emitted SQL must be executable on this engine as-is.\n"
    );
}

pub(crate) fn transform_catalog_section(out: &mut String, transforms: &[GatedTransform]) {
    let _ = writeln!(out, "## Transform Catalog (full list; not pre-filtered)");
    let _ = writeln!(
        out,
        "selection_policy: prioritize native/universal transforms first."
    );
    let _ = writeln!(
        out,
        "Transforms marked portability_candidate need syntax this engine lacks; \
         support `portability_candidate` probes only with a portable rendition.\n"
    );
    for gated in transforms {
        let t = gated.transform;
        let marker = if gated.portability_candidate {
            " (portability_candidate)"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "- `{}` [family {} — {}] score {:.2}{}: {}",
            t.id,
            t.family,
            t.family.label(),
            gated.score,
            marker,
            t.name
        );
    }
    out.push('\n');
}

pub(crate) fn gold_examples_section(out: &mut String, examples: &[&GoldExample]) {
    if examples.is_empty() {
        return;
    }
    let _ = writeln!(out, "## Gold Examples");
    for example in examples {
        let _ = writeln!(
            out,
            "### {} ({}, verified {}x)",
            example.id,
            example.dialect,
            example
                .verified_speedup
                .map_or_else(|| "?".to_string(), |s| format!("{s:.2}"))
        );
        if !example.description.is_empty() {
            let _ = writeln!(out, "{}", example.description);
        }
        let _ = writeln!(out, "original:\n```sql\n{}\n```", example.original_sql.trim());
        let _ = writeln!(
            out,
            "optimized:\n```sql\n{}\n```\n",
            example.optimized_sql.trim()
        );
    }
}

pub(crate) fn shared_context_sections(out: &mut String, inputs: &PromptInputs<'_>) {
    let _ = writeln!(out, "## Query Importance");
    let _ = writeln!(out, "importance_stars: {}\n", inputs.importance_stars);

    let _ = writeln!(out, "## Equivalence Tier");
    let _ = writeln!(out, "equivalence_tier: {}", inputs.equivalence_tier);
    let _ = writeln!(
        out,
        "Result multisets must match the original exactly{}.\n",
        match inputs.equivalence_tier {
            EquivalenceTier::Ordered => ", including row order",
            EquivalenceTier::Unordered => "; row order is free",
        }
    );

    if !inputs.schema_context.is_empty() {
        let _ = writeln!(out, "## Schema / Index / Stats Context");
        let _ = writeln!(out, "{}\n", inputs.schema_context.trim_end());
    }
    if !inputs.engine_knowledge.is_empty() {
        let _ = writeln!(out, "## Engine-Specific Knowledge");
        let _ = writeln!(out, "{}\n", inputs.engine_knowledge.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalence_tier_round_trips() {
        let json = serde_json::to_string(&EquivalenceTier::Unordered).unwrap();
        assert_eq!(json, "\"unordered\"");
        let parsed: EquivalenceTier = serde_json::from_str("\"ordered\"").unwrap();
        assert_eq!(parsed, EquivalenceTier::Ordered);
    }
}
