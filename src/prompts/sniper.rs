//! Sniper archetype: synthesize a compound rewrite from strike results.
//!
//! After validation and benchmarking, the sniper sees every probe's
//! outcome (speedup, EXPLAIN, full SQL) and is asked for one or two
//! compound plans combining the non-overlapping improvements.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, CandidateStatus};
use crate::patch::MAX_PLAN_STEPS;

use super::{dialect_contract_section, shared_context_sections, PromptInputs, ScoutResult};

/// One row of the strike-results table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrikeRow {
    pub probe_id: String,
    pub transform_id: String,
    pub family: String,
    pub status: CandidateStatus,
    pub speedup: Option<f64>,
    pub error: Option<String>,
    pub explain_text: Option<String>,
    pub sql: Option<String>,
    pub description: String,
}

impl StrikeRow {
    pub fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            probe_id: candidate.patch_id.clone(),
            transform_id: candidate.transform.clone(),
            family: candidate.family.to_string(),
            status: candidate.status,
            speedup: candidate.speedup,
            error: candidate.apply_error.clone(),
            explain_text: candidate.explain_text.clone(),
            sql: candidate.output_sql.clone(),
            description: String::new(),
        }
    }
}

/// Build the sniper prompt over all strike results.
pub fn build_sniper_prompt(
    inputs: &PromptInputs<'_>,
    scout: &ScoutResult,
    strikes: &[StrikeRow],
) -> String {
    let mut out = String::with_capacity(8192);

    let _ = writeln!(
        out,
        "You are the sniper. The probes below have been validated and timed. \
         Synthesize one or two compound rewrites that combine the \
         non-overlapping improvements of the best results.\n"
    );

    dialect_contract_section(&mut out, inputs.dialect, inputs.engine_version);
    shared_context_sections(&mut out, inputs);

    let _ = writeln!(out, "## Analyst Hypothesis");
    let _ = writeln!(out, "{}\n", scout.hypothesis);
    if !scout.reasoning_trace.is_empty() {
        let _ = writeln!(out, "## Analyst Reasoning Trace");
        for line in &scout.reasoning_trace {
            let _ = writeln!(out, "- {line}");
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Query ({})", inputs.query_id);
    let _ = writeln!(out, "```sql\n{}\n```\n", inputs.original_sql.trim());
    let _ = writeln!(out, "## Execution Plan (original)");
    let _ = writeln!(out, "```\n{}\n```\n", inputs.explain_text.trim());

    let _ = writeln!(out, "## BDA Table (all probes)");
    let _ = writeln!(out, "| probe | transform | family | status | speedup | error |");
    let _ = writeln!(out, "|---|---|---|---|---|---|");
    for row in strikes {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {:?} | {} | {} |",
            row.probe_id,
            row.transform_id,
            row.family,
            row.status,
            row.speedup
                .map_or_else(|| "-".to_string(), |s| format!("{s:.2}x")),
            row.error.as_deref().unwrap_or("")
        );
    }
    out.push('\n');

    let _ = writeln!(out, "## Worker SQL Patches");
    for row in strikes {
        let Some(sql) = &row.sql else { continue };
        let _ = writeln!(out, "### {} ({})", row.probe_id, row.transform_id);
        if !row.description.is_empty() {
            let _ = writeln!(out, "{}", row.description);
        }
        if let Some(explain) = &row.explain_text {
            let _ = writeln!(out, "plan after:\n```\n{}\n```", explain.trim());
        }
        let _ = writeln!(out, "```sql\n{}\n```\n", sql.trim());
    }

    let _ = writeln!(out, "## Output Contract");
    let _ = writeln!(
        out,
        "Return ONE JSON object {{\"plan_id\", \"dialect\", \"steps\": [...]}} or \
         an array of at most 2 such plans, each with at most {MAX_PLAN_STEPS} \
         steps. Combine only improvements that touch disjoint parts of the \
         query. Full executable SQL in every payload; a no-change plan is \
         acceptable when combining would be unsafe."
    );

    out
}

#[cfg(test)]
mod tests {
    use crate::dialect::Dialect;
    use crate::prompts::EquivalenceTier;

    use super::*;

    #[test]
    fn sniper_prompt_contains_table_and_full_sql() {
        let sql_patch = "SELECT 1 AS a\nUNION ALL\nSELECT 2 AS a";
        let inputs = PromptInputs {
            query_id: "query_001",
            original_sql: "SELECT a FROM t",
            explain_text: "SEQ_SCAN t [200ms]",
            ir_node_map: "S0 [aa] select 1 cols from t",
            dialect: Dialect::Postgres,
            engine_version: None,
            schema_context: "| t | 1000 | id | idx_t_id |",
            engine_knowledge: "## Dialect Profile (POSTGRES)\n- sample",
            importance_stars: 2,
            equivalence_tier: EquivalenceTier::Unordered,
            do_not_do: &[],
            transforms: &[],
            gold_examples: &[],
        };
        let scout = ScoutResult {
            hypothesis: "Nested loop dominates due to late filtering".into(),
            reasoning_trace: vec!["Primary hotspot on NL anti join".into()],
            ..ScoutResult::default()
        };
        let strikes = vec![StrikeRow {
            probe_id: "p01".into(),
            transform_id: "early_filter".into(),
            family: "A".into(),
            status: CandidateStatus::Win,
            speedup: Some(1.4),
            error: None,
            explain_text: Some("HASH_JOIN [120ms]\nSEQ_SCAN x [90ms]".into()),
            sql: Some(sql_patch.to_string()),
            description: "Push selective filter into source CTE".into(),
        }];

        let prompt = build_sniper_prompt(&inputs, &scout, &strikes);
        for needle in [
            "## BDA Table (all probes)",
            "## Runtime Dialect Contract",
            "## Engine-Specific Knowledge",
            "## Worker SQL Patches",
            sql_patch,
            "## Schema / Index / Stats Context",
            "## Analyst Hypothesis",
            "## Analyst Reasoning Trace",
            "## Equivalence Tier",
        ] {
            assert!(prompt.contains(needle), "missing {needle:?}");
        }
    }
}
