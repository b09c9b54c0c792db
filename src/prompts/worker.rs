//! Worker archetype: execute one probe.
//!
//! The worker receives the analyst's hypothesis and reasoning trace, one
//! probe, the IR node map, and one or two gold examples, and must answer
//! with a patch plan (or a whole-SQL tree). The retry variant appends the
//! gate-failure feedback block.

use std::fmt::Write as _;

use crate::patch::MAX_PLAN_STEPS;

use super::{
    dialect_contract_section, gold_examples_section, shared_context_sections, ProbeSpec,
    PromptInputs, ScoutResult,
};

/// Build the worker prompt for one probe.
///
/// `patch_mode` selects the patch-plan output contract; whole-SQL mode is
/// the fallback contract for models that cannot speak plans.
pub fn build_worker_prompt(
    inputs: &PromptInputs<'_>,
    scout: &ScoutResult,
    probe: &ProbeSpec,
    patch_mode: bool,
) -> String {
    let mut out = String::with_capacity(4096);

    let _ = writeln!(
        out,
        "You are a rewrite worker. Apply exactly one optimization idea to the \
         query below and return it in the required format.\n"
    );

    dialect_contract_section(&mut out, inputs.dialect, inputs.engine_version);
    shared_context_sections(&mut out, inputs);

    let _ = writeln!(out, "## Analyst Hypothesis");
    let _ = writeln!(out, "{}\n", scout.hypothesis);
    if !scout.reasoning_trace.is_empty() {
        let _ = writeln!(out, "### Analyst Reasoning Trace");
        for line in &scout.reasoning_trace {
            let _ = writeln!(out, "- {line}");
        }
        out.push('\n');
    }
    if !scout.do_not_do.is_empty() {
        let _ = writeln!(out, "### Analyst Do-Not-Do");
        for line in &scout.do_not_do {
            let _ = writeln!(out, "- {line}");
        }
        out.push('\n');
    }

    let _ = writeln!(out, "### Transform Recipe");
    let _ = writeln!(out, "`transform_id`: `{}`", probe.transform_id);
    let _ = writeln!(out, "family: {}", probe.family);
    let _ = writeln!(out, "target: {}", probe.target);
    let _ = writeln!(out, "confidence: {:.2}", probe.confidence);
    if let Some(delta) = &probe.expected_explain_delta {
        let _ = writeln!(out, "expected_explain_delta: {delta}");
    }
    if !probe.recommended_patch_ops.is_empty() {
        let _ = writeln!(
            out,
            "recommended_patch_ops: [{}]",
            probe.recommended_patch_ops.join(", ")
        );
    }
    out.push('\n');

    let _ = writeln!(out, "## Query ({})", inputs.query_id);
    let _ = writeln!(out, "```sql\n{}\n```\n", inputs.original_sql.trim());
    let _ = writeln!(out, "## IR Node Map");
    let _ = writeln!(out, "```\n{}\n```\n", inputs.ir_node_map.trim_end());

    gold_examples_section(&mut out, inputs.gold_examples);

    let _ = writeln!(out, "## Hazard Flags");
    let _ = writeln!(
        out,
        "- Do not change output column names, order, or count.\n\
         - Preserve NULL semantics exactly (NOT IN vs NOT EXISTS differ on NULLs).\n\
         - Every changed node must carry its full executable SQL; never elide with `...`.\n"
    );

    if patch_mode {
        let _ = writeln!(out, "## Output Contract (patch mode)");
        let _ = writeln!(
            out,
            "Return ONE JSON object {{\"plan_id\", \"dialect\", \"steps\": [...]}} \
             (or an array of 1-4 such plans, or a plan wrapped as {{\"steps\": [...]}}). \
             Each step: {{\"step_id\", \"op\", \"target\", \"payload\", \"description\"}} \
             with op one of insert_cte | replace_from | replace_where_predicate | \
             replace_body | replace_expr_subtree | delete_expr_subtree | \
             replace_block_with_cte_pair. At most {MAX_PLAN_STEPS} steps. Targets use \
             by_node_id / by_anchor_hash / by_label from the IR node map."
        );
    } else {
        let _ = writeln!(out, "## Output Contract (whole-SQL mode)");
        let _ = writeln!(
            out,
            "Return {{\"optimized_sql\": \"...\"}} or a single fenced ```sql block \
             containing the complete rewritten query."
        );
    }
    let _ = writeln!(
        out,
        "A no-change plan ({{\"plan_id\": \"noop\", \"steps\": []}}) is always \
         an acceptable response."
    );

    out
}

/// Retry variant: the original worker prompt plus the gate-failure
/// feedback block.
pub fn build_worker_retry_prompt(
    base_prompt: &str,
    error_text: &str,
    failed_sql: Option<&str>,
    previous_response: &str,
) -> String {
    let mut out = String::with_capacity(base_prompt.len() + 2048);
    out.push_str(base_prompt);

    let _ = writeln!(out, "\n## Gate Failure Feedback");
    let _ = writeln!(
        out,
        "Your previous attempt failed validation. Fix the error and answer \
         again in the same format.\n"
    );
    let _ = writeln!(out, "### Error");
    let _ = writeln!(out, "```\n{}\n```\n", error_text.trim());
    if let Some(sql) = failed_sql {
        let _ = writeln!(out, "### Rejected SQL");
        let _ = writeln!(out, "```sql\n{}\n```\n", sql.trim());
    }
    let _ = writeln!(out, "### Previous Response");
    let _ = writeln!(out, "```\n{}\n```", previous_response.trim());

    out
}

#[cfg(test)]
mod tests {
    use crate::dialect::Dialect;
    use crate::prompts::EquivalenceTier;
    use crate::transforms::Family;

    use super::*;

    fn inputs<'a>() -> PromptInputs<'a> {
        PromptInputs {
            query_id: "query_007",
            original_sql: "SELECT * FROM t WHERE x IN (SELECT y FROM u)",
            explain_text: "NESTED_LOOP [900ms]",
            ir_node_map: "S0 [aa] select 1 cols from t, u",
            dialect: Dialect::Postgres,
            engine_version: Some("14.3"),
            schema_context: "",
            engine_knowledge: "## Dialect Profile (POSTGRES)\n- sample",
            importance_stars: 2,
            equivalence_tier: EquivalenceTier::Unordered,
            do_not_do: &[],
            transforms: &[],
            gold_examples: &[],
        }
    }

    fn probe() -> ProbeSpec {
        ProbeSpec {
            probe_id: "p01".into(),
            transform_id: "decorrelate_scalar_subquery".into(),
            family: Family::B,
            target: "Rewrite correlated aggregate into CTE+JOIN".into(),
            confidence: 0.9,
            expected_explain_delta: Some("Nested loop removed".into()),
            recommended_patch_ops: vec!["insert_cte".into(), "replace_from".into()],
        }
    }

    #[test]
    fn worker_prompt_contains_recipe_and_contract() {
        let scout = ScoutResult {
            hypothesis: "Nested loop decorrelation".into(),
            reasoning_trace: vec!["Primary hotspot: nested loop".into()],
            do_not_do: vec!["avoid_or_to_union".into()],
            ..ScoutResult::default()
        };
        let prompt = build_worker_prompt(&inputs(), &scout, &probe(), true);
        for needle in [
            "### Transform Recipe",
            "## Runtime Dialect Contract",
            "`transform_id`: `decorrelate_scalar_subquery`",
            "recommended_patch_ops",
            "expected_explain_delta: Nested loop removed",
            "equivalence_tier: unordered",
            "### Analyst Reasoning Trace",
            "### Analyst Do-Not-Do",
            "avoid_or_to_union",
            "## Output Contract (patch mode)",
        ] {
            assert!(prompt.contains(needle), "missing {needle:?}");
        }
    }

    #[test]
    fn whole_sql_mode_swaps_the_contract() {
        let prompt = build_worker_prompt(&inputs(), &ScoutResult::default(), &probe(), false);
        assert!(prompt.contains("## Output Contract (whole-SQL mode)"));
        assert!(!prompt.contains("patch mode"));
    }

    #[test]
    fn retry_prompt_embeds_error_and_previous_response() {
        let base = build_worker_prompt(&inputs(), &ScoutResult::default(), &probe(), true);
        let retry = build_worker_retry_prompt(
            &base,
            "Tier-1: statement S0 references unknown alias \"x\"",
            Some("SELECT x.a FROM t"),
            r#"{"plan_id":"p01","steps":[]}"#,
        );
        assert!(retry.starts_with(&base));
        assert!(retry.contains("## Gate Failure Feedback"));
        assert!(retry.contains("unknown alias"));
        assert!(retry.contains("### Rejected SQL"));
        assert!(retry.contains("### Previous Response"));
    }
}
