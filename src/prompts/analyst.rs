//! Analyst archetype: plan the attack.
//!
//! Wide mode asks for a dispatch block plus many shallow probes; focused
//! mode asks for one to four deep targets. The parser is the other half
//! of the template: it enforces the schema the wording promises.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::patch::extract_json;
use crate::transforms::Family;

use super::{
    dialect_contract_section, gold_examples_section, shared_context_sections,
    transform_catalog_section, EquivalenceTier, PromptError, PromptInputs,
};

/// Probe cap for wide mode.
pub const WIDE_MAX_PROBES: usize = 8;
/// Target cap for focused mode.
pub const FOCUSED_MAX_TARGETS: usize = 4;

/// Which analyst archetype to build/parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalystMode {
    Wide,
    Focused,
}

/// One shallow probe from a wide dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub probe_id: String,
    pub transform_id: String,
    #[serde(default = "default_family")]
    pub family: Family,
    /// What to rewrite, in the analyst's words.
    pub target: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_explain_delta: Option<String>,
    #[serde(default)]
    pub recommended_patch_ops: Vec<String>,
}

fn default_family() -> Family {
    Family::A
}

fn default_confidence() -> f64 {
    0.5
}

/// Parsed wide-mode dispatch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScoutResult {
    #[serde(default)]
    pub hypothesis: String,
    #[serde(default)]
    pub equivalence_tier: EquivalenceTier,
    #[serde(default)]
    pub reasoning_trace: Vec<String>,
    #[serde(default)]
    pub do_not_do: Vec<String>,
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
}

/// One deep target from a focused dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FocusedTarget {
    pub target_id: String,
    pub transform_id: String,
    #[serde(default = "default_family")]
    pub family: Family,
    #[serde(default)]
    pub hypothesis: String,
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

/// Either analyst output shape.
#[derive(Clone, Debug)]
pub enum AnalystReply {
    Wide(ScoutResult),
    Focused(Vec<FocusedTarget>),
}

impl AnalystReply {
    pub fn probe_count(&self) -> usize {
        match self {
            AnalystReply::Wide(scout) => scout.probes.len(),
            AnalystReply::Focused(targets) => targets.len(),
        }
    }
}

/// Build the analyst prompt for the given mode.
pub fn build_analyst_prompt(inputs: &PromptInputs<'_>, mode: AnalystMode) -> String {
    let mut out = String::with_capacity(4096);

    let _ = writeln!(
        out,
        "You are the analyst for a SQL rewrite session. Study the query, its \
         execution plan, and the IR outline, then design the attack.\n"
    );

    let _ = writeln!(out, "## Cache Boundary");
    let _ = writeln!(
        out,
        "Everything above this line is stable session context; everything \
         below is query-specific.\n"
    );

    dialect_contract_section(&mut out, inputs.dialect, inputs.engine_version);
    shared_context_sections(&mut out, inputs);
    transform_catalog_section(&mut out, inputs.transforms);
    gold_examples_section(&mut out, inputs.gold_examples);

    let _ = writeln!(out, "## Query ({})", inputs.query_id);
    let _ = writeln!(out, "```sql\n{}\n```\n", inputs.original_sql.trim());
    let _ = writeln!(out, "## Execution Plan");
    let _ = writeln!(out, "```\n{}\n```\n", inputs.explain_text.trim());
    let _ = writeln!(out, "## IR Node Map");
    let _ = writeln!(out, "```\n{}\n```\n", inputs.ir_node_map.trim_end());

    if !inputs.do_not_do.is_empty() {
        let _ = writeln!(out, "## Do Not Do");
        for item in inputs.do_not_do {
            let _ = writeln!(out, "- {item}");
        }
        out.push('\n');
    }

    match mode {
        AnalystMode::Wide => {
            let _ = writeln!(out, "## Output Schema (wide)");
            let _ = writeln!(
                out,
                "Reply with ONE JSON object: {{\"dispatch\": {{\"hypothesis\", \
                 \"probe_count\", \"equivalence_tier\", \"reasoning_trace\", \
                 \"do_not_do\"}}, \"probes\": [{{\"probe_id\", \"transform_id\", \
                 \"family\", \"target\", \"confidence\", \"expected_explain_delta\", \
                 \"recommended_patch_ops\"}}]}}."
            );
            let _ = writeln!(
                out,
                "Between 1 and {WIDE_MAX_PROBES} probes. Diversify: no two probes \
                 may share a transform_id unless they target different statements."
            );
        }
        AnalystMode::Focused => {
            let _ = writeln!(out, "## Output Schema (focused)");
            let _ = writeln!(
                out,
                "Reply with a JSON array of 1 to {FOCUSED_MAX_TARGETS} targets: \
                 [{{\"target_id\", \"transform_id\", \"family\", \"hypothesis\", \
                 \"target\", \"confidence\"}}]. Go deep, not wide."
            );
        }
    }
    let _ = writeln!(
        out,
        "Valid JSON only. A single no-change probe is an acceptable answer when \
         nothing profitable exists."
    );

    out
}

/// Parse the analyst response for the given mode.
///
/// Wide mode honors `dispatch.probe_count` as a truncation limit; both
/// modes enforce their caps and reject an empty probe/target list.
pub fn parse_analyst_response(
    response: &str,
    mode: AnalystMode,
) -> Result<AnalystReply, PromptError> {
    let json = extract_json(response).ok_or(PromptError::NoJson)?;
    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| PromptError::BadJson {
            message: e.to_string(),
        })?;

    match mode {
        AnalystMode::Wide => {
            let object = value.as_object().ok_or_else(|| PromptError::BadJson {
                message: "expected an object with dispatch + probes".into(),
            })?;

            let mut scout: ScoutResult = match object.get("dispatch") {
                Some(dispatch) => {
                    serde_json::from_value(dispatch.clone()).map_err(|e| PromptError::BadJson {
                        message: e.to_string(),
                    })?
                }
                None => serde_json::from_value(value.clone()).map_err(|e| {
                    PromptError::BadJson {
                        message: e.to_string(),
                    }
                })?,
            };

            let probes: Vec<ProbeSpec> = match object.get("probes") {
                Some(probes) => {
                    serde_json::from_value(probes.clone()).map_err(|e| PromptError::BadJson {
                        message: e.to_string(),
                    })?
                }
                None => scout.probes.clone(),
            };

            let declared = object
                .get("dispatch")
                .and_then(|d| d.get("probe_count"))
                .and_then(serde_json::Value::as_u64)
                .map(|n| n as usize);

            let cap = declared.unwrap_or(WIDE_MAX_PROBES).min(WIDE_MAX_PROBES);
            scout.probes = probes.into_iter().take(cap).collect();

            if scout.probes.is_empty() {
                return Err(PromptError::EmptyReply);
            }
            Ok(AnalystReply::Wide(scout))
        }
        AnalystMode::Focused => {
            let targets: Vec<FocusedTarget> =
                serde_json::from_value(value).map_err(|e| PromptError::BadJson {
                    message: e.to_string(),
                })?;
            if targets.is_empty() {
                return Err(PromptError::EmptyReply);
            }
            let capped = targets.into_iter().take(FOCUSED_MAX_TARGETS).collect();
            Ok(AnalystReply::Focused(capped))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDE_RESPONSE: &str = r#"{
      "dispatch": {
        "hypothesis": "Nested loop hotspot",
        "probe_count": 1,
        "equivalence_tier": "unordered",
        "reasoning_trace": ["Cost spine dominated by nested loop"],
        "do_not_do": ["avoid_or_to_union"]
      },
      "probes": [
        {
          "probe_id": "p01",
          "transform_id": "decorrelate_scalar_subquery",
          "family": "B",
          "target": "rewrite correlated subquery",
          "confidence": 0.9,
          "expected_explain_delta": "Nested loop removed",
          "recommended_patch_ops": ["insert_cte", "replace_from"]
        },
        {
          "probe_id": "p02",
          "transform_id": "early_filter",
          "family": "A",
          "target": "push filter",
          "confidence": 0.7
        }
      ]
    }"#;

    #[test]
    fn wide_parse_honors_probe_count() {
        let reply = parse_analyst_response(WIDE_RESPONSE, AnalystMode::Wide).unwrap();
        let AnalystReply::Wide(scout) = reply else {
            panic!("expected wide reply");
        };
        assert_eq!(scout.hypothesis, "Nested loop hotspot");
        assert_eq!(scout.probes.len(), 1);
        assert_eq!(scout.probes[0].probe_id, "p01");
        assert_eq!(
            scout.probes[0].expected_explain_delta.as_deref(),
            Some("Nested loop removed")
        );
        assert_eq!(scout.equivalence_tier, EquivalenceTier::Unordered);
        assert_eq!(scout.do_not_do, vec!["avoid_or_to_union"]);
    }

    #[test]
    fn focused_parse_accepts_array() {
        let response = r#"[
          {"target_id": "t1", "transform_id": "decorrelate_scalar_subquery",
           "family": "B", "hypothesis": "one deep rewrite", "target": "S0", "confidence": 0.8}
        ]"#;
        let reply = parse_analyst_response(response, AnalystMode::Focused).unwrap();
        let AnalystReply::Focused(targets) = reply else {
            panic!("expected focused reply");
        };
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].family, Family::B);
    }

    #[test]
    fn empty_probe_list_is_a_hard_failure() {
        let response = r#"{"dispatch": {"hypothesis": "nothing"}, "probes": []}"#;
        assert!(matches!(
            parse_analyst_response(response, AnalystMode::Wide),
            Err(PromptError::EmptyReply)
        ));
    }

    #[test]
    fn prose_only_response_is_no_json() {
        assert!(matches!(
            parse_analyst_response("I have no idea.", AnalystMode::Wide),
            Err(PromptError::NoJson)
        ));
    }

    #[test]
    fn prompt_contains_normative_sections() {
        use crate::dialect::Dialect;
        use rustc_hash::FxHashSet;

        let transforms = crate::transforms::applicable_transforms(
            &FxHashSet::from_iter([crate::transforms::QueryFeature::HasNotIn]),
            Dialect::Postgres,
            None,
        );
        let inputs = PromptInputs {
            query_id: "query_001",
            original_sql: "SELECT 1",
            explain_text: "SEQ_SCAN t [100ms]",
            ir_node_map: "S0 [abc] select 1 cols from t",
            dialect: Dialect::Postgres,
            engine_version: Some("14.3"),
            schema_context: "| t | 1000 | id | idx_t_id |",
            engine_knowledge: "## Dialect Profile (POSTGRES)\n- sample",
            importance_stars: 3,
            equivalence_tier: EquivalenceTier::Unordered,
            do_not_do: &[],
            transforms: &transforms,
            gold_examples: &[],
        };
        let prompt = build_analyst_prompt(&inputs, AnalystMode::Wide);
        for needle in [
            "## Cache Boundary",
            "## Runtime Dialect Contract",
            "target_dialect: postgres",
            "## Query Importance",
            "importance_stars: 3",
            "## Transform Catalog (full list; not pre-filtered)",
            "selection_policy: prioritize native/universal transforms first.",
            "portability_candidate",
            "## Schema / Index / Stats Context",
            "## Engine-Specific Knowledge",
        ] {
            assert!(prompt.contains(needle), "missing {needle:?}");
        }
    }
}
