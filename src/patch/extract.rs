//! Response extraction: pull patch plans or whole-SQL rewrites out of raw
//! LLM output.
//!
//! Accepted shapes, in priority order:
//! 1. a fenced ```json block (or anonymous fence) containing JSON,
//! 2. a bare JSON object/array embedded in prose,
//! 3. a fenced ```sql block (whole-SQL mode only).
//!
//! The plan parser is strict on required keys and permissive on unknown
//! ones: unknown fields are kept aside and logged as warnings.

use tracing::warn;

use super::{PatchPlan, PlanParseError};

/// Step-count cap per plan.
pub const MAX_PLAN_STEPS: usize = 32;

/// A worker may return at most this many trees in one reply.
pub const MAX_TREES_PER_REPLY: usize = 4;

/// Shape of the JSON a worker returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseFormat {
    /// `{plan_id, steps: [...]}` — a patch plan.
    PatchPlan,
    /// A JSON array of 1–4 plans.
    TreeList,
    /// `{optimized_sql: "..."}` or a fenced ```sql block.
    WholeSql,
    Unknown,
}

/// Parsed worker reply: one or more plans, or a whole-SQL rewrite.
#[derive(Clone, Debug)]
pub struct WorkerReply {
    pub plans: Vec<PatchPlan>,
    pub whole_sql: Option<String>,
}

/// Find the JSON payload in a response.
pub fn extract_json(response: &str) -> Option<String> {
    if let Some(block) = fenced_block(response, Some("json")) {
        return Some(block);
    }
    if let Some(block) = fenced_block(response, None) {
        if block.trim_start().starts_with(['{', '[']) {
            return Some(block);
        }
    }
    balanced_json(response)
}

/// Find a fenced ```sql block (whole-SQL mode).
pub fn extract_fenced_sql(response: &str) -> Option<String> {
    fenced_block(response, Some("sql"))
}

/// Classify the extracted JSON.
pub fn detect_format(json: &str) -> ResponseFormat {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
        return ResponseFormat::Unknown;
    };
    match &value {
        serde_json::Value::Array(_) => ResponseFormat::TreeList,
        serde_json::Value::Object(map) => {
            if map.contains_key("steps") {
                ResponseFormat::PatchPlan
            } else if map.contains_key("optimized_sql") {
                ResponseFormat::WholeSql
            } else {
                ResponseFormat::Unknown
            }
        }
        _ => ResponseFormat::Unknown,
    }
}

/// Parse one patch plan from a JSON object, enforcing required keys, the
/// step cap, and the no-ellipsis payload rule.
pub fn parse_patch_plan(json: &str) -> Result<PatchPlan, PlanParseError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| PlanParseError::BadJson {
            message: e.to_string(),
        })?;
    plan_from_value(value)
}

fn plan_from_value(value: serde_json::Value) -> Result<PatchPlan, PlanParseError> {
    let object = value.as_object().ok_or(PlanParseError::MissingKey {
        key: "plan_id",
    })?;
    if !object.contains_key("plan_id") {
        return Err(PlanParseError::MissingKey { key: "plan_id" });
    }
    if !object.contains_key("steps") {
        return Err(PlanParseError::MissingKey { key: "steps" });
    }

    let plan: PatchPlan =
        serde_json::from_value(value).map_err(|e| PlanParseError::BadJson {
            message: e.to_string(),
        })?;

    if plan.steps.len() > MAX_PLAN_STEPS {
        return Err(PlanParseError::TooManySteps {
            count: plan.steps.len(),
            cap: MAX_PLAN_STEPS,
        });
    }

    for step in &plan.steps {
        for (field, sql) in step.payload.sql_fields() {
            if sql.contains("...") || sql.contains('\u{2026}') {
                return Err(PlanParseError::ElidedPayload {
                    step_id: step.step_id.clone(),
                    field,
                });
            }
        }
        if !step.extra.is_empty() {
            let keys: Vec<&str> = step.extra.keys().map(String::as_str).collect();
            warn!(plan_id = %plan.plan_id, step_id = %step.step_id, ?keys, "ignoring unknown step fields");
        }
    }
    if !plan.extra.is_empty() {
        let keys: Vec<&str> = plan.extra.keys().map(String::as_str).collect();
        warn!(plan_id = %plan.plan_id, ?keys, "ignoring unknown plan fields");
    }

    Ok(plan)
}

/// Parse a full worker response into plans and/or a whole-SQL rewrite.
pub fn parse_worker_response(response: &str) -> Result<WorkerReply, PlanParseError> {
    if let Some(json) = extract_json(response) {
        let value: serde_json::Value =
            serde_json::from_str(&json).map_err(|e| PlanParseError::BadJson {
                message: e.to_string(),
            })?;

        match value {
            serde_json::Value::Array(items) => {
                if items.len() > MAX_TREES_PER_REPLY {
                    return Err(PlanParseError::TooManyTrees {
                        count: items.len(),
                        cap: MAX_TREES_PER_REPLY,
                    });
                }
                let mut plans = Vec::with_capacity(items.len());
                for item in items {
                    plans.push(plan_from_value(item)?);
                }
                return Ok(WorkerReply {
                    plans,
                    whole_sql: None,
                });
            }
            serde_json::Value::Object(ref map) => {
                if let Some(sql) = map.get("optimized_sql").and_then(|v| v.as_str()) {
                    return Ok(WorkerReply {
                        plans: Vec::new(),
                        whole_sql: Some(sql.to_string()),
                    });
                }
                return Ok(WorkerReply {
                    plans: vec![plan_from_value(value)?],
                    whole_sql: None,
                });
            }
            _ => return Err(PlanParseError::MissingKey { key: "steps" }),
        }
    }

    if let Some(sql) = extract_fenced_sql(response) {
        return Ok(WorkerReply {
            plans: Vec::new(),
            whole_sql: Some(sql),
        });
    }

    Err(PlanParseError::NoJson)
}

fn fenced_block(text: &str, label: Option<&str>) -> Option<String> {
    let mut search_from = 0;
    while let Some(open_rel) = text[search_from..].find("```") {
        let open = search_from + open_rel;
        let after_ticks = open + 3;
        let line_end = text[after_ticks..]
            .find('\n')
            .map(|i| after_ticks + i)?;
        let tag = text[after_ticks..line_end].trim();

        let body_start = line_end + 1;
        let close = text[body_start..].find("```").map(|i| body_start + i)?;
        let body = &text[body_start..close];

        let matches = match label {
            Some(want) => tag.eq_ignore_ascii_case(want),
            None => tag.is_empty(),
        };
        if matches {
            return Some(body.trim().to_string());
        }
        search_from = close + 3;
    }
    None
}

/// First balanced `{...}` or `[...]` region that parses as JSON.
fn balanced_json(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' && b != b'[' {
            continue;
        }
        let (open, close) = if b == b'{' { (b'{', b'}') } else { (b'[', b']') };
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &c) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                b'"' => in_string = true,
                _ if c == open => depth += 1,
                _ if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=start + offset];
                        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                            return Some(candidate.to_string());
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN_JSON: &str = r#"{
        "plan_id": "p01",
        "dialect": "duckdb",
        "steps": [
            {
                "step_id": "s1",
                "op": "replace_where_predicate",
                "target": {"by_node_id": "S0"},
                "payload": {"expr_sql": "d_year = 2000"},
                "description": "tighten filter"
            }
        ]
    }"#;

    #[test]
    fn extracts_json_from_fenced_block() {
        let response = format!("Here is the plan:\n```json\n{PLAN_JSON}\n```\nDone.");
        let json = extract_json(&response).unwrap();
        assert_eq!(detect_format(&json), ResponseFormat::PatchPlan);
    }

    #[test]
    fn extracts_bare_json_from_prose() {
        let response = format!("Thinking aloud... {PLAN_JSON} hope that helps");
        let json = extract_json(&response).unwrap();
        let plan = parse_patch_plan(&json).unwrap();
        assert_eq!(plan.plan_id, "p01");
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn extracts_fenced_sql_for_whole_sql_mode() {
        let response = "```sql\nSELECT 1 AS x\n```";
        let reply = parse_worker_response(response).unwrap();
        assert_eq!(reply.whole_sql.as_deref(), Some("SELECT 1 AS x"));
        assert!(reply.plans.is_empty());
    }

    #[test]
    fn optimized_sql_object_is_whole_sql() {
        let reply = parse_worker_response(r#"{"optimized_sql": "SELECT 2"}"#).unwrap();
        assert_eq!(reply.whole_sql.as_deref(), Some("SELECT 2"));
    }

    #[test]
    fn missing_plan_id_is_rejected() {
        let err = parse_patch_plan(r#"{"steps": []}"#).unwrap_err();
        assert!(matches!(err, PlanParseError::MissingKey { key: "plan_id" }));
    }

    #[test]
    fn elided_payload_is_rejected() {
        let json = r#"{
            "plan_id": "p", "steps": [{
                "op": "replace_body",
                "target": {"by_node_id": "S0"},
                "payload": {"sql_fragment": "SELECT a, ... FROM t"}
            }]
        }"#;
        let err = parse_patch_plan(json).unwrap_err();
        assert!(matches!(err, PlanParseError::ElidedPayload { .. }));
    }

    #[test]
    fn step_cap_is_enforced() {
        let steps: Vec<String> = (0..MAX_PLAN_STEPS + 1)
            .map(|i| {
                format!(
                    r#"{{"step_id":"s{i}","op":"delete_expr_subtree","target":{{"by_node_id":"S0","by_anchor_hash":"0000000000000000"}}}}"#
                )
            })
            .collect();
        let json = format!(r#"{{"plan_id":"big","steps":[{}]}}"#, steps.join(","));
        let err = parse_patch_plan(&json).unwrap_err();
        assert!(matches!(err, PlanParseError::TooManySteps { .. }));
    }

    #[test]
    fn array_of_plans_parses_as_tree_list() {
        let json = format!("[{PLAN_JSON}]");
        let reply = parse_worker_response(&json).unwrap();
        assert_eq!(reply.plans.len(), 1);
    }

    #[test]
    fn prose_without_payload_is_no_json() {
        assert!(matches!(
            parse_worker_response("I could not produce a rewrite."),
            Err(PlanParseError::NoJson)
        ));
    }
}
