//! Patch application: executes a [`PatchPlan`] against a cloned Script IR.
//!
//! Atomicity is per plan: if step `k` fails, the returned state reflects
//! the IR after step `k-1`, with `success = false` and every failure
//! captured. After the last step the rendered SQL must pass the structural
//! gate (parse, column invariant, identifier scope, CTE references).

use std::ops::ControlFlow;

use sqlparser::ast::{Expr, Query, Select, SetExpr, Statement, visit_expressions, visit_expressions_mut};
use sqlparser::parser::Parser;
use tracing::debug;

use crate::dialect::Dialect;
use crate::ir::{AnchorHash, IrStatement, ScriptIr, anchor_of, render_sql, render_statement};
use crate::validate::structural::{tier1_structural, StructuralIssueKind};

use super::{PatchError, PatchErrorKind, PatchOp, PatchPlan, PatchStep};

/// Outcome of applying one plan.
#[derive(Clone, Debug)]
pub struct PatchResult {
    pub success: bool,
    pub output_sql: Option<String>,
    pub output_ir: Option<ScriptIr>,
    pub steps_applied: usize,
    pub steps_total: usize,
    pub errors: Vec<PatchError>,
}

impl PatchResult {
    /// One-line failure summary, or `None` on success.
    pub fn error_summary(&self) -> Option<String> {
        if self.success {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Apply `plan` to a deep clone of `ir`.
pub fn apply_patch_plan(ir: &ScriptIr, plan: &PatchPlan) -> PatchResult {
    let dialect = plan.dialect.unwrap_or(ir.dialect);
    let steps_total = plan.steps.len();
    let mut work = ir.clone();

    for (index, step) in plan.steps.iter().enumerate() {
        let checkpoint = work.clone();
        if let Err(error) = apply_step(&mut work, dialect, step) {
            debug!(plan_id = %plan.plan_id, step = index, %error, "patch step failed");
            return PatchResult {
                success: false,
                output_sql: Some(render_sql(&checkpoint)),
                output_ir: Some(checkpoint),
                steps_applied: index,
                steps_total,
                errors: vec![error],
            };
        }
    }

    let rendered = render_sql(&work);
    let report = tier1_structural(ir, &rendered, dialect, plan.select_list_change);
    if !report.passed {
        let errors = report
            .issues
            .iter()
            .map(|issue| {
                let kind = match issue.kind {
                    StructuralIssueKind::ColumnMismatch => {
                        PatchErrorKind::ColumnInvariantViolated
                    }
                    _ => PatchErrorKind::PostconditionFailed,
                };
                PatchError::new(kind, "<plan>", issue.message.clone())
            })
            .collect();
        return PatchResult {
            success: false,
            output_sql: Some(rendered),
            output_ir: Some(work),
            steps_applied: steps_total,
            steps_total,
            errors,
        };
    }

    PatchResult {
        success: true,
        output_sql: Some(rendered),
        output_ir: Some(work),
        steps_applied: steps_total,
        steps_total,
        errors: Vec::new(),
    }
}

fn apply_step(work: &mut ScriptIr, dialect: Dialect, step: &PatchStep) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let node_id = step
        .target
        .by_node_id
        .as_deref()
        .ok_or_else(|| unresolved(step_id, "target.by_node_id is required"))?;
    let position = work
        .statements
        .iter()
        .position(|s| s.node_id.as_str() == node_id);
    let Some(position) = position else {
        let known: Vec<String> = work
            .statements
            .iter()
            .map(|s| s.node_id.as_str().to_string())
            .collect();
        return Err(unresolved(
            step_id,
            format!("no statement {node_id:?}; script has {known:?}"),
        ));
    };
    let statement = &mut work.statements[position];

    match step.op {
        PatchOp::InsertCte => insert_cte(statement, dialect, step),
        PatchOp::ReplaceFrom => replace_from(statement, dialect, step),
        PatchOp::ReplaceWherePredicate => replace_where(statement, dialect, step),
        PatchOp::ReplaceBody => replace_body(statement, dialect, step),
        PatchOp::ReplaceExprSubtree => replace_expr_subtree(statement, dialect, step),
        PatchOp::DeleteExprSubtree => delete_expr_subtree(statement, step),
        PatchOp::ReplaceBlockWithCtePair => replace_cte_body(statement, dialect, step),
    }?;

    // Structural ops can stitch together fragments that render into text
    // the target dialect rejects; catch that here, not at validation time.
    if matches!(
        step.op,
        PatchOp::InsertCte
            | PatchOp::ReplaceFrom
            | PatchOp::ReplaceWherePredicate
            | PatchOp::ReplaceBody
            | PatchOp::ReplaceBlockWithCtePair
    ) {
        if let Some(statement) = work.statement(node_id) {
            reparse_guard(statement, dialect, step_id)?;
        }
    }

    Ok(())
}

fn insert_cte(
    statement: &mut IrStatement,
    dialect: Dialect,
    step: &PatchStep,
) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let name = required(step_id, "cte_name", step.payload.cte_name.as_deref())?;
    let body = required(step_id, "cte_query_sql", step.payload.cte_query_sql.as_deref())?;

    if statement.cte_named(name).is_some() {
        return Err(PatchError::new(
            PatchErrorKind::CteNameCollision,
            step_id,
            format!("CTE {name:?} already exists"),
        ));
    }

    // Parse a donor statement and steal its fully formed With node; this
    // sidesteps hand-assembling parser token metadata.
    let donor_sql = format!("WITH {name} AS ({body}) SELECT 1");
    let donor = parse_query_fragment(&donor_sql, dialect, step_id, "cte_query_sql")?;
    let mut donor_with = donor.with.ok_or_else(|| {
        payload_error(step_id, "cte_query_sql", "donor query lost its WITH clause")
    })?;
    if donor_with.cte_tables.len() != 1 {
        return Err(payload_error(
            step_id,
            "cte_query_sql",
            "cte_query_sql must define exactly one CTE body",
        ));
    }

    match statement.query.with.as_mut() {
        Some(with) => with.cte_tables.push(donor_with.cte_tables.remove(0)),
        None => statement.query.with = Some(donor_with),
    }
    Ok(())
}

fn replace_from(
    statement: &mut IrStatement,
    dialect: Dialect,
    step: &PatchStep,
) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let from_sql = required(step_id, "from_sql", step.payload.from_sql.as_deref())?;

    let donor_sql = format!("SELECT * FROM {from_sql}");
    let donor = parse_query_fragment(&donor_sql, dialect, step_id, "from_sql")?;
    let donor_from = match *donor.body {
        SetExpr::Select(select) => select.from,
        _ => {
            return Err(payload_error(
                step_id,
                "from_sql",
                "fragment did not parse as a FROM clause",
            ));
        }
    };

    let select = select_body_mut(statement, step_id)?;
    select.from = donor_from;
    Ok(())
}

fn replace_where(
    statement: &mut IrStatement,
    dialect: Dialect,
    step: &PatchStep,
) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let expr_sql = required(step_id, "expr_sql", step.payload.expr_sql.as_deref())?;

    if let Some(anchor_text) = step.target.by_anchor_hash.as_deref() {
        let anchor = parse_anchor(step_id, anchor_text)?;
        let current = statement
            .select()
            .and_then(|s| s.selection.as_ref())
            .map(anchor_of);
        if current != Some(anchor) {
            return Err(unresolved(
                step_id,
                format!(
                    "WHERE pre-state does not match anchor {anchor} (found {})",
                    current.map_or("no predicate".to_string(), |a| a.to_string())
                ),
            ));
        }
    }

    let predicate = parse_expr_fragment(expr_sql, dialect, step_id)?;
    let select = select_body_mut(statement, step_id)?;
    select.selection = Some(predicate);
    Ok(())
}

fn replace_body(
    statement: &mut IrStatement,
    dialect: Dialect,
    step: &PatchStep,
) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let fragment = required(step_id, "sql_fragment", step.payload.sql_fragment.as_deref())?;

    let donor = parse_query_fragment(fragment, dialect, step_id, "sql_fragment")?;
    if donor.with.is_some() {
        return Err(payload_error(
            step_id,
            "sql_fragment",
            "body fragment must not declare its own CTEs; use insert_cte",
        ));
    }

    // CTEs are preserved; everything below them is replaced.
    statement.query.body = donor.body;
    statement.query.order_by = donor.order_by;
    statement.query.limit_clause = donor.limit_clause;
    statement.query.fetch = donor.fetch;
    Ok(())
}

fn replace_expr_subtree(
    statement: &mut IrStatement,
    dialect: Dialect,
    step: &PatchStep,
) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let anchor_text = step
        .target
        .by_anchor_hash
        .as_deref()
        .ok_or_else(|| unresolved(step_id, "target.by_anchor_hash is required"))?;
    let anchor = parse_anchor(step_id, anchor_text)?;
    let expr_sql = required(step_id, "expr_sql", step.payload.expr_sql.as_deref())?;

    require_unique_anchor(statement, anchor, step_id)?;

    let replacement = parse_expr_fragment(expr_sql, dialect, step_id)?;
    let mut replaced = false;
    let _ = visit_expressions_mut(statement.query.as_mut(), |expr: &mut Expr| {
        if !replaced && anchor_of(expr) == anchor {
            *expr = replacement.clone();
            replaced = true;
        }
        ControlFlow::<()>::Continue(())
    });

    debug_assert!(replaced, "unique anchor vanished between count and mutate");
    Ok(())
}

fn delete_expr_subtree(statement: &mut IrStatement, step: &PatchStep) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let anchor_text = step
        .target
        .by_anchor_hash
        .as_deref()
        .ok_or_else(|| unresolved(step_id, "target.by_anchor_hash is required"))?;
    let anchor = parse_anchor(step_id, anchor_text)?;

    require_unique_anchor(statement, anchor, step_id)?;

    let select = select_body_mut(statement, step_id)?;
    if remove_from_predicate(&mut select.selection, anchor)
        || remove_from_predicate(&mut select.having, anchor)
    {
        return Ok(());
    }

    Err(unresolved(
        step_id,
        format!("anchored subtree {anchor} is not a WHERE/HAVING predicate or AND/OR branch"),
    ))
}

/// Drop the whole predicate when it matches, otherwise fold the matched
/// branch out of an AND/OR tree.
fn remove_from_predicate(slot: &mut Option<Expr>, anchor: AnchorHash) -> bool {
    let Some(expr) = slot.as_mut() else {
        return false;
    };
    if anchor_of(&*expr) == anchor {
        *slot = None;
        return true;
    }
    fold_out(expr, anchor)
}

fn fold_out(expr: &mut Expr, anchor: AnchorHash) -> bool {
    use sqlparser::ast::BinaryOperator;

    match expr {
        Expr::BinaryOp { left, op, right }
            if matches!(op, BinaryOperator::And | BinaryOperator::Or) =>
        {
            if anchor_of(left.as_ref()) == anchor {
                *expr = (**right).clone();
                return true;
            }
            if anchor_of(right.as_ref()) == anchor {
                *expr = (**left).clone();
                return true;
            }
            fold_out(left, anchor) || fold_out(right, anchor)
        }
        Expr::Nested(inner) => fold_out(inner, anchor),
        _ => false,
    }
}

fn replace_cte_body(
    statement: &mut IrStatement,
    dialect: Dialect,
    step: &PatchStep,
) -> Result<(), PatchError> {
    let step_id = step.step_id.as_str();
    let label = step
        .target
        .by_label
        .as_deref()
        .ok_or_else(|| unresolved(step_id, "target.by_label is required"))?;
    let fragment = required(step_id, "sql_fragment", step.payload.sql_fragment.as_deref())?;

    let donor = parse_query_fragment(fragment, dialect, step_id, "sql_fragment")?;

    let Some(with) = statement.query.with.as_mut() else {
        return Err(unresolved(step_id, "statement has no CTEs"));
    };
    let cte = with
        .cte_tables
        .iter_mut()
        .find(|cte| cte.alias.name.value.eq_ignore_ascii_case(label))
        .ok_or_else(|| unresolved(step_id, format!("no CTE labelled {label:?}")))?;
    cte.query = donor;
    Ok(())
}

// ── shared helpers ──────────────────────────────────────────────────────

fn require_unique_anchor(
    statement: &IrStatement,
    anchor: AnchorHash,
    step_id: &str,
) -> Result<(), PatchError> {
    let mut matches = 0usize;
    let _ = visit_expressions(statement.query.as_ref(), |expr: &Expr| {
        if anchor_of(expr) == anchor {
            matches += 1;
        }
        ControlFlow::<()>::Continue(())
    });
    match matches {
        0 => Err(unresolved(
            step_id,
            format!("no subtree with anchor {anchor}"),
        )),
        1 => Ok(()),
        n => Err(PatchError::new(
            PatchErrorKind::AmbiguousAnchor,
            step_id,
            format!("anchor {anchor} matches {n} subtrees; disambiguate with a tighter target"),
        )),
    }
}

fn select_body_mut<'a>(
    statement: &'a mut IrStatement,
    step_id: &str,
) -> Result<&'a mut Select, PatchError> {
    match statement.query.body.as_mut() {
        SetExpr::Select(select) => Ok(select),
        _ => Err(unresolved(
            step_id,
            "statement body is a set operation, not a plain SELECT",
        )),
    }
}

fn parse_query_fragment(
    sql: &str,
    dialect: Dialect,
    step_id: &str,
    field: &str,
) -> Result<Box<Query>, PatchError> {
    let statements = Parser::parse_sql(&*dialect.parser(), sql)
        .map_err(|e| payload_error(step_id, field, e.to_string()))?;
    let mut iter = statements.into_iter();
    match (iter.next(), iter.next()) {
        (Some(Statement::Query(query)), None) => Ok(query),
        (Some(_), None) => Err(payload_error(
            step_id,
            field,
            "fragment is not a SELECT query",
        )),
        _ => Err(payload_error(
            step_id,
            field,
            "fragment must contain exactly one statement",
        )),
    }
}

fn parse_expr_fragment(
    expr_sql: &str,
    dialect: Dialect,
    step_id: &str,
) -> Result<Expr, PatchError> {
    use sqlparser::ast::SelectItem;

    let query = parse_query_fragment(
        &format!("SELECT {expr_sql}"),
        dialect,
        step_id,
        "expr_sql",
    )?;
    let select = match *query.body {
        SetExpr::Select(select) => select,
        _ => {
            return Err(payload_error(
                step_id,
                "expr_sql",
                "fragment is not a scalar expression",
            ));
        }
    };
    if select.projection.len() != 1 {
        return Err(payload_error(
            step_id,
            "expr_sql",
            "fragment parses as multiple expressions",
        ));
    }
    match select.projection.into_iter().next() {
        Some(SelectItem::UnnamedExpr(expr)) => Ok(expr),
        _ => Err(payload_error(
            step_id,
            "expr_sql",
            "fragment is not a bare expression",
        )),
    }
}

fn reparse_guard(
    statement: &IrStatement,
    dialect: Dialect,
    step_id: &str,
) -> Result<(), PatchError> {
    let rendered = render_statement(statement);
    Parser::parse_sql(&*dialect.parser(), &rendered)
        .map_err(|e| {
            payload_error(
                step_id,
                "statement",
                format!("patched statement no longer parses: {e}"),
            )
        })
        .map(|_| ())
}

fn parse_anchor(step_id: &str, text: &str) -> Result<AnchorHash, PatchError> {
    text.parse()
        .map_err(|e: crate::ir::InvalidAnchor| unresolved(step_id, e.to_string()))
}

fn required<'a>(
    step_id: &str,
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, PatchError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| payload_error(step_id, field, "required payload field is missing"))
}

fn unresolved(step_id: &str, message: impl Into<String>) -> PatchError {
    PatchError::new(PatchErrorKind::UnresolvedTarget, step_id, message)
}

fn payload_error(step_id: &str, field: &str, message: impl Into<String>) -> PatchError {
    PatchError::new(
        PatchErrorKind::PayloadParseError,
        step_id,
        format!("{field}: {}", message.into()),
    )
}
