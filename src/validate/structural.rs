//! Tier-1 structural gate: checks that need no database.
//!
//! A candidate passes when its SQL parses in the target dialect, every
//! statement keeps the baseline's output column list (alias + position,
//! case-insensitive) unless the plan declared a select-list change, every
//! two-part column reference resolves to a name visible in the statement,
//! and no CTE is defined but never referenced.

use std::ops::ControlFlow;

use rustc_hash::FxHashSet;
use sqlparser::ast::{
    Expr, ObjectName, TableFactor, Visit, Visitor,
};

use crate::dialect::Dialect;
use crate::ir::{IrStatement, ScriptIr, build_script_ir};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructuralIssueKind {
    ParseError,
    StatementCountChanged,
    ColumnMismatch,
    UnknownQualifier,
    UnreferencedCte,
}

#[derive(Clone, Debug)]
pub struct StructuralIssue {
    pub kind: StructuralIssueKind,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct StructuralReport {
    pub passed: bool,
    pub issues: Vec<StructuralIssue>,
}

impl StructuralReport {
    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(|i| i.message.clone())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Run the Tier-1 structural gate on `candidate_sql` against the baseline IR.
pub fn tier1_structural(
    baseline: &ScriptIr,
    candidate_sql: &str,
    dialect: Dialect,
    allow_select_list_change: bool,
) -> StructuralReport {
    let mut issues = Vec::new();

    let candidate = match build_script_ir(candidate_sql, dialect) {
        Ok(ir) => ir,
        Err(e) => {
            return StructuralReport {
                passed: false,
                issues: vec![StructuralIssue {
                    kind: StructuralIssueKind::ParseError,
                    message: format!("Tier-1: candidate does not parse: {e}"),
                }],
            };
        }
    };

    if candidate.statements.len() != baseline.statements.len() {
        issues.push(StructuralIssue {
            kind: StructuralIssueKind::StatementCountChanged,
            message: format!(
                "Tier-1: statement count changed from {} to {}",
                baseline.statements.len(),
                candidate.statements.len()
            ),
        });
    }

    for (base, cand) in baseline.statements.iter().zip(&candidate.statements) {
        if !allow_select_list_change {
            check_columns(base, cand, &mut issues);
        }
        check_identifier_scope(cand, &mut issues);
        check_cte_references(cand, &mut issues);
    }

    StructuralReport {
        passed: issues.is_empty(),
        issues,
    }
}

fn check_columns(base: &IrStatement, cand: &IrStatement, issues: &mut Vec<StructuralIssue>) {
    let expected = base.output_columns();
    let actual = cand.output_columns();
    if expected == actual {
        return;
    }
    if expected.len() != actual.len() {
        issues.push(StructuralIssue {
            kind: StructuralIssueKind::ColumnMismatch,
            message: format!(
                "Tier-1: statement {} output column count changed from {} to {}",
                base.node_id,
                expected.len(),
                actual.len()
            ),
        });
        return;
    }
    for (position, (want, got)) in expected.iter().zip(&actual).enumerate() {
        if want != got {
            issues.push(StructuralIssue {
                kind: StructuralIssueKind::ColumnMismatch,
                message: format!(
                    "Tier-1: statement {} column {position} renamed from {want:?} to {got:?}",
                    base.node_id
                ),
            });
        }
    }
}

/// Names visible anywhere in a statement: tables, table aliases, CTE names.
#[derive(Default)]
struct ScopeCollector {
    defined: FxHashSet<String>,
    qualifiers: Vec<String>,
    relations: FxHashSet<String>,
}

impl Visitor for ScopeCollector {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        if let Some(last) = relation.0.last() {
            let name = last.to_string().trim_matches('"').to_lowercase();
            self.defined.insert(name.clone());
            self.relations.insert(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        let alias = match table_factor {
            TableFactor::Table { alias, .. } => alias,
            TableFactor::Derived { alias, .. } => alias,
            TableFactor::NestedJoin { alias, .. } => alias,
            TableFactor::TableFunction { alias, .. } => alias,
            _ => &None,
        };
        if let Some(alias) = alias {
            self.defined.insert(alias.name.value.to_lowercase());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Expr::CompoundIdentifier(parts) = expr {
            // Only simple `qualifier.column` references are checkable
            // without catalog metadata.
            if parts.len() == 2 {
                self.qualifiers.push(parts[0].value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }
}

fn check_identifier_scope(statement: &IrStatement, issues: &mut Vec<StructuralIssue>) {
    let mut scope = ScopeCollector::default();
    for cte in statement.ctes() {
        scope.defined.insert(cte.alias.name.value.to_lowercase());
    }
    let _ = statement.query.visit(&mut scope);

    let mut reported = FxHashSet::default();
    for qualifier in &scope.qualifiers {
        if !scope.defined.contains(qualifier) && reported.insert(qualifier.clone()) {
            issues.push(StructuralIssue {
                kind: StructuralIssueKind::UnknownQualifier,
                message: format!(
                    "Tier-1: statement {} references unknown alias or table {qualifier:?}",
                    statement.node_id
                ),
            });
        }
    }
}

fn check_cte_references(statement: &IrStatement, issues: &mut Vec<StructuralIssue>) {
    if statement.ctes().is_empty() {
        return;
    }
    let mut scope = ScopeCollector::default();
    let _ = statement.query.visit(&mut scope);

    for cte in statement.ctes() {
        let name = cte.alias.name.value.to_lowercase();
        if !scope.relations.contains(&name) {
            issues.push(StructuralIssue {
                kind: StructuralIssueKind::UnreferencedCte,
                message: format!(
                    "Tier-1: statement {} defines CTE {name:?} but never references it",
                    statement.node_id
                ),
            });
        }
    }
}
