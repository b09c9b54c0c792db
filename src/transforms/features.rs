//! Coarse AST feature extraction for the transform gate.
//!
//! Features are cheap predicates over the query's shape; the gate matches
//! them against each transform's fingerprint. Precision is deliberately
//! coarse: the gate prunes the catalog for prompts, it does not prove
//! applicability.

use std::fmt;
use std::ops::ControlFlow;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArguments, JoinOperator, ObjectName, Query, SetExpr,
    SetOperator, TableFactor, Visit, Visitor,
};

use crate::ir::ScriptIr;

/// Shape predicates a query can exhibit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryFeature {
    HasCorrelatedSubquery,
    HasOrAcrossColumns,
    HasOrChainSameColumn,
    HasNotIn,
    HasInSubquery,
    HasExists,
    RepeatsFactScan,
    TableRepeat8Plus,
    HasWindowFunction,
    HasUnion,
    HasSelfJoin,
    AggCountDistinct,
    HasCte,
    HasHaving,
    HasDistinct,
    HasGroupBy,
    HasOrderByLimit,
    HasOuterJoin,
    HasWhereFilter,
}

impl fmt::Display for QueryFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryFeature::HasCorrelatedSubquery => "HAS_CORRELATED_SUBQUERY",
            QueryFeature::HasOrAcrossColumns => "HAS_OR_ACROSS_COLUMNS",
            QueryFeature::HasOrChainSameColumn => "HAS_OR_CHAIN_SAME_COLUMN",
            QueryFeature::HasNotIn => "HAS_NOT_IN",
            QueryFeature::HasInSubquery => "HAS_IN_SUBQUERY",
            QueryFeature::HasExists => "HAS_EXISTS",
            QueryFeature::RepeatsFactScan => "REPEATS_FACT_SCAN",
            QueryFeature::TableRepeat8Plus => "TABLE_REPEAT_8_PLUS",
            QueryFeature::HasWindowFunction => "HAS_WINDOW_FUNCTION",
            QueryFeature::HasUnion => "HAS_UNION",
            QueryFeature::HasSelfJoin => "HAS_SELF_JOIN",
            QueryFeature::AggCountDistinct => "AGG_COUNT_DISTINCT",
            QueryFeature::HasCte => "HAS_CTE",
            QueryFeature::HasHaving => "HAS_HAVING",
            QueryFeature::HasDistinct => "HAS_DISTINCT",
            QueryFeature::HasGroupBy => "HAS_GROUP_BY",
            QueryFeature::HasOrderByLimit => "HAS_ORDER_BY_LIMIT",
            QueryFeature::HasOuterJoin => "HAS_OUTER_JOIN",
            QueryFeature::HasWhereFilter => "HAS_WHERE_FILTER",
        };
        f.write_str(name)
    }
}

/// Extract the feature set of a whole script.
pub fn extract_features(ir: &ScriptIr) -> FxHashSet<QueryFeature> {
    let mut scan = FeatureScan::default();
    for statement in &ir.statements {
        for cte in statement.ctes() {
            scan.cte_names.insert(cte.alias.name.value.to_lowercase());
        }
    }
    for statement in &ir.statements {
        let _ = statement.query.visit(&mut scan);
    }
    scan.finish()
}

#[derive(Default)]
struct Scope {
    tables: FxHashMap<String, usize>,
    defined: FxHashSet<String>,
    qualifiers: FxHashSet<String>,
}

#[derive(Default)]
struct FeatureScan {
    features: FxHashSet<QueryFeature>,
    cte_names: FxHashSet<String>,
    global_tables: FxHashMap<String, usize>,
    scopes: Vec<Scope>,
}

impl FeatureScan {
    fn mark(&mut self, feature: QueryFeature) {
        self.features.insert(feature);
    }

    fn scan_body(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                use sqlparser::ast::GroupByExpr;
                if select.selection.is_some() {
                    self.mark(QueryFeature::HasWhereFilter);
                }
                if select.having.is_some() {
                    self.mark(QueryFeature::HasHaving);
                }
                if select.distinct.is_some() {
                    self.mark(QueryFeature::HasDistinct);
                }
                if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
                    if !exprs.is_empty() {
                        self.mark(QueryFeature::HasGroupBy);
                    }
                }
                for table in &select.from {
                    for join in &table.joins {
                        if matches!(
                            join.join_operator,
                            JoinOperator::Left(_)
                                | JoinOperator::LeftOuter(_)
                                | JoinOperator::Right(_)
                                | JoinOperator::RightOuter(_)
                                | JoinOperator::FullOuter(_)
                        ) {
                            self.mark(QueryFeature::HasOuterJoin);
                        }
                    }
                }
            }
            SetExpr::SetOperation {
                op, left, right, ..
            } => {
                if *op == SetOperator::Union {
                    self.mark(QueryFeature::HasUnion);
                }
                self.scan_body(left);
                self.scan_body(right);
            }
            _ => {}
        }
    }

    fn finish(self) -> FxHashSet<QueryFeature> {
        let mut features = self.features;
        for count in self.global_tables.values() {
            if *count >= 2 {
                features.insert(QueryFeature::RepeatsFactScan);
            }
            if *count >= 8 {
                features.insert(QueryFeature::TableRepeat8Plus);
            }
        }
        features
    }
}

impl Visitor for FeatureScan {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        self.scopes.push(Scope::default());
        if query.with.is_some() {
            self.mark(QueryFeature::HasCte);
        }
        if query.order_by.is_some() && query.limit_clause.is_some() {
            self.mark(QueryFeature::HasOrderByLimit);
        }
        self.scan_body(&query.body);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        if let Some(scope) = self.scopes.pop() {
            if scope.tables.values().any(|c| *c >= 2) {
                self.mark(QueryFeature::HasSelfJoin);
            }
            let nested = !self.scopes.is_empty();
            if nested
                && scope
                    .qualifiers
                    .iter()
                    .any(|q| !scope.defined.contains(q))
            {
                self.mark(QueryFeature::HasCorrelatedSubquery);
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        let (name, alias) = match table_factor {
            TableFactor::Table { name, alias, .. } => (Some(name), alias),
            TableFactor::Derived { alias, .. } => (None, alias),
            _ => (None, &None),
        };
        if let Some(scope) = self.scopes.last_mut() {
            if let Some(name) = name {
                let table = object_name_text(name);
                scope.defined.insert(table.clone());
                if !self.cte_names.contains(&table) {
                    *scope.tables.entry(table.clone()).or_insert(0) += 1;
                    *self.global_tables.entry(table).or_insert(0) += 1;
                }
            }
            if let Some(alias) = alias {
                scope.defined.insert(alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        match expr {
            Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
                if let Some(scope) = self.scopes.last_mut() {
                    scope.qualifiers.insert(parts[0].value.to_lowercase());
                }
            }
            Expr::InSubquery { negated, .. } => {
                self.mark(if *negated {
                    QueryFeature::HasNotIn
                } else {
                    QueryFeature::HasInSubquery
                });
            }
            Expr::InList { negated: true, .. } => {
                self.mark(QueryFeature::HasNotIn);
            }
            Expr::Exists { .. } => {
                self.mark(QueryFeature::HasExists);
            }
            Expr::Function(function) => {
                if function.over.is_some() {
                    self.mark(QueryFeature::HasWindowFunction);
                }
                if is_count_distinct(function) {
                    self.mark(QueryFeature::AggCountDistinct);
                }
            }
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => {
                self.classify_or(left, right);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

impl FeatureScan {
    fn classify_or(&mut self, left: &Expr, right: &Expr) {
        let left_cols = columns_in(left);
        let right_cols = columns_in(right);
        if left_cols.is_empty() || right_cols.is_empty() {
            return;
        }
        if left_cols == right_cols && left_cols.len() == 1 {
            self.mark(QueryFeature::HasOrChainSameColumn);
        } else if left_cols.is_disjoint(&right_cols) {
            self.mark(QueryFeature::HasOrAcrossColumns);
        }
    }
}

fn columns_in(expr: &Expr) -> FxHashSet<String> {
    let mut columns = FxHashSet::default();
    let _ = sqlparser::ast::visit_expressions(expr, |e: &Expr| {
        match e {
            Expr::Identifier(ident) => {
                columns.insert(ident.value.to_lowercase());
            }
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    columns.insert(last.value.to_lowercase());
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    columns
}

fn is_count_distinct(function: &sqlparser::ast::Function) -> bool {
    use sqlparser::ast::DuplicateTreatment;

    let is_count = function
        .name
        .0
        .last()
        .is_some_and(|p| p.to_string().eq_ignore_ascii_case("count"));
    if !is_count {
        return false;
    }
    matches!(
        &function.args,
        FunctionArguments::List(list)
            if list.duplicate_treatment == Some(DuplicateTreatment::Distinct)
    )
}

fn object_name_text(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|part| part.to_string().trim_matches('"').to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use crate::dialect::Dialect;
    use crate::ir::build_script_ir;

    use super::*;

    fn features(sql: &str) -> FxHashSet<QueryFeature> {
        let ir = build_script_ir(sql, Dialect::DuckDb).unwrap();
        extract_features(&ir)
    }

    #[test]
    fn correlated_subquery_is_detected() {
        let f = features(
            "SELECT * FROM store_returns sr WHERE sr.return_amt > \
             (SELECT AVG(sr2.return_amt) * 1.2 FROM store_returns sr2 \
              WHERE sr2.store_sk = sr.store_sk)",
        );
        assert!(f.contains(&QueryFeature::HasCorrelatedSubquery));
    }

    #[test]
    fn uncorrelated_subquery_is_not_flagged_correlated() {
        let f = features("SELECT * FROM t WHERE a IN (SELECT b FROM u WHERE u.c = 1)");
        assert!(!f.contains(&QueryFeature::HasCorrelatedSubquery));
        assert!(f.contains(&QueryFeature::HasInSubquery));
    }

    #[test]
    fn not_in_and_exists() {
        let f = features(
            "SELECT 1 FROM t WHERE a NOT IN (SELECT b FROM u) \
             AND EXISTS (SELECT 1 FROM v WHERE v.x = 1)",
        );
        assert!(f.contains(&QueryFeature::HasNotIn));
        assert!(f.contains(&QueryFeature::HasExists));
    }

    #[test]
    fn or_across_columns_vs_same_column_chain() {
        let across = features("SELECT 1 FROM t WHERE a = 1 OR b = 2");
        assert!(across.contains(&QueryFeature::HasOrAcrossColumns));

        let chain = features("SELECT 1 FROM t WHERE a = 1 OR a = 2 OR a = 3");
        assert!(chain.contains(&QueryFeature::HasOrChainSameColumn));
        assert!(!chain.contains(&QueryFeature::HasOrAcrossColumns));
    }

    #[test]
    fn repeated_scans_and_self_join() {
        let f = features(
            "SELECT * FROM sales s1 JOIN sales s2 ON s1.id = s2.parent_id",
        );
        assert!(f.contains(&QueryFeature::HasSelfJoin));
        assert!(f.contains(&QueryFeature::RepeatsFactScan));

        let separate = features(
            "SELECT (SELECT MAX(x) FROM sales), (SELECT MIN(x) FROM sales) FROM dim",
        );
        assert!(separate.contains(&QueryFeature::RepeatsFactScan));
        assert!(!separate.contains(&QueryFeature::HasSelfJoin));
    }

    #[test]
    fn window_union_count_distinct() {
        let f = features(
            "SELECT RANK() OVER (PARTITION BY g ORDER BY v) AS r, COUNT(DISTINCT c) AS n \
             FROM t GROUP BY g, v, c \
             UNION ALL SELECT 1, 2",
        );
        assert!(f.contains(&QueryFeature::HasWindowFunction));
        assert!(f.contains(&QueryFeature::HasUnion));
        assert!(f.contains(&QueryFeature::AggCountDistinct));
    }

    #[test]
    fn cte_references_do_not_count_as_table_repeats() {
        let f = features(
            "WITH base AS (SELECT * FROM facts) \
             SELECT * FROM base b1 JOIN base b2 ON b1.id = b2.id",
        );
        assert!(f.contains(&QueryFeature::HasCte));
        assert!(!f.contains(&QueryFeature::RepeatsFactScan));
    }

    #[test]
    fn clause_features() {
        let f = features(
            "SELECT DISTINCT a, SUM(b) AS s FROM t LEFT JOIN u ON t.id = u.id \
             WHERE a > 0 GROUP BY a HAVING SUM(b) > 10 ORDER BY s LIMIT 10",
        );
        for feature in [
            QueryFeature::HasDistinct,
            QueryFeature::HasGroupBy,
            QueryFeature::HasHaving,
            QueryFeature::HasWhereFilter,
            QueryFeature::HasOrderByLimit,
            QueryFeature::HasOuterJoin,
        ] {
            assert!(f.contains(&feature), "missing {feature}");
        }
    }
}
