//! Tier-2 synthetic gate: execute baseline and candidate against small,
//! deterministically generated tables and compare result multisets.
//!
//! The generator is keyed to the query itself: referenced tables and
//! columns are inferred from the AST, column types from the literals they
//! are compared against, and the RNG seed from the sorted literal set. The
//! data deliberately includes NULLs in every nullable column so NOT IN /
//! anti-join traps diverge here instead of on the full dataset.

use std::ops::ControlFlow;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use sqlparser::ast::{BinaryOperator, Expr, ObjectName, TableFactor, Visit, Visitor};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::exec::{ExecError, ExecutorFactory};
use crate::ir::ScriptIr;

use super::equivalence::{compare_result_sets, CompareMode, EquivalenceReport};

const DEFAULT_ROWS_PER_TABLE: usize = 24;
const NULL_STRIDE: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SynType {
    Int,
    Float,
    Text,
}

impl SynType {
    fn ddl(self) -> &'static str {
        match self {
            SynType::Int => "BIGINT",
            SynType::Float => "DOUBLE PRECISION",
            SynType::Text => "VARCHAR",
        }
    }
}

/// One generated table, ready to materialize.
#[derive(Clone, Debug)]
pub struct SyntheticTable {
    pub name: String,
    pub create_sql: String,
    pub insert_sql: String,
}

/// The full generated fixture for one query.
#[derive(Clone, Debug)]
pub struct SyntheticDataset {
    pub tables: Vec<SyntheticTable>,
    pub seed: u64,
}

/// Runs the Tier-2 gate against a scratch executor.
#[derive(Clone, Debug)]
pub struct SyntheticValidator {
    rows_per_table: usize,
}

impl Default for SyntheticValidator {
    fn default() -> Self {
        Self {
            rows_per_table: DEFAULT_ROWS_PER_TABLE,
        }
    }
}

impl SyntheticValidator {
    pub fn new(rows_per_table: usize) -> Self {
        Self { rows_per_table }
    }

    /// Materialize the fixture on a fresh connection, run both queries,
    /// and compare. Executor failures surface as `Err` (the gate is
    /// unavailable, not failed).
    pub fn validate_pair(
        &self,
        factory: &dyn ExecutorFactory,
        ir: &ScriptIr,
        baseline_sql: &str,
        candidate_sql: &str,
        mode: CompareMode,
    ) -> Result<EquivalenceReport, ExecError> {
        let dataset = generate_dataset(ir, self.rows_per_table);
        let mut executor = factory.open()?;
        let timeout = Duration::from_secs(60);

        for table in &dataset.tables {
            executor.execute(&table.create_sql, timeout)?;
            executor.execute(&table.insert_sql, timeout)?;
        }

        let baseline = executor.execute(baseline_sql, timeout)?;
        let candidate = executor.execute(candidate_sql, timeout)?;
        let report = compare_result_sets(&baseline, &candidate, mode);
        debug!(
            seed = dataset.seed,
            tables = dataset.tables.len(),
            matched = report.matched,
            "synthetic gate"
        );
        Ok(report)
    }
}

/// Build the synthetic fixture for the tables a query references.
pub fn generate_dataset(ir: &ScriptIr, rows_per_table: usize) -> SyntheticDataset {
    let mut profile = QueryProfile::default();
    for statement in &ir.statements {
        for cte in statement.ctes() {
            profile.cte_names.insert(cte.alias.name.value.to_lowercase());
        }
        let _ = statement.query.visit(&mut profile);
    }
    profile.finish();

    let mut literals: Vec<String> = profile
        .literal_pool
        .iter()
        .map(|l| l.canonical())
        .collect();
    literals.sort();
    let seed = xxh3_64(literals.join("\u{1f}").as_bytes());

    let mut tables: Vec<SyntheticTable> = Vec::new();
    let mut names: Vec<&String> = profile.table_columns.keys().collect();
    names.sort();
    for name in names {
        let columns = &profile.table_columns[name];
        let table_seed = seed ^ xxh3_64(name.as_bytes());
        tables.push(build_table(name, columns, &profile, table_seed, rows_per_table));
    }

    SyntheticDataset { tables, seed }
}

#[derive(Clone, Debug, PartialEq)]
enum Literal {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    fn canonical(&self) -> String {
        match self {
            Literal::Int(i) => i.to_string(),
            Literal::Float(f) => format!("{f}"),
            Literal::Text(s) => s.clone(),
        }
    }

    fn syn_type(&self) -> SynType {
        match self {
            Literal::Int(_) => SynType::Int,
            Literal::Float(_) => SynType::Float,
            Literal::Text(_) => SynType::Text,
        }
    }
}

/// Everything the generator learns from one query.
#[derive(Default)]
struct QueryProfile {
    cte_names: FxHashSet<String>,
    /// alias -> base table
    aliases: FxHashMap<String, String>,
    base_tables: Vec<String>,
    qualified_columns: Vec<(String, String)>,
    unqualified_columns: Vec<String>,
    /// column name -> literals it is compared against
    column_literals: FxHashMap<String, Vec<Literal>>,
    literal_pool: Vec<Literal>,
    /// table -> ordered column list (filled by `finish`)
    table_columns: FxHashMap<String, Vec<String>>,
}

impl Visitor for QueryProfile {
    type Break = ();

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        if let TableFactor::Table { name, alias, .. } = table_factor {
            let table = object_name_text(name);
            if !self.cte_names.contains(&table) {
                if !self.base_tables.contains(&table) {
                    self.base_tables.push(table.clone());
                }
                if let Some(alias) = alias {
                    self.aliases
                        .insert(alias.name.value.to_lowercase(), table);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        match expr {
            Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
                self.qualified_columns.push((
                    parts[0].value.to_lowercase(),
                    parts[1].value.to_lowercase(),
                ));
            }
            Expr::Identifier(ident) => {
                self.unqualified_columns.push(ident.value.to_lowercase());
            }
            Expr::BinaryOp { left, op, right } if is_comparison(op) => {
                self.record_comparison(left, right);
                self.record_comparison(right, left);
            }
            Expr::InList { expr, list, .. } => {
                if let Some(column) = column_of(expr) {
                    for item in list {
                        if let Some(literal) = literal_of(item) {
                            self.push_column_literal(&column, literal);
                        }
                    }
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                if let Some(column) = column_of(expr) {
                    for bound in [low, high] {
                        if let Some(literal) = literal_of(bound) {
                            self.push_column_literal(&column, literal);
                        }
                    }
                }
            }
            Expr::Value(value) => {
                if let Some(literal) = value_literal(&value.value) {
                    if !self.literal_pool.contains(&literal) {
                        self.literal_pool.push(literal);
                    }
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

impl QueryProfile {
    fn record_comparison(&mut self, side: &Expr, other: &Expr) {
        if let (Some(column), Some(literal)) = (column_of(side), literal_of(other)) {
            self.push_column_literal(&column, literal);
        }
    }

    fn push_column_literal(&mut self, column: &str, literal: Literal) {
        let entry = self.column_literals.entry(column.to_string()).or_default();
        if !entry.contains(&literal) {
            entry.push(literal);
        }
    }

    /// Assign every referenced column to a base table.
    fn finish(&mut self) {
        for table in &self.base_tables {
            self.table_columns.entry(table.clone()).or_default();
        }

        let qualified = std::mem::take(&mut self.qualified_columns);
        for (qualifier, column) in qualified {
            let table = self
                .aliases
                .get(&qualifier)
                .cloned()
                .or_else(|| self.base_tables.iter().find(|t| **t == qualifier).cloned());
            if let Some(table) = table {
                push_unique(self.table_columns.entry(table).or_default(), column);
            }
        }

        let unqualified = std::mem::take(&mut self.unqualified_columns);
        for column in unqualified {
            if let Some(table) = self.owning_table(&column) {
                push_unique(self.table_columns.entry(table).or_default(), column);
            }
        }

        for columns in self.table_columns.values_mut() {
            if columns.is_empty() {
                columns.push("id".to_string());
            }
        }
    }

    /// Pick a home table for an unqualified column by the warehouse naming
    /// convention: `ss_sold_date_sk` belongs to the table whose initials
    /// or leading word match the `ss_` prefix. Falls back to the first
    /// base table.
    fn owning_table(&self, column: &str) -> Option<String> {
        let prefix = column.split('_').next().unwrap_or(column);
        let mut best: Option<&String> = None;
        let mut best_score = 0u8;
        for table in &self.base_tables {
            let score = prefix_score(table, prefix);
            if score > best_score {
                best_score = score;
                best = Some(table);
            }
        }
        best.or(self.base_tables.first()).cloned()
    }
}

fn prefix_score(table: &str, prefix: &str) -> u8 {
    let initials: String = table
        .split('_')
        .filter_map(|w| w.chars().next())
        .collect();
    if initials == prefix {
        return 3;
    }
    if table.starts_with(prefix) {
        return 2;
    }
    if table.split('_').any(|w| w.starts_with(prefix)) {
        return 1;
    }
    0
}

fn push_unique(columns: &mut Vec<String>, column: String) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

fn column_of(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.to_lowercase()),
        Expr::Nested(inner) => column_of(inner),
        _ => None,
    }
}

fn literal_of(expr: &Expr) -> Option<Literal> {
    match expr {
        Expr::Value(value) => value_literal(&value.value),
        Expr::Nested(inner) => literal_of(inner),
        _ => None,
    }
}

fn value_literal(value: &sqlparser::ast::Value) -> Option<Literal> {
    use sqlparser::ast::Value as V;
    match value {
        V::Number(text, _) => {
            if let Ok(i) = text.parse::<i64>() {
                Some(Literal::Int(i))
            } else {
                text.parse::<f64>().ok().map(Literal::Float)
            }
        }
        V::SingleQuotedString(s) | V::DoubleQuotedString(s) => Some(Literal::Text(s.clone())),
        V::Boolean(b) => Some(Literal::Int(i64::from(*b))),
        _ => None,
    }
}

fn build_table(
    name: &str,
    columns: &[String],
    profile: &QueryProfile,
    seed: u64,
    rows: usize,
) -> SyntheticTable {
    let mut rng = StdRng::seed_from_u64(seed);

    let types: Vec<SynType> = columns
        .iter()
        .map(|column| {
            profile
                .column_literals
                .get(column)
                .and_then(|ls| ls.first())
                .map(Literal::syn_type)
                .unwrap_or(SynType::Int)
        })
        .collect();

    let mut create_sql = format!("CREATE TABLE {name} (");
    for (i, (column, ty)) in columns.iter().zip(&types).enumerate() {
        if i > 0 {
            create_sql.push_str(", ");
        }
        create_sql.push_str(column);
        create_sql.push(' ');
        create_sql.push_str(ty.ddl());
    }
    create_sql.push(')');

    let mut insert_sql = format!("INSERT INTO {name} VALUES ");
    for row in 0..rows {
        if row > 0 {
            insert_sql.push_str(", ");
        }
        insert_sql.push('(');
        for (i, (column, ty)) in columns.iter().zip(&types).enumerate() {
            if i > 0 {
                insert_sql.push_str(", ");
            }
            insert_sql.push_str(&cell_sql(column, *ty, profile, row, &mut rng));
        }
        insert_sql.push(')');
    }

    SyntheticTable {
        name: name.to_string(),
        create_sql,
        insert_sql,
    }
}

/// One cell. Every `NULL_STRIDE`-th row is NULL (offset per column so
/// NULLs land in different rows); each integer column carries one
/// sentinel value unique to it, so anti-join and NOT IN shapes always
/// keep at least one surviving row; the rest cycle through the column's
/// own literals (so filters select something) and a small shared key
/// range (so equi-joins match).
fn cell_sql(
    column: &str,
    ty: SynType,
    profile: &QueryProfile,
    row: usize,
    rng: &mut StdRng,
) -> String {
    let column_hash = xxh3_64(column.as_bytes());
    let column_offset = (column_hash % NULL_STRIDE as u64) as usize;
    if (row + column_offset) % NULL_STRIDE == 0 {
        return "NULL".to_string();
    }

    if ty == SynType::Int {
        let sentinel_row = usize::from(column_offset == 0);
        if row == sentinel_row {
            // Byte sum keeps sentinels distinct for distinct column names
            // of equal meaning ("t_id" vs "r_id") without a shared range.
            let tag: i64 = column.bytes().map(i64::from).sum::<i64>()
                + 1000 * column.len() as i64;
            return (100_000 + tag).to_string();
        }
    }

    if let Some(literals) = profile.column_literals.get(column) {
        // Half the rows take values from the query's own literals so
        // filters select something; the rest miss.
        if row % 2 == 0 {
            let literal = &literals[row / 2 % literals.len()];
            return literal_sql(literal);
        }
    }

    match ty {
        SynType::Int => ((row % 8) as i64).to_string(),
        SynType::Float => format!("{:.2}", (row % 8) as f64 + 0.25 * rng.random_range(0..2) as f64),
        SynType::Text => format!("'v{}'", row % 6),
    }
}

fn literal_sql(literal: &Literal) -> String {
    match literal {
        Literal::Int(i) => i.to_string(),
        Literal::Float(f) => format!("{f}"),
        Literal::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
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

    fn dataset(sql: &str) -> SyntheticDataset {
        let ir = build_script_ir(sql, Dialect::DuckDb).unwrap();
        generate_dataset(&ir, 24)
    }

    #[test]
    fn referenced_tables_are_materialized_but_ctes_are_not() {
        let d = dataset(
            "WITH f AS (SELECT ss_item_sk FROM store_sales) \
             SELECT * FROM f JOIN item ON f.ss_item_sk = item.i_item_sk",
        );
        let names: Vec<&str> = d.tables.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"store_sales"));
        assert!(names.contains(&"item"));
        assert!(!names.contains(&"f"));
    }

    #[test]
    fn generation_is_deterministic() {
        let sql = "SELECT a FROM t WHERE a > 10 AND b = 'x'";
        let d1 = dataset(sql);
        let d2 = dataset(sql);
        assert_eq!(d1.seed, d2.seed);
        assert_eq!(d1.tables[0].insert_sql, d2.tables[0].insert_sql);
    }

    #[test]
    fn string_literals_type_their_columns() {
        let d = dataset("SELECT a FROM t WHERE b = 'books' AND a > 5");
        let create = &d.tables[0].create_sql;
        assert!(create.contains("b VARCHAR"), "{create}");
        assert!(create.contains("a BIGINT"), "{create}");
    }

    #[test]
    fn every_column_gets_nulls() {
        let d = dataset("SELECT a FROM t WHERE a > 0");
        assert!(d.tables[0].insert_sql.contains("NULL"));
    }

    #[test]
    fn warehouse_prefixes_route_columns() {
        let d = dataset(
            "SELECT d_year FROM date_dim, store_sales WHERE d_date_sk = ss_sold_date_sk",
        );
        let date_dim = d.tables.iter().find(|t| t.name == "date_dim").unwrap();
        let store_sales = d.tables.iter().find(|t| t.name == "store_sales").unwrap();
        assert!(date_dim.create_sql.contains("d_year"), "{}", date_dim.create_sql);
        assert!(date_dim.create_sql.contains("d_date_sk"));
        assert!(
            store_sales.create_sql.contains("ss_sold_date_sk"),
            "{}",
            store_sales.create_sql
        );
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn synthetic_gate_catches_not_in_null_trap() {
        use crate::exec::SqliteFactory;

        // Baseline keeps NULL semantics; the "rewrite" filters NULLs out
        // of the subquery, changing results on NULL-bearing data.
        let baseline = "SELECT t_id FROM orders WHERE t_id NOT IN (SELECT r_id FROM returns)";
        let rewrite = "SELECT t_id FROM orders WHERE t_id NOT IN \
                       (SELECT r_id FROM returns WHERE r_id IS NOT NULL)";

        let ir = build_script_ir(baseline, Dialect::DuckDb).unwrap();
        let factory = SqliteFactory::new(":memory:");
        let report = SyntheticValidator::default()
            .validate_pair(&factory, &ir, baseline, rewrite, CompareMode::Unordered)
            .unwrap();
        assert!(!report.matched, "NULL trap should diverge on synthetic data");
    }
}
