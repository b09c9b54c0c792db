//! Script IR construction from SQL text.

use rustc_hash::FxHashSet;
use sqlparser::ast::Statement;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::dialect::Dialect;

use super::{IrError, IrStatement, NodeId, ScriptIr};

/// Parse `sql` into a [`ScriptIr`] in the given dialect.
///
/// Statements receive sequential node ids (`S0`, `S1`, …) in source order.
/// Every statement must be a SELECT; CTE names must be unique within their
/// statement.
pub fn build_script_ir(sql: &str, dialect: Dialect) -> Result<ScriptIr, IrError> {
    let parsed = Parser::parse_sql(&*dialect.parser(), sql).map_err(|e| IrError::Parse {
        message: e.to_string(),
    })?;

    if parsed.is_empty() {
        return Err(IrError::EmptyScript);
    }

    let mut statements = Vec::with_capacity(parsed.len());
    for (index, statement) in parsed.into_iter().enumerate() {
        let query = match statement {
            Statement::Query(query) => query,
            other => {
                return Err(IrError::UnsupportedStatement {
                    index,
                    kind: statement_kind(&other),
                });
            }
        };

        let stmt = IrStatement {
            node_id: NodeId::nth(index),
            query,
        };
        check_cte_names(&stmt)?;
        statements.push(stmt);
    }

    debug!(
        statements = statements.len(),
        dialect = %dialect,
        "built script IR"
    );

    Ok(ScriptIr {
        dialect,
        statements,
    })
}

fn check_cte_names(stmt: &IrStatement) -> Result<(), IrError> {
    let mut seen = FxHashSet::default();
    for cte in stmt.ctes() {
        let name = cte.alias.name.value.to_lowercase();
        if !seen.insert(name.clone()) {
            return Err(IrError::DuplicateCteName {
                node_id: stmt.node_id.as_str().to_string(),
                name,
            });
        }
    }
    Ok(())
}

fn statement_kind(statement: &Statement) -> String {
    // First keyword of the rendered statement is a good enough label for
    // the error message ("INSERT", "CREATE", ...).
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("?")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_sequential_node_ids() {
        let ir = build_script_ir("SELECT 1; SELECT 2;", Dialect::DuckDb).unwrap();
        assert_eq!(ir.statements.len(), 2);
        assert_eq!(ir.statements[0].node_id.as_str(), "S0");
        assert_eq!(ir.statements[1].node_id.as_str(), "S1");
    }

    #[test]
    fn rejects_non_select_statements() {
        let err = build_script_ir("INSERT INTO t VALUES (1)", Dialect::Postgres).unwrap_err();
        assert!(matches!(err, IrError::UnsupportedStatement { index: 0, .. }));
    }

    #[test]
    fn rejects_duplicate_cte_names() {
        let sql = "WITH a AS (SELECT 1), a AS (SELECT 2) SELECT * FROM a";
        let err = build_script_ir(sql, Dialect::DuckDb).unwrap_err();
        assert!(matches!(err, IrError::DuplicateCteName { .. }));
    }

    #[test]
    fn surfaces_parse_errors() {
        let err = build_script_ir("SELEC x FROM", Dialect::Postgres).unwrap_err();
        assert!(matches!(err, IrError::Parse { .. }));
    }

    #[test]
    fn output_columns_prefer_aliases() {
        let sql = "SELECT i_brand_id brand_id, i_brand AS brand, SUM(p) FROM t GROUP BY 1, 2";
        let ir = build_script_ir(sql, Dialect::DuckDb).unwrap();
        let cols = ir.statements[0].output_columns();
        assert_eq!(cols[0], "brand_id");
        assert_eq!(cols[1], "brand");
        assert_eq!(cols[2], "sum(p)");
    }
}
