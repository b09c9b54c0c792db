//! SQL rendering from Script IR.
//!
//! Rendering delegates to sqlparser's canonical Display: keywords come out
//! uppercased, aliases carry explicit `AS`, and CTE order is preserved as
//! stored. The output is a fixed point: re-parsing and re-rendering yields
//! the same text.

use super::{IrStatement, ScriptIr};

/// Render one statement, without a trailing terminator.
pub fn render_statement(statement: &IrStatement) -> String {
    statement.query.to_string()
}

/// Render the whole script; statements are `;`-terminated.
pub fn render_sql(ir: &ScriptIr) -> String {
    let mut out = String::new();
    for (i, statement) in ir.statements.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&render_statement(statement));
        out.push(';');
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::dialect::Dialect;
    use crate::ir::build_script_ir;

    use super::*;

    #[test]
    fn render_is_idempotent() {
        let sql = "with x as (select 1 as a) select a from x order by a limit 5";
        let ir = build_script_ir(sql, Dialect::DuckDb).unwrap();
        let once = render_sql(&ir);
        let ir2 = build_script_ir(&once, Dialect::DuckDb).unwrap();
        assert_eq!(render_sql(&ir2), once);
    }

    #[test]
    fn keywords_are_uppercased_and_aliases_explicit() {
        let ir = build_script_ir("select a from t tt", Dialect::Postgres).unwrap();
        let rendered = render_sql(&ir);
        assert!(rendered.contains("SELECT"));
        assert!(rendered.contains("FROM t AS tt"));
    }

    #[test]
    fn multi_statement_scripts_are_semicolon_joined() {
        let ir = build_script_ir("SELECT 1; SELECT 2", Dialect::DuckDb).unwrap();
        let rendered = render_sql(&ir);
        assert_eq!(rendered.matches(';').count(), 2);
    }
}
