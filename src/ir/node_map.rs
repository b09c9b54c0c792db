//! Compact human-readable outline of a Script IR.
//!
//! The node map is prompt input: one line per statement, indented lines for
//! CTEs and the WHERE predicate, each tagged with its anchor hash in
//! brackets so the analyst and workers can address subtrees.

use std::fmt::Write as _;
use std::ops::ControlFlow;

use sqlparser::ast::{ObjectName, visit_relations};

use super::{IrStatement, ScriptIr, anchor_of, canonical_sql};

const SUMMARY_WIDTH: usize = 88;

/// Render the outline used as prompt input.
pub fn render_ir_node_map(ir: &ScriptIr) -> String {
    let mut out = String::new();
    for statement in &ir.statements {
        render_statement_lines(statement, &mut out);
    }
    out
}

fn render_statement_lines(statement: &IrStatement, out: &mut String) {
    let tables = referenced_tables(statement);
    let _ = writeln!(
        out,
        "{} [{}] select {} cols from {}",
        statement.node_id,
        statement.anchor(),
        statement.output_columns().len(),
        if tables.is_empty() {
            "-".to_string()
        } else {
            tables.join(", ")
        },
    );

    for cte in statement.ctes() {
        let _ = writeln!(
            out,
            "  cte {} [{}] {}",
            cte.alias.name.value.to_lowercase(),
            anchor_of(cte.query.as_ref()),
            truncate(&canonical_sql(cte.query.as_ref())),
        );
    }

    if let Some(select) = statement.select() {
        if let Some(predicate) = &select.selection {
            let _ = writeln!(
                out,
                "  where [{}] {}",
                anchor_of(predicate),
                truncate(&canonical_sql(predicate)),
            );
        }
        if let Some(having) = &select.having {
            let _ = writeln!(
                out,
                "  having [{}] {}",
                anchor_of(having),
                truncate(&canonical_sql(having)),
            );
        }
    }
}

fn referenced_tables(statement: &IrStatement) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let _ = visit_relations(statement.query.as_ref(), |name: &ObjectName| {
        let rendered = canonical_sql(name);
        if !tables.contains(&rendered) {
            tables.push(rendered);
        }
        ControlFlow::<()>::Continue(())
    });
    tables
}

fn truncate(text: &str) -> String {
    if text.len() <= SUMMARY_WIDTH {
        return text.to_string();
    }
    let mut cut = SUMMARY_WIDTH;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}
