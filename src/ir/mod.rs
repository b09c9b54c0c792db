//! Script IR: the typed in-memory form of a SQL script.
//!
//! A [`ScriptIr`] is an ordered sequence of SELECT statements parsed with
//! sqlparser, each tagged with a stable node id (`S0`, `S1`, …). Expression
//! subtrees are addressed by [`AnchorHash`] fingerprints computed on demand
//! from canonicalized text, so anchors survive re-rendering and re-parsing.
//!
//! The IR is cloned before every patch attempt; nothing here is shared
//! mutable state.

mod anchors;
mod builder;
mod node_map;
mod render;

pub use anchors::{anchor_of, canonical_sql, AnchorHash, InvalidAnchor};
pub use builder::build_script_ir;
pub use node_map::render_ir_node_map;
pub use render::{render_sql, render_statement};

use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Cte, Query, Select, SelectItem, SetExpr};
use thiserror::Error;

use crate::dialect::Dialect;

/// Stable statement identifier within a script: `S0`, `S1`, …
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn nth(index: usize) -> Self {
        Self(format!("S{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// One SELECT statement of the script, with its stable id.
#[derive(Clone, Debug)]
pub struct IrStatement {
    pub node_id: NodeId,
    pub query: Box<Query>,
}

impl IrStatement {
    /// The top-level `SELECT` body, when the statement is a plain select
    /// (not a set operation at the top level).
    pub fn select(&self) -> Option<&Select> {
        match self.query.body.as_ref() {
            SetExpr::Select(select) => Some(select),
            _ => None,
        }
    }

    pub fn select_mut(&mut self) -> Option<&mut Select> {
        match self.query.body.as_mut() {
            SetExpr::Select(select) => Some(select),
            _ => None,
        }
    }

    /// CTEs owned by this statement, in declaration order.
    pub fn ctes(&self) -> &[Cte] {
        self.query
            .with
            .as_ref()
            .map(|w| w.cte_tables.as_slice())
            .unwrap_or_default()
    }

    pub fn cte_named(&self, name: &str) -> Option<&Cte> {
        self.ctes()
            .iter()
            .find(|cte| cte.alias.name.value.eq_ignore_ascii_case(name))
    }

    /// Anchor of the whole statement subtree.
    pub fn anchor(&self) -> AnchorHash {
        anchor_of(self.query.as_ref())
    }

    /// Output column names of the top-level SELECT, in position order.
    ///
    /// Aliases win; bare (possibly qualified) columns use their final
    /// identifier; any other unaliased expression is named by its canonical
    /// text, which is stable for unchanged expressions. Set operations use
    /// the leftmost branch, mirroring engine behavior.
    pub fn output_columns(&self) -> Vec<String> {
        fn leftmost_select(body: &SetExpr) -> Option<&Select> {
            match body {
                SetExpr::Select(select) => Some(select),
                SetExpr::Query(query) => leftmost_select(&query.body),
                SetExpr::SetOperation { left, .. } => leftmost_select(left),
                _ => None,
            }
        }

        let Some(select) = leftmost_select(&self.query.body) else {
            return Vec::new();
        };
        select.projection.iter().map(column_name).collect()
    }
}

fn column_name(item: &SelectItem) -> String {
    use sqlparser::ast::Expr;
    match item {
        SelectItem::ExprWithAlias { alias, .. } => alias.value.to_lowercase(),
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => ident.value.to_lowercase(),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => parts
            .last()
            .map(|p| p.value.to_lowercase())
            .unwrap_or_default(),
        other => canonical_sql(other),
    }
}

/// Typed representation of one or more SELECT statements.
#[derive(Clone, Debug)]
pub struct ScriptIr {
    pub dialect: Dialect,
    pub statements: Vec<IrStatement>,
}

impl ScriptIr {
    pub fn statement(&self, node_id: &str) -> Option<&IrStatement> {
        self.statements
            .iter()
            .find(|s| s.node_id.as_str() == node_id)
    }

    pub fn statement_mut(&mut self, node_id: &str) -> Option<&mut IrStatement> {
        self.statements
            .iter_mut()
            .find(|s| s.node_id.as_str() == node_id)
    }

    /// Output columns of every statement's top-level SELECT.
    pub fn output_columns(&self) -> Vec<Vec<String>> {
        self.statements.iter().map(IrStatement::output_columns).collect()
    }
}

/// Errors raised while building or re-parsing Script IR.
#[derive(Debug, Error, Diagnostic)]
pub enum IrError {
    #[error("SQL parse error: {message}")]
    #[diagnostic(code(sqlbeam::ir::parse))]
    Parse { message: String },

    #[error("statement {index} is not a SELECT (found {kind})")]
    #[diagnostic(
        code(sqlbeam::ir::unsupported_statement),
        help("only SELECT statements (with optional CTEs) are optimizable")
    )]
    UnsupportedStatement { index: usize, kind: String },

    #[error("script contains no statements")]
    #[diagnostic(code(sqlbeam::ir::empty_script))]
    EmptyScript,

    #[error("duplicate CTE name {name:?} in statement {node_id}")]
    #[diagnostic(code(sqlbeam::ir::duplicate_cte))]
    DuplicateCteName { node_id: String, name: String },
}
