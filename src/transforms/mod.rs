//! The transform catalog and the gate that prunes it per query.
//!
//! Each transform is a named rewrite pattern with a feature fingerprint
//! (which query shapes it applies to), a family letter, and optionally an
//! engine capability it depends on. The gate scores catalog entries by
//! feature overlap and drops or demotes the ones the run dialect cannot
//! express natively.

mod features;
mod gate;

pub use features::{extract_features, QueryFeature};
pub use gate::{applicable_transforms, GatedTransform, MIN_OVERLAP};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialect::EngineFeature;

/// Transform family letter used across prompts, candidates, and reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Family {
    /// Human label used in prompt catalogs.
    pub fn label(&self) -> &'static str {
        match self {
            Family::A => "filter sargability & early reduction",
            Family::B => "subquery decorrelation & NULL traps",
            Family::C => "CTE factoring & pre-aggregation",
            Family::D => "join shape (semi/anti/self)",
            Family::E => "set operations & boolean logic",
            Family::F => "window & top-k intent",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Family::A => "A",
            Family::B => "B",
            Family::C => "C",
            Family::D => "D",
            Family::E => "E",
            Family::F => "F",
        };
        f.write_str(letter)
    }
}

impl std::str::FromStr for Family {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Family::A),
            "B" => Ok(Family::B),
            "C" => Ok(Family::C),
            "D" => Ok(Family::D),
            "E" => Ok(Family::E),
            "F" => Ok(Family::F),
            _ => Err(()),
        }
    }
}

/// One named rewrite pattern.
#[derive(Clone, Debug)]
pub struct Transform {
    /// Stable id used by probes and gold examples.
    pub id: &'static str,
    /// Rulebook id (`QT-SUBQ-001` style) kept for cross-referencing.
    pub rule_id: &'static str,
    pub family: Family,
    pub name: &'static str,
    /// Feature fingerprint; overlap with the query's features gates entry.
    pub required_features: &'static [QueryFeature],
    /// Engine capability the rewrite's target syntax needs, if any.
    pub requires_engine_feature: Option<EngineFeature>,
    /// Tags matched against gold-example tags.
    pub tags: &'static [&'static str],
}

/// The built-in catalog.
pub static CATALOG: &[Transform] = &[
    Transform {
        id: "decorrelate_scalar_subquery",
        rule_id: "QT-SUBQ-001",
        family: Family::B,
        name: "Correlated scalar aggregate subquery -> join + group",
        required_features: &[QueryFeature::HasCorrelatedSubquery],
        requires_engine_feature: None,
        tags: &["decorrelate", "subquery"],
    },
    Transform {
        id: "exists_to_semi_join",
        rule_id: "QT-SUBQ-002",
        family: Family::D,
        name: "Correlated EXISTS/IN -> semi-join",
        required_features: &[QueryFeature::HasExists, QueryFeature::HasCorrelatedSubquery],
        requires_engine_feature: Some(EngineFeature::SemiJoinSyntax),
        tags: &["semi_join", "exists"],
    },
    Transform {
        id: "not_in_to_not_exists",
        rule_id: "QT-NULL-001",
        family: Family::B,
        name: "NOT IN (NULL trap) -> NOT EXISTS",
        required_features: &[QueryFeature::HasNotIn],
        requires_engine_feature: None,
        tags: &["not_in", "null_trap", "anti_join"],
    },
    Transform {
        id: "left_join_null_to_not_exists",
        rule_id: "QT-JOIN-002",
        family: Family::D,
        name: "LEFT JOIN ... WHERE IS NULL -> anti-join",
        required_features: &[QueryFeature::HasOuterJoin],
        requires_engine_feature: None,
        tags: &["anti_join", "outer_join"],
    },
    Transform {
        id: "or_to_union",
        rule_id: "QT-BOOL-001",
        family: Family::E,
        name: "OR across columns -> UNION ALL branches",
        required_features: &[QueryFeature::HasOrAcrossColumns],
        requires_engine_feature: None,
        tags: &["or_to_union", "boolean"],
    },
    Transform {
        id: "or_chain_to_in",
        rule_id: "QT-FILT-002",
        family: Family::A,
        name: "OR-of-equalities on one column -> IN list",
        required_features: &[QueryFeature::HasOrChainSameColumn],
        requires_engine_feature: None,
        tags: &["in_list", "sargability"],
    },
    Transform {
        id: "early_filter",
        rule_id: "QT-FILT-001",
        family: Family::A,
        name: "Hoist selective dimension filters into a leading CTE",
        required_features: &[QueryFeature::HasWhereFilter],
        requires_engine_feature: None,
        tags: &["early_filter", "date_filter", "pushdown"],
    },
    Transform {
        id: "self_join_to_window",
        rule_id: "QT-TOPK-002",
        family: Family::F,
        name: "Greatest-per-group self-join -> window function",
        required_features: &[QueryFeature::HasSelfJoin],
        requires_engine_feature: None,
        tags: &["window", "self_join", "top_k"],
    },
    Transform {
        id: "subquery_to_qualify",
        rule_id: "QT-TOPK-001",
        family: Family::F,
        name: "Latest-per-group correlated MAX() -> QUALIFY",
        required_features: &[QueryFeature::HasCorrelatedSubquery],
        requires_engine_feature: Some(EngineFeature::Qualify),
        tags: &["qualify", "window", "top_k"],
    },
    Transform {
        id: "topn_per_group",
        rule_id: "QT-TOPK-003",
        family: Family::F,
        name: "Top-N per group -> ranked window filter",
        required_features: &[QueryFeature::HasGroupBy, QueryFeature::HasOrderByLimit],
        requires_engine_feature: None,
        tags: &["window", "top_k"],
    },
    Transform {
        id: "window_pushdown",
        rule_id: "QT-PLAN-001",
        family: Family::F,
        name: "Window blocks pushdown -> isolate filtered subset first",
        required_features: &[QueryFeature::HasWindowFunction, QueryFeature::HasWhereFilter],
        requires_engine_feature: None,
        tags: &["window", "pushdown"],
    },
    Transform {
        id: "repeated_subquery_to_cte",
        rule_id: "QT-CTE-003",
        family: Family::C,
        name: "Repeated identical scans -> factor into one CTE",
        required_features: &[QueryFeature::RepeatsFactScan],
        requires_engine_feature: None,
        tags: &["cte", "common_subexpression"],
    },
    Transform {
        id: "cte_inliner",
        rule_id: "QT-CTE-002",
        family: Family::C,
        name: "CTE fence blocking pushdown -> inline single-use CTE",
        required_features: &[QueryFeature::HasCte],
        requires_engine_feature: None,
        tags: &["cte", "pushdown"],
    },
    Transform {
        id: "pre_aggregate",
        rule_id: "QT-AGG-002",
        family: Family::C,
        name: "Pre-aggregate fact rows before the join",
        required_features: &[QueryFeature::HasGroupBy, QueryFeature::RepeatsFactScan],
        requires_engine_feature: None,
        tags: &["pre_aggregate", "group_by"],
    },
    Transform {
        id: "having_to_where",
        rule_id: "QT-AGG-005",
        family: Family::C,
        name: "Non-aggregate HAVING predicate -> WHERE",
        required_features: &[QueryFeature::HasHaving],
        requires_engine_feature: None,
        tags: &["having", "pushdown"],
    },
    Transform {
        id: "manual_pivot_to_pivot",
        rule_id: "QT-AGG-001",
        family: Family::C,
        name: "Manual pivot via repeated scans -> PIVOT",
        required_features: &[QueryFeature::RepeatsFactScan, QueryFeature::HasGroupBy],
        requires_engine_feature: Some(EngineFeature::Pivot),
        tags: &["pivot", "conditional_aggregation"],
    },
];

/// Lookup by transform id.
pub fn transform_by_id(id: &str) -> Option<&'static Transform> {
    CATALOG.iter().find(|t| t.id == id)
}
