//! Built-in per-dialect playbooks injected into prompts.
//!
//! Callers with their own tuned playbooks set
//! `SessionConfig::engine_knowledge`; these defaults cover the common
//! rewrite hazards and optimizer behaviors of each engine.

use crate::dialect::Dialect;

/// The default playbook text for a dialect.
pub fn playbook(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::DuckDb => DUCKDB_PLAYBOOK,
        Dialect::Postgres => POSTGRES_PLAYBOOK,
        Dialect::Snowflake => SNOWFLAKE_PLAYBOOK,
    }
}

const DUCKDB_PLAYBOOK: &str = "\
## Dialect Profile (DUCKDB)
- The optimizer decorrelates many subqueries itself; a rewrite wins when it
  also removes a repeated fact-table scan.
- QUALIFY (0.9+) filters window results without a wrapping subquery.
- SEMI / ANTI JOIN syntax is native and usually beats EXISTS in plans.
- Prefer explicit JOIN ... ON over comma joins; the planner's join-order
  search is better informed.
- Filters on dimension tables hoisted into a leading CTE reduce probe-side
  hash-join input dramatically on star schemas.
- EXPLAIN timings attribute hash-build and probe separately; a dominant
  SEQ_SCAN on a fact table is the usual target.";

const POSTGRES_PLAYBOOK: &str = "\
## Dialect Profile (POSTGRES)
- No QUALIFY; window filters need a wrapping subquery on the alias.
- Correlated scalar subqueries in WHERE re-execute per row (SubPlan in
  EXPLAIN); rewrite to a grouped join when the plan shows one.
- NOT IN with a nullable subquery column defeats anti-join planning and is
  a NULL trap; NOT EXISTS gets a Hash Anti Join.
- CTEs inline since 12; MATERIALIZED restores the fence when a CTE is
  reused expensively.
- OR across different columns blocks index use; UNION ALL branches with
  disjoint predicates can each use their own index.
- work_mem spills show as 'external merge' / 'Batches: >1' in plans.";

const SNOWFLAKE_PLAYBOOK: &str = "\
## Dialect Profile (SNOWFLAKE)
- QUALIFY is native; greatest-per-group via correlated MAX() should become
  a ranked window + QUALIFY.
- Pruning is everything: filters on clustering keys must reach the fact
  scan; hoist selective dimension filters so partition pruning fires.
- Repeated scans of the same large table rarely share work; factor them
  into a single CTE or pre-aggregation.
- The optimizer flattens many subqueries, but correlated aggregates across
  large tables still materialize per-group work; decorrelate explicitly.
- LIMIT without ORDER BY is non-deterministic across warehouses; preserve
  the original ORDER BY exactly.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_dialect_has_a_playbook() {
        for dialect in [Dialect::DuckDb, Dialect::Postgres, Dialect::Snowflake] {
            let text = playbook(dialect);
            assert!(text.starts_with("## Dialect Profile"));
            assert!(text.len() > 100);
        }
    }

    #[test]
    fn qualify_guidance_matches_the_feature_gate() {
        assert!(playbook(Dialect::Postgres).contains("No QUALIFY"));
        assert!(playbook(Dialect::Snowflake).contains("QUALIFY is native"));
    }
}
