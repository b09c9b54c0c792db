//! The gate: score catalog transforms against a query's features and
//! filter by dialect capability.

use rustc_hash::FxHashSet;

use crate::dialect::{Dialect, EngineVersion};

use super::{QueryFeature, Transform, CATALOG};

/// Minimum feature-overlap score for a transform to surface at all.
pub const MIN_OVERLAP: f64 = 0.4;

/// One catalog entry that survived the gate.
#[derive(Clone, Debug)]
pub struct GatedTransform {
    pub transform: &'static Transform,
    /// `|required ∩ query| / |required|`.
    pub score: f64,
    /// Matched on features but needs an engine capability this dialect
    /// lacks; surfaced so prompts can offer it as a portability rewrite.
    pub portability_candidate: bool,
}

/// Return the transforms applicable to a query, sorted by score
/// descending (ties by catalog id for determinism).
pub fn applicable_transforms(
    query_features: &FxHashSet<QueryFeature>,
    dialect: Dialect,
    version: Option<&EngineVersion>,
) -> Vec<GatedTransform> {
    let mut gated: Vec<GatedTransform> = CATALOG
        .iter()
        .filter_map(|transform| {
            let score = overlap_score(transform, query_features);
            if score < MIN_OVERLAP {
                return None;
            }
            let portability_candidate = match transform.requires_engine_feature {
                Some(feature) => !dialect.supports(feature, version),
                None => false,
            };
            Some(GatedTransform {
                transform,
                score,
                portability_candidate,
            })
        })
        .collect();

    gated.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.transform.id.cmp(b.transform.id))
    });
    gated
}

fn overlap_score(transform: &Transform, query_features: &FxHashSet<QueryFeature>) -> f64 {
    if transform.required_features.is_empty() {
        return 0.0;
    }
    let matched = transform
        .required_features
        .iter()
        .filter(|f| query_features.contains(f))
        .count();
    matched as f64 / transform.required_features.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(features: &[QueryFeature]) -> FxHashSet<QueryFeature> {
        features.iter().copied().collect()
    }

    #[test]
    fn full_overlap_scores_one() {
        let features = set(&[QueryFeature::HasNotIn]);
        let gated = applicable_transforms(&features, Dialect::Postgres, None);
        let not_in = gated
            .iter()
            .find(|g| g.transform.id == "not_in_to_not_exists")
            .unwrap();
        assert_eq!(not_in.score, 1.0);
    }

    #[test]
    fn below_threshold_is_dropped() {
        // pre_aggregate needs both HasGroupBy and RepeatsFactScan; with
        // neither present it must not surface.
        let features = set(&[QueryFeature::HasNotIn]);
        let gated = applicable_transforms(&features, Dialect::Postgres, None);
        assert!(gated.iter().all(|g| g.transform.id != "pre_aggregate"));
    }

    #[test]
    fn half_overlap_passes_threshold() {
        let features = set(&[QueryFeature::HasGroupBy]);
        let gated = applicable_transforms(&features, Dialect::Postgres, None);
        let pre_agg = gated
            .iter()
            .find(|g| g.transform.id == "pre_aggregate")
            .unwrap();
        assert_eq!(pre_agg.score, 0.5);
    }

    #[test]
    fn qualify_is_portability_candidate_on_postgres() {
        let features = set(&[QueryFeature::HasCorrelatedSubquery]);
        let gated = applicable_transforms(&features, Dialect::Postgres, None);
        let qualify = gated
            .iter()
            .find(|g| g.transform.id == "subquery_to_qualify")
            .unwrap();
        assert!(qualify.portability_candidate);

        let gated_sf = applicable_transforms(&features, Dialect::Snowflake, None);
        let qualify_sf = gated_sf
            .iter()
            .find(|g| g.transform.id == "subquery_to_qualify")
            .unwrap();
        assert!(!qualify_sf.portability_candidate);
    }

    #[test]
    fn old_duckdb_drops_qualify_to_portability() {
        let features = set(&[QueryFeature::HasCorrelatedSubquery]);
        let old = EngineVersion::parse("0.8.0").unwrap();
        let gated = applicable_transforms(&features, Dialect::DuckDb, Some(&old));
        let qualify = gated
            .iter()
            .find(|g| g.transform.id == "subquery_to_qualify")
            .unwrap();
        assert!(qualify.portability_candidate);
    }

    #[test]
    fn results_sorted_by_score_then_id() {
        let features = set(&[
            QueryFeature::HasGroupBy,
            QueryFeature::RepeatsFactScan,
            QueryFeature::HasWhereFilter,
        ]);
        let gated = applicable_transforms(&features, Dialect::DuckDb, None);
        for pair in gated.windows(2) {
            assert!(pair[0].score >= pair[1].score);
            if pair[0].score == pair[1].score {
                assert!(pair[0].transform.id < pair[1].transform.id);
            }
        }
    }
}
