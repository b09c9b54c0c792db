//! Workload router: importance stars and per-query mode assignment.
//!
//! Stars follow the 80/10/10 workload split: queries covering the first
//! 80% of total baseline time get 3 stars, the next 10% get 2, the tail
//! gets 1. Three-star queries earn the focused (strong-model) lane when
//! it is available.

use rustc_hash::FxHashMap;

use super::BeamMode;

/// Assign 3/2/1 importance stars from per-query baseline milliseconds.
pub fn assign_importance_stars(baselines: &FxHashMap<String, f64>) -> FxHashMap<String, u8> {
    let total: f64 = baselines.values().sum();
    let mut stars = FxHashMap::default();
    if total <= 0.0 {
        for query_id in baselines.keys() {
            stars.insert(query_id.clone(), 1);
        }
        return stars;
    }

    let mut ordered: Vec<(&String, f64)> = baselines.iter().map(|(k, v)| (k, *v)).collect();
    ordered.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    let mut cumulative = 0.0;
    for (query_id, ms) in ordered {
        let share_before = cumulative / total;
        let star = if share_before < 0.80 {
            3
        } else if share_before < 0.90 {
            2
        } else {
            1
        };
        stars.insert(query_id.clone(), star);
        cumulative += ms;
    }
    stars
}

/// Pick the beam mode for one query from its stars.
///
/// Focused demands the reasoning lane; without it the router falls back
/// to wide silently.
pub fn route_mode(importance_stars: u8, reasoning_enabled: bool) -> BeamMode {
    if importance_stars >= 3 && reasoning_enabled {
        BeamMode::Focused
    } else {
        BeamMode::Wide
    }
}
