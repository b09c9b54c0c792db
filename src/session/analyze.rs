//! Session analysis: scan archived sessions for promotion candidates.
//!
//! Walks a directory of session artifact dirs, reads each `status.json`,
//! and surfaces high-speedup wins and instructive regressions for human
//! review (and eventual promotion to gold examples).

use std::fs;
use std::fmt::Write as _;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::candidate::CandidateStatus;

use super::StatusManifest;

/// Default thresholds for the scan.
pub const MIN_WIN_SPEEDUP: f64 = 2.0;
pub const MAX_REGRESSION_SPEEDUP: f64 = 0.90;

/// One optimization attempt that may qualify for promotion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromotionCandidate {
    pub query_id: String,
    pub patch_id: String,
    pub family: String,
    pub transform: String,
    pub speedup: f64,
    pub status: CandidateStatus,
    pub optimized_sql: String,
    pub original_ms: f64,
    pub patch_ms: f64,
    pub error: Option<String>,
    pub session_dir: String,
}

/// Scan result: wins sorted best-first, regressions worst-first.
#[derive(Clone, Debug, Default)]
pub struct SessionScan {
    pub wins: Vec<PromotionCandidate>,
    pub regressions: Vec<PromotionCandidate>,
    pub sessions_scanned: usize,
}

/// Walk `sessions_dir` and classify every candidate in every manifest.
pub fn analyze_sessions(
    sessions_dir: &Path,
    min_speedup: f64,
    max_regression: f64,
) -> SessionScan {
    let mut scan = SessionScan::default();
    let Ok(entries) = fs::read_dir(sessions_dir) else {
        warn!(dir = %sessions_dir.display(), "sessions directory not found");
        return scan;
    };

    let mut dirs: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        let status_path = dir.join("status.json");
        let Ok(text) = fs::read_to_string(&status_path) else {
            debug!(dir = %dir.display(), "skipping session without status.json");
            continue;
        };
        let manifest: StatusManifest = match serde_json::from_str(&text) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %status_path.display(), %e, "skipping malformed manifest");
                continue;
            }
        };
        scan.sessions_scanned += 1;

        for candidate in &manifest.result.candidates {
            let Some(speedup) = candidate.speedup else {
                continue;
            };
            let promo = PromotionCandidate {
                query_id: manifest.result.query_id.clone(),
                patch_id: candidate.patch_id.clone(),
                family: candidate.family.to_string(),
                transform: candidate.transform.clone(),
                speedup,
                status: candidate.status,
                optimized_sql: candidate.output_sql.clone().unwrap_or_default(),
                original_ms: candidate.original_ms.unwrap_or(0.0),
                patch_ms: candidate.patch_ms.unwrap_or(0.0),
                error: candidate.apply_error.clone(),
                session_dir: dir.display().to_string(),
            };

            let clean = candidate.semantic_passed && candidate.apply_error.is_none();
            if speedup >= min_speedup && clean {
                scan.wins.push(promo);
            } else if speedup < max_regression
                && candidate.status == CandidateStatus::Regression
                && clean
            {
                scan.regressions.push(promo);
            }
        }
    }

    scan.wins.sort_by(|a, b| {
        b.speedup
            .partial_cmp(&a.speedup)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scan.regressions.sort_by(|a, b| {
        a.speedup
            .partial_cmp(&b.speedup)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    info!(
        sessions = scan.sessions_scanned,
        wins = scan.wins.len(),
        regressions = scan.regressions.len(),
        "session scan complete"
    );
    scan
}

/// Keep only the most extreme candidate per `(query_id, transform)`:
/// best win, or most severe regression.
pub fn dedup_candidates(candidates: Vec<PromotionCandidate>) -> Vec<PromotionCandidate> {
    let mut best: FxHashMap<String, PromotionCandidate> = FxHashMap::default();
    for candidate in candidates {
        let key = format!("{}::{}", candidate.query_id, candidate.transform);
        match best.get(&key) {
            None => {
                best.insert(key, candidate);
            }
            Some(existing) => {
                let keep_new = if candidate.speedup >= 1.0 {
                    candidate.speedup > existing.speedup
                } else {
                    candidate.speedup < existing.speedup
                };
                if keep_new {
                    best.insert(key, candidate);
                }
            }
        }
    }
    let mut out: Vec<PromotionCandidate> = best.into_values().collect();
    out.sort_by(|a, b| {
        b.speedup
            .partial_cmp(&a.speedup)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out
}

fn speedup_stars(speedup: f64) -> &'static str {
    if speedup >= 5.0 {
        " *****"
    } else if speedup >= 3.0 {
        " ****"
    } else if speedup >= 2.0 {
        " ***"
    } else if speedup >= 1.5 {
        " **"
    } else if speedup >= 1.1 {
        " *"
    } else {
        ""
    }
}

fn regression_severity(speedup: f64) -> &'static str {
    if speedup < 0.20 {
        " !!!"
    } else if speedup < 0.50 {
        " !!"
    } else {
        " !"
    }
}

/// Human-readable scan report.
pub fn format_report(scan: &SessionScan, benchmark_name: &str) -> String {
    let mut out = String::new();
    let rule = "=".repeat(60);

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Session Analysis: {benchmark_name}");
    let _ = writeln!(out, "{rule}\n");

    let _ = writeln!(out, "WINS (>= {MIN_WIN_SPEEDUP:.1}x speedup): {}\n", scan.wins.len());
    for (i, c) in scan.wins.iter().enumerate() {
        let _ = writeln!(
            out,
            "  [{:2}] {} ({}) — {:.2}x{}",
            i + 1,
            c.query_id,
            c.patch_id,
            c.speedup,
            speedup_stars(c.speedup)
        );
        let _ = writeln!(out, "       Transform: {} (Family {})", c.transform, c.family);
        let _ = writeln!(
            out,
            "       Original: {:.1}ms -> Optimized: {:.1}ms\n",
            c.original_ms, c.patch_ms
        );
    }

    let _ = writeln!(
        out,
        "REGRESSIONS (< {MAX_REGRESSION_SPEEDUP:.2}x, correct SQL): {}\n",
        scan.regressions.len()
    );
    for (i, c) in scan.regressions.iter().enumerate() {
        let _ = writeln!(
            out,
            "  [{:2}] {} ({}) — {:.2}x{}",
            i + 1,
            c.query_id,
            c.patch_id,
            c.speedup,
            regression_severity(c.speedup)
        );
        let _ = writeln!(out, "       Transform: {} (Family {})", c.transform, c.family);
        let _ = writeln!(
            out,
            "       Original: {:.1}ms -> Optimized: {:.1}ms\n",
            c.original_ms, c.patch_ms
        );
    }

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Summary:");
    let _ = writeln!(out, "  Wins:                          {}", scan.wins.len());
    let _ = writeln!(
        out,
        "  Regressions (correct):         {}",
        scan.regressions.len()
    );
    let _ = writeln!(
        out,
        "  Total promotion candidates:    {}",
        scan.wins.len() + scan.regressions.len()
    );
    let _ = writeln!(out, "{rule}");

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promo(query: &str, transform: &str, speedup: f64) -> PromotionCandidate {
        PromotionCandidate {
            query_id: query.into(),
            patch_id: "p01".into(),
            family: "B".into(),
            transform: transform.into(),
            speedup,
            status: if speedup >= 1.0 {
                CandidateStatus::Win
            } else {
                CandidateStatus::Regression
            },
            optimized_sql: String::new(),
            original_ms: 100.0,
            patch_ms: 100.0 / speedup.max(0.01),
            error: None,
            session_dir: String::new(),
        }
    }

    #[test]
    fn dedup_keeps_best_win_and_worst_regression() {
        let out = dedup_candidates(vec![
            promo("q1", "decorrelate", 2.1),
            promo("q1", "decorrelate", 3.4),
            promo("q2", "or_to_union", 0.6),
            promo("q2", "or_to_union", 0.3),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].speedup, 3.4);
        assert_eq!(out[1].speedup, 0.3);
    }

    #[test]
    fn star_and_severity_markers() {
        assert_eq!(speedup_stars(6.0), " *****");
        assert_eq!(speedup_stars(2.2), " ***");
        assert_eq!(speedup_stars(1.0), "");
        assert_eq!(regression_severity(0.1), " !!!");
        assert_eq!(regression_severity(0.7), " !");
    }

    #[test]
    fn report_lists_wins_and_regressions() {
        let scan = SessionScan {
            wins: vec![promo("q1", "decorrelate", 3.4)],
            regressions: vec![promo("q2", "or_to_union", 0.4)],
            sessions_scanned: 2,
        };
        let report = format_report(&scan, "duckdb_tpcds");
        assert!(report.contains("Session Analysis: duckdb_tpcds"));
        assert!(report.contains("q1 (p01) — 3.40x ****"));
        assert!(report.contains("q2 (p01) — 0.40x !!"));
    }
}
