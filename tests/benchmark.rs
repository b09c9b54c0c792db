//! Benchmark runner invariants: fail-fast correctness, the known-timeout
//! baseline, the single-connection guarantee, EXPLAIN collection, and
//! classification override.

mod common;

use std::time::Duration;

use common::{int_rows, FakeFactory};
use sqlbeam::bench::{benchmark_query_patches, BenchmarkKnobs};
use sqlbeam::candidate::{Candidate, CandidateStatus};
use sqlbeam::transforms::Family;

fn candidate(id: &str, sql: &str) -> Candidate {
    let mut c = Candidate::new(id, Family::A, "test", 1.0);
    c.output_sql = Some(sql.to_string());
    c
}

fn quick_knobs() -> BenchmarkKnobs {
    BenchmarkKnobs {
        baseline_runs: 1,
        candidate_runs: 1,
        winner_runs: 1,
        collect_explain: false,
        ..BenchmarkKnobs::default()
    }
}

#[test]
fn single_passing_candidate_gets_scored() {
    let factory = FakeFactory::new();
    let mut candidates = vec![candidate("P1", "SELECT patched")];

    let summary = benchmark_query_patches(
        &mut candidates,
        "SELECT original",
        &factory,
        quick_knobs(),
    )
    .unwrap();

    assert_eq!(summary.n_benchmarked, 1);
    assert_eq!(summary.n_passed, 1);
    assert!(summary.best_speedup > 0.0);
    assert!(candidates[0].speedup.is_some());
    assert!(candidates[0].status.is_scored());
    assert!(candidates[0].correctness_verified);
}

#[test]
fn row_count_mismatch_fails_after_exactly_one_execution() {
    let factory = FakeFactory::new();
    factory.respond("original", int_rows(3));
    factory.respond("patched", int_rows(1));

    let mut candidates = vec![candidate("P1", "SELECT patched")];
    let knobs = BenchmarkKnobs {
        baseline_runs: 1,
        candidate_runs: 3, // would be 3 runs, but must stop after 1
        winner_runs: 3,
        collect_explain: false,
        ..BenchmarkKnobs::default()
    };
    let summary =
        benchmark_query_patches(&mut candidates, "SELECT original", &factory, knobs).unwrap();

    assert_eq!(summary.n_passed, 0);
    assert_eq!(candidates[0].status, CandidateStatus::Fail);
    assert_eq!(candidates[0].speedup, Some(0.0));
    assert_eq!(
        candidates[0].apply_error.as_deref(),
        Some("Row count mismatch: orig=3 cand=1")
    );
    assert_eq!(factory.executions_matching("patched"), 1);
}

#[test]
fn checksum_mismatch_also_fails_fast() {
    use sqlbeam::exec::Value;

    let factory = FakeFactory::new();
    factory.respond("original", vec![vec![Value::Int(1), Value::Int(10)]]);
    factory.respond("patched", vec![vec![Value::Int(1), Value::Int(99)]]);

    let mut candidates = vec![candidate("P1", "SELECT patched")];
    benchmark_query_patches(&mut candidates, "SELECT original", &factory, quick_knobs()).unwrap();

    assert_eq!(candidates[0].status, CandidateStatus::Fail);
    assert!(candidates[0]
        .apply_error
        .as_deref()
        .unwrap()
        .starts_with("Checksum mismatch"));
    assert_eq!(factory.executions_matching("patched"), 1);
}

#[test]
fn known_timeout_uses_sentinel_baseline_and_skips_correctness() {
    let factory = FakeFactory::new();
    let mut candidates = vec![candidate("P1", "SELECT patched")];
    let knobs = BenchmarkKnobs {
        baseline_runs: 3,
        candidate_runs: 1,
        winner_runs: 1,
        collect_explain: false,
        known_timeout: true,
        timeout: Duration::from_secs(300),
        ..BenchmarkKnobs::default()
    };
    let summary =
        benchmark_query_patches(&mut candidates, "SELECT original", &factory, knobs).unwrap();

    assert_eq!(summary.baseline_ms, 300_000.0);
    assert_eq!(summary.baseline_rows, None);
    assert_eq!(summary.baseline_checksum, "unknown");
    // The baseline itself never executed.
    assert_eq!(factory.executions_matching("original"), 0);
    // Candidate still benchmarks and shows a massive sentinel speedup.
    assert_eq!(summary.n_passed, 1);
    assert!(candidates[0].speedup.unwrap() > 1.0);
    assert!(!candidates[0].correctness_verified);
}

#[test]
fn missing_output_sql_is_skipped_not_fatal() {
    let factory = FakeFactory::new();
    let mut candidates = vec![
        Candidate::new("P1", Family::A, "test", 1.0), // no SQL
        candidate("P2", "SELECT patched"),
    ];
    let summary =
        benchmark_query_patches(&mut candidates, "SELECT original", &factory, quick_knobs())
            .unwrap();

    assert_eq!(summary.n_benchmarked, 2);
    assert_eq!(summary.n_passed, 1);
    assert_eq!(candidates[0].status, CandidateStatus::Fail);
    assert_eq!(candidates[0].apply_error.as_deref(), Some("No output SQL"));
    assert_eq!(summary.best_patch_idx, Some(1));
}

#[test]
fn explain_is_collected_for_passing_candidates() {
    let factory = FakeFactory::new();
    let mut candidates = vec![candidate("P1", "SELECT patched")];
    let knobs = BenchmarkKnobs {
        collect_explain: true,
        baseline_runs: 1,
        candidate_runs: 1,
        winner_runs: 1,
        ..BenchmarkKnobs::default()
    };
    benchmark_query_patches(&mut candidates, "SELECT original", &factory, knobs).unwrap();

    let explain = candidates[0].explain_text.as_deref().unwrap();
    assert!(explain.contains("SEQ_SCAN"));
}

#[test]
fn exactly_one_connection_regardless_of_candidate_count() {
    let factory = FakeFactory::new();
    let mut candidates = vec![
        candidate("P1", "SELECT p1"),
        candidate("P2", "SELECT p2"),
        candidate("P3", "SELECT p3"),
    ];
    let knobs = BenchmarkKnobs {
        collect_explain: true,
        baseline_runs: 1,
        candidate_runs: 1,
        winner_runs: 1,
        ..BenchmarkKnobs::default()
    };
    benchmark_query_patches(&mut candidates, "SELECT original", &factory, knobs).unwrap();

    assert_eq!(factory.open_count(), 1);
}

#[test]
fn custom_classifier_overrides_the_default_policy() {
    fn always_win(_speedup: f64) -> CandidateStatus {
        CandidateStatus::Win
    }

    let factory = FakeFactory::new();
    let mut candidates = vec![candidate("P1", "SELECT patched")];
    let knobs = BenchmarkKnobs {
        classify: Some(always_win),
        baseline_runs: 1,
        candidate_runs: 1,
        winner_runs: 1,
        collect_explain: false,
        ..BenchmarkKnobs::default()
    };
    benchmark_query_patches(&mut candidates, "SELECT original", &factory, knobs).unwrap();

    assert_eq!(candidates[0].status, CandidateStatus::Win);
}

#[test]
fn slow_candidate_is_a_regression_and_fast_one_wins() {
    let factory = FakeFactory::new();
    factory.respond_with_delay("original", int_rows(5), Duration::from_millis(40));
    factory.respond_with_delay("slow", int_rows(5), Duration::from_millis(80));
    factory.respond_with_delay("fast", int_rows(5), Duration::from_millis(2));

    let mut candidates = vec![candidate("P1", "SELECT slow"), candidate("P2", "SELECT fast")];
    let summary =
        benchmark_query_patches(&mut candidates, "SELECT original", &factory, quick_knobs())
            .unwrap();

    assert_eq!(candidates[0].status, CandidateStatus::Regression);
    assert_eq!(candidates[1].status, CandidateStatus::Win);
    assert_eq!(summary.best_patch_idx, Some(1));
    assert!(summary.best_speedup > 1.5, "{}", summary.best_speedup);
}

#[test]
fn timeout_is_an_error_not_a_fail() {
    use sqlbeam::exec::{ExecError, ExecutorFactory, ResultSet, SqlExecutor};

    struct TimeoutAfterBaseline;
    struct TimeoutExecutor {
        calls: usize,
    }

    impl SqlExecutor for TimeoutExecutor {
        fn execute(&mut self, _sql: &str, timeout: Duration) -> Result<ResultSet, ExecError> {
            self.calls += 1;
            if self.calls > 2 {
                // baseline warmup + measured run succeed; candidates time out
                return Err(ExecError::Timeout { budget: timeout });
            }
            Ok(ResultSet {
                columns: vec!["id".into()],
                rows: vec![vec![sqlbeam::exec::Value::Int(1)]],
            })
        }

        fn explain(&mut self, _sql: &str) -> Result<String, ExecError> {
            Ok(String::new())
        }
    }

    impl ExecutorFactory for TimeoutAfterBaseline {
        fn open(&self) -> Result<Box<dyn SqlExecutor>, ExecError> {
            Ok(Box::new(TimeoutExecutor { calls: 0 }))
        }
    }

    let mut candidates = vec![candidate("P1", "SELECT patched")];
    benchmark_query_patches(
        &mut candidates,
        "SELECT original",
        &TimeoutAfterBaseline,
        quick_knobs(),
    )
    .unwrap();

    assert_eq!(candidates[0].status, CandidateStatus::Error);
    assert_eq!(candidates[0].apply_error.as_deref(), Some("timeout"));
}
