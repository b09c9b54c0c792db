//! Single-connection, fail-fast benchmark harness.
//!
//! One call opens exactly one connection (the factory is invoked once)
//! and reuses it for the baseline, every candidate, winner confirmation
//! and EXPLAIN collection; the connection closes on every exit path when
//! the runner drops. Candidates fail fast: the first timed run is also
//! the correctness probe, and a row-count or checksum mismatch stops that
//! candidate after exactly one execution.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::candidate::{Candidate, CandidateStatus};
use crate::exec::{ExecError, ExecutorFactory, ResultSet, SqlExecutor, UNKNOWN_CHECKSUM};

/// Status thresholds of the default classification policy.
pub const WIN_THRESHOLD: f64 = 1.5;
pub const IMPROVED_THRESHOLD: f64 = 1.05;
pub const NEUTRAL_THRESHOLD: f64 = 0.95;

/// Tunables for one benchmark call.
#[derive(Clone, Debug)]
pub struct BenchmarkKnobs {
    pub baseline_runs: usize,
    pub candidate_runs: usize,
    pub winner_runs: usize,
    pub collect_explain: bool,
    /// The baseline is known to exceed the budget: skip executing it and
    /// use `timeout` as its wall time, with sentinel row/checksum values.
    pub known_timeout: bool,
    /// Per-statement budget; also the sentinel baseline time.
    pub timeout: Duration,
    /// Override for speedup -> status classification.
    pub classify: Option<fn(f64) -> CandidateStatus>,
}

impl Default for BenchmarkKnobs {
    fn default() -> Self {
        Self {
            baseline_runs: 3,
            candidate_runs: 3,
            winner_runs: 3,
            collect_explain: true,
            known_timeout: false,
            timeout: Duration::from_secs(300),
            classify: None,
        }
    }
}

/// Default policy: WIN >= 1.5, IMPROVED >= 1.05, NEUTRAL >= 0.95,
/// REGRESSION below.
pub fn classify_speedup(speedup: f64) -> CandidateStatus {
    if speedup >= WIN_THRESHOLD {
        CandidateStatus::Win
    } else if speedup >= IMPROVED_THRESHOLD {
        CandidateStatus::Improved
    } else if speedup >= NEUTRAL_THRESHOLD {
        CandidateStatus::Neutral
    } else {
        CandidateStatus::Regression
    }
}

/// Baseline measurement shared by every candidate comparison.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BaselineMeasurement {
    pub baseline_ms: f64,
    /// `None` when the baseline is a known-timeout sentinel.
    pub rows: Option<usize>,
    pub checksum: String,
}

/// Aggregate outcome of one benchmark call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub baseline_ms: f64,
    pub baseline_rows: Option<usize>,
    pub baseline_checksum: String,
    pub n_benchmarked: usize,
    pub n_passed: usize,
    pub best_speedup: f64,
    pub best_patch_idx: Option<usize>,
}

/// The open-connection benchmark session.
///
/// The streaming shape exists for the orchestrator (bench candidates as
/// workers finish, confirm the winner at the end); the batch entry point
/// [`benchmark_query_patches`] composes it.
pub struct BenchmarkRunner {
    executor: Box<dyn SqlExecutor>,
    knobs: BenchmarkKnobs,
    baseline: BaselineMeasurement,
}

impl BenchmarkRunner {
    /// Open the single connection and measure (or synthesize) the
    /// baseline.
    #[instrument(skip_all)]
    pub fn open(
        factory: &dyn ExecutorFactory,
        original_sql: &str,
        knobs: BenchmarkKnobs,
    ) -> Result<Self, ExecError> {
        let mut executor = factory.open()?;

        let baseline = if knobs.known_timeout {
            BaselineMeasurement {
                baseline_ms: knobs.timeout.as_secs_f64() * 1000.0,
                rows: None,
                checksum: UNKNOWN_CHECKSUM.to_string(),
            }
        } else {
            // Warmup run, discarded.
            executor.execute(original_sql, knobs.timeout)?;
            let (avg_ms, first_rows, _times) = timed_runs(
                executor.as_mut(),
                original_sql,
                knobs.baseline_runs,
                knobs.timeout,
            )?;
            let first = first_rows.unwrap_or_default();
            BaselineMeasurement {
                baseline_ms: avg_ms,
                rows: Some(first.row_count()),
                checksum: first.checksum(),
            }
        };

        info!(
            baseline_ms = baseline.baseline_ms,
            rows = ?baseline.rows,
            "baseline measured"
        );
        Ok(Self {
            executor,
            knobs,
            baseline,
        })
    }

    pub fn baseline(&self) -> &BaselineMeasurement {
        &self.baseline
    }

    /// Time one candidate, fail-fast on correctness.
    ///
    /// All outcomes are recorded on the candidate; infrastructure
    /// failures become `ERROR`, mismatches become `FAIL`.
    pub fn bench_candidate(&mut self, candidate: &mut Candidate) {
        if candidate.status.is_terminal_failure() {
            return;
        }
        let Some(sql) = candidate.output_sql.clone() else {
            candidate.mark_fail("No output SQL");
            return;
        };

        // First timed run doubles as the correctness probe.
        let started = Instant::now();
        let first = match self.executor.execute(&sql, self.knobs.timeout) {
            Ok(rows) => rows,
            Err(e) => {
                record_exec_error(candidate, &e);
                return;
            }
        };
        let first_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Some(baseline_rows) = self.baseline.rows {
            if first.row_count() != baseline_rows {
                candidate.mark_fail(format!(
                    "Row count mismatch: orig={} cand={}",
                    baseline_rows,
                    first.row_count()
                ));
                return;
            }
            if first.checksum() != self.baseline.checksum {
                candidate.mark_fail(format!(
                    "Checksum mismatch: orig={} cand={}",
                    self.baseline.checksum,
                    first.checksum()
                ));
                return;
            }
            candidate.correctness_verified = true;
        }

        let mut times = vec![first_ms];
        for _ in 1..self.knobs.candidate_runs {
            let started = Instant::now();
            if let Err(e) = self.executor.execute(&sql, self.knobs.timeout) {
                record_exec_error(candidate, &e);
                return;
            }
            times.push(started.elapsed().as_secs_f64() * 1000.0);
        }

        let patch_ms = trimmed_mean(&times);
        let speedup = if patch_ms > 0.0 {
            self.baseline.baseline_ms / patch_ms
        } else {
            0.0
        };
        candidate.original_ms = Some(self.baseline.baseline_ms);
        candidate.patch_ms = Some(patch_ms);
        candidate.speedup = Some(speedup);
        candidate.status = self.classify(speedup);
        debug!(patch_id = %candidate.patch_id, speedup, status = ?candidate.status, "candidate benchmarked");

        if self.knobs.collect_explain {
            match self.executor.explain(&sql) {
                Ok(plan) => candidate.explain_text = Some(plan),
                Err(e) => debug!(patch_id = %candidate.patch_id, %e, "explain collection failed"),
            }
        }
    }

    /// Re-time the single best candidate under identical conditions; the
    /// confirmed number is the reported speedup.
    pub fn confirm_winner(&mut self, candidate: &mut Candidate) {
        let Some(sql) = candidate.output_sql.clone() else {
            return;
        };
        let mut times = Vec::with_capacity(self.knobs.winner_runs);
        for _ in 0..self.knobs.winner_runs {
            let started = Instant::now();
            if let Err(e) = self.executor.execute(&sql, self.knobs.timeout) {
                record_exec_error(candidate, &e);
                return;
            }
            times.push(started.elapsed().as_secs_f64() * 1000.0);
        }
        let patch_ms = trimmed_mean(&times);
        let speedup = if patch_ms > 0.0 {
            self.baseline.baseline_ms / patch_ms
        } else {
            0.0
        };
        candidate.patch_ms = Some(patch_ms);
        candidate.speedup = Some(speedup);
        candidate.status = self.classify(speedup);
        info!(patch_id = %candidate.patch_id, speedup, "winner confirmed");
    }

    fn classify(&self, speedup: f64) -> CandidateStatus {
        match self.knobs.classify {
            Some(f) => f(speedup),
            None => classify_speedup(speedup),
        }
    }
}

/// Batch entry point: baseline, every candidate, winner confirmation —
/// over exactly one connection.
#[instrument(skip_all, fields(candidates = candidates.len()))]
pub fn benchmark_query_patches(
    candidates: &mut [Candidate],
    original_sql: &str,
    factory: &dyn ExecutorFactory,
    knobs: BenchmarkKnobs,
) -> Result<BenchmarkSummary, ExecError> {
    let mut runner = BenchmarkRunner::open(factory, original_sql, knobs)?;

    for candidate in candidates.iter_mut() {
        runner.bench_candidate(candidate);
    }

    let best_idx = best_candidate_index(candidates);
    if let Some(idx) = best_idx {
        runner.confirm_winner(&mut candidates[idx]);
    }

    let baseline = runner.baseline().clone();
    let n_passed = candidates.iter().filter(|c| c.status.is_scored()).count();
    let best_idx = best_candidate_index(candidates);
    Ok(BenchmarkSummary {
        baseline_ms: baseline.baseline_ms,
        baseline_rows: baseline.rows,
        baseline_checksum: baseline.checksum,
        n_benchmarked: candidates.len(),
        n_passed,
        best_speedup: best_idx
            .and_then(|i| candidates[i].speedup)
            .unwrap_or(0.0),
        best_patch_idx: best_idx,
    })
}

/// Highest speedup among scored candidates; ties go to shorter SQL, then
/// fewer steps, then earlier insertion.
pub fn best_candidate_index(candidates: &[Candidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if !candidate.status.is_scored() || candidate.speedup.is_none() {
            continue;
        }
        match best {
            None => best = Some(index),
            Some(current) => {
                if ranks_higher(candidate, &candidates[current]) {
                    best = Some(index);
                }
            }
        }
    }
    best
}

fn ranks_higher(challenger: &Candidate, incumbent: &Candidate) -> bool {
    let (c_speed, c_len, c_steps) = challenger.ranking_key();
    let (i_speed, i_len, i_steps) = incumbent.ranking_key();
    if c_speed != i_speed {
        return c_speed > i_speed;
    }
    if c_len != i_len {
        return c_len < i_len;
    }
    // Equal on every field keeps the incumbent (insertion order).
    c_steps < i_steps
}

fn record_exec_error(candidate: &mut Candidate, error: &ExecError) {
    match error {
        ExecError::Timeout { .. } => candidate.mark_error("timeout"),
        other => candidate.mark_error(other.to_string()),
    }
}

fn timed_runs(
    executor: &mut dyn SqlExecutor,
    sql: &str,
    runs: usize,
    timeout: Duration,
) -> Result<(f64, Option<ResultSet>, Vec<f64>), ExecError> {
    let mut times = Vec::with_capacity(runs);
    let mut first_rows = None;
    for run in 0..runs.max(1) {
        let started = Instant::now();
        let rows = executor.execute(sql, timeout)?;
        times.push(started.elapsed().as_secs_f64() * 1000.0);
        if run == 0 {
            first_rows = Some(rows);
        }
    }
    Ok((trimmed_mean(&times), first_rows, times))
}

/// Mean after dropping one min and one max when at least three samples
/// exist; plain mean otherwise.
fn trimmed_mean(times: &[f64]) -> f64 {
    if times.is_empty() {
        return 0.0;
    }
    if times.len() < 3 {
        return times.iter().sum::<f64>() / times.len() as f64;
    }
    let mut sorted = times.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let kept = &sorted[1..sorted.len() - 1];
    kept.iter().sum::<f64>() / kept.len() as f64
}
