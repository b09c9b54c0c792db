//! The beam orchestrator: analyst → parallel workers → gates → benchmark
//! → optional sniper, over one query.
//!
//! Concurrency model: LLM calls run on a bounded pool (semaphore permits
//! over a `JoinSet`); validation and benchmarking run on the orchestrator
//! thread, which holds the single benchmark connection for the whole
//! session. Workers are cancellable via a watch token after an
//! early-stop win; a benchmark in flight always completes.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::bench::{best_candidate_index, BenchmarkRunner};
use crate::candidate::Candidate;
use crate::exec::ExecutorFactory;
use crate::gold::{GoldExample, GoldStore};
use crate::ir::{build_script_ir, render_ir_node_map, ScriptIr};
use crate::llm::{LlmClient, LlmError};
use crate::patch::{apply_patch_plan, parse_worker_response};
use crate::prompts::{
    build_analyst_prompt, build_sniper_prompt, build_worker_prompt, build_worker_retry_prompt,
    parse_analyst_response, AnalystMode, AnalystReply, ProbeSpec, PromptInputs, ScoutResult,
    StrikeRow,
};
use crate::transforms::{applicable_transforms, extract_features, transform_by_id, GatedTransform};
use crate::validate::GateOutcome;

use super::{
    BeamMode, ExplainInput, SessionArtifacts, SessionConfig, SessionError, SessionResult,
};

/// One run of the orchestrator over a single query.
pub struct BeamSession {
    config: SessionConfig,
    llm: Arc<dyn LlmClient>,
    dataset_factory: Arc<dyn ExecutorFactory>,
    scratch_factory: Option<Arc<dyn ExecutorFactory>>,
    gold: GoldStore,
}

/// Everything the prompt builders borrow for one query.
struct QueryContext {
    query_id: String,
    original_sql: String,
    explain_text: String,
    node_map: String,
    transforms: Vec<GatedTransform>,
}

struct WorkerOut {
    index: usize,
    prompt: String,
    response: Result<String, LlmError>,
}

impl BeamSession {
    pub fn new(
        config: SessionConfig,
        llm: Arc<dyn LlmClient>,
        dataset_factory: Arc<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            config,
            llm,
            dataset_factory,
            scratch_factory: None,
            gold: GoldStore::default(),
        }
    }

    /// Scratch database used by the Tier-2 synthetic gate.
    #[must_use]
    pub fn with_scratch_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.scratch_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn with_gold_store(mut self, gold: GoldStore) -> Self {
        self.gold = gold;
        self
    }

    /// Run the full state machine. Synchronous: owns its runtime.
    #[instrument(skip_all, fields(query_id))]
    pub fn run(
        &self,
        query_id: &str,
        sql: &str,
        explain: &ExplainInput,
    ) -> Result<SessionResult, SessionError> {
        self.config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_parallelism.clamp(2, 8))
            .enable_time()
            .build()
            .map_err(|e| SessionError::Runtime {
                message: e.to_string(),
            })?;
        runtime.block_on(self.run_inner(query_id, sql, explain, None))
    }

    /// Single-worker variant: drive one named transform end to end with
    /// exactly one LLM call (no analyst, no sniper).
    pub fn run_editor_strike(
        &self,
        query_id: &str,
        sql: &str,
        explain: &ExplainInput,
        transform_id: &str,
    ) -> Result<SessionResult, SessionError> {
        self.config.validate()?;
        let probe = ProbeSpec {
            probe_id: "strike_01".into(),
            transform_id: transform_id.to_string(),
            family: transform_by_id(transform_id)
                .map(|t| t.family)
                .unwrap_or(crate::transforms::Family::A),
            target: format!("transform_id: {transform_id} applied to the whole query"),
            confidence: 1.0,
            expected_explain_delta: None,
            recommended_patch_ops: Vec::new(),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .map_err(|e| SessionError::Runtime {
                message: e.to_string(),
            })?;
        runtime.block_on(self.run_inner(query_id, sql, explain, Some(vec![probe])))
    }

    async fn run_inner(
        &self,
        query_id: &str,
        sql: &str,
        explain: &ExplainInput,
        fixed_probes: Option<Vec<ProbeSpec>>,
    ) -> Result<SessionResult, SessionError> {
        let ir = build_script_ir(sql, self.config.dialect)?;
        let engine_version = self
            .config
            .engine_version
            .as_deref()
            .and_then(crate::dialect::EngineVersion::parse);

        let features = extract_features(&ir);
        let cx = QueryContext {
            query_id: query_id.to_string(),
            original_sql: sql.to_string(),
            explain_text: explain.plan_text.clone(),
            node_map: render_ir_node_map(&ir),
            transforms: applicable_transforms(
                &features,
                self.config.dialect,
                engine_version.as_ref(),
            ),
        };

        // Baseline first: an unreachable database is a fatal error before
        // any LLM spend.
        let mut runner = BenchmarkRunner::open(
            self.dataset_factory.as_ref(),
            sql,
            self.config.knobs.clone(),
        )?;

        let strike_mode = fixed_probes.is_some();
        let (scout, probes) = match fixed_probes {
            Some(probes) => (ScoutResult::default(), probes),
            None => match self.analyst_phase(&cx).await {
                Some(pair) => pair,
                None => {
                    // Session abort: record the baseline, keep the
                    // original SQL as the answer.
                    warn!(query_id, "analyst produced no usable dispatch; aborting session");
                    let mut result = SessionResult::aborted(query_id);
                    result.baseline_ms = runner.baseline().baseline_ms;
                    result.baseline_rows = runner.baseline().rows;
                    result.baseline_checksum = runner.baseline().checksum.clone();
                    return Ok(result);
                }
            },
        };

        info!(query_id, probes = probes.len(), "dispatching workers");
        let mut candidates = self
            .worker_phase(&cx, &ir, &scout, &probes, &mut runner)
            .await;

        if self.config.sniper_enabled && !strike_mode {
            self.sniper_phase(&cx, &ir, &scout, &mut candidates, &mut runner)
                .await;
        }

        if let Some(best) = best_candidate_index(&candidates) {
            runner.confirm_winner(&mut candidates[best]);
        }

        let best = best_candidate_index(&candidates);
        let result = SessionResult {
            query_id: query_id.to_string(),
            baseline_ms: runner.baseline().baseline_ms,
            baseline_rows: runner.baseline().rows,
            baseline_checksum: runner.baseline().checksum.clone(),
            best_speedup: best
                .and_then(|i| candidates[i].speedup)
                .unwrap_or(1.0),
            best_patch_idx: best,
            candidates,
        };

        if let Some(root) = &self.config.artifacts_dir {
            match SessionArtifacts::create(root, query_id) {
                Ok(artifacts) => artifacts.write_session(sql, &result, self.config.dialect),
                Err(e) => warn!(query_id, %e, "failed to create session artifact dir"),
            }
        }

        Ok(result)
    }

    /// ANALYST: one LLM call, parsed into probes. `None` aborts the
    /// session (recorded, not raised).
    async fn analyst_phase(&self, cx: &QueryContext) -> Option<(ScoutResult, Vec<ProbeSpec>)> {
        let mode = match self.config.effective_mode() {
            BeamMode::Focused => AnalystMode::Focused,
            BeamMode::Wide => AnalystMode::Wide,
            BeamMode::Reasoning => {
                // Single-shot: no analyst, one whole-rewrite probe.
                let probe = ProbeSpec {
                    probe_id: "r01".into(),
                    transform_id: "whole_query_rewrite".into(),
                    family: crate::transforms::Family::A,
                    target: "rewrite the whole query".into(),
                    confidence: 1.0,
                    expected_explain_delta: None,
                    recommended_patch_ops: Vec::new(),
                };
                return Some((ScoutResult::default(), vec![probe]));
            }
        };

        let gold = self.gold_for_tags(&[]);
        let inputs = self.prompt_inputs(cx, &gold);
        let prompt = build_analyst_prompt(&inputs, mode);
        let response = match self.llm.analyze(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%e, "analyst call failed");
                return None;
            }
        };

        match parse_analyst_response(&response, mode) {
            Ok(AnalystReply::Wide(scout)) => {
                let probes = scout.probes.clone();
                Some((scout, probes))
            }
            Ok(AnalystReply::Focused(targets)) => {
                let scout = ScoutResult {
                    hypothesis: targets
                        .iter()
                        .map(|t| t.hypothesis.clone())
                        .filter(|h| !h.is_empty())
                        .collect::<Vec<_>>()
                        .join(" / "),
                    ..ScoutResult::default()
                };
                let probes = targets
                    .into_iter()
                    .map(|t| ProbeSpec {
                        probe_id: t.target_id,
                        transform_id: t.transform_id,
                        family: t.family,
                        target: t.target,
                        confidence: t.confidence,
                        expected_explain_delta: None,
                        recommended_patch_ops: Vec::new(),
                    })
                    .collect();
                Some((scout, probes))
            }
            Err(e) => {
                warn!(%e, "analyst response unusable");
                None
            }
        }
    }

    /// WORKERS: parallel LLM calls; each completion flows through
    /// apply → retry-once → semantic gates → benchmark, in completion
    /// order. A confirmed early-stop win cancels outstanding workers.
    async fn worker_phase(
        &self,
        cx: &QueryContext,
        ir: &ScriptIr,
        scout: &ScoutResult,
        probes: &[ProbeSpec],
        runner: &mut BenchmarkRunner,
    ) -> Vec<Candidate> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_parallelism));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut join_set: JoinSet<Option<WorkerOut>> = JoinSet::new();

        for (index, probe) in probes.iter().enumerate() {
            let gold = self.gold_for_tags(&probe_tags(probe));
            let inputs = self.prompt_inputs(cx, &gold);
            let prompt = build_worker_prompt(&inputs, scout, probe, self.config.patch_mode);
            let llm = Arc::clone(&self.llm);
            let semaphore = Arc::clone(&semaphore);
            let mut cancel = cancel_rx.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                if *cancel.borrow_and_update() {
                    return None;
                }
                let response = tokio::select! {
                    r = llm.analyze(&prompt) => r,
                    _ = cancel.changed() => return None,
                };
                Some(WorkerOut {
                    index,
                    prompt,
                    response,
                })
            });
        }

        let mut indexed: Vec<(usize, Candidate)> = Vec::with_capacity(probes.len());
        let mut stopped_early = false;

        while let Some(joined) = join_set.join_next().await {
            let out = match joined {
                Ok(Some(out)) => out,
                Ok(None) => continue,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    warn!(%e, "worker task panicked");
                    continue;
                }
            };
            let probe = &probes[out.index];

            let mut candidate = match out.response {
                Ok(response) => {
                    let mut c = self.candidate_from_reply(probe, ir, cx, &response);
                    c.worker_prompt = Some(out.prompt.clone());
                    c
                }
                Err(e) => {
                    let mut c = probe_candidate(probe);
                    c.mark_error(format!("worker call failed: {e}"));
                    c
                }
            };

            if self.config.retry_tier1 && candidate.tier1_retryable() {
                self.retry_tier1(&mut candidate, probe, ir, cx, &out.prompt)
                    .await;
            }

            self.gate_and_bench(&mut candidate, ir, cx, runner);

            if !stopped_early {
                if let Some(threshold) = self.config.early_stop_speedup {
                    if candidate.speedup.unwrap_or(0.0) >= threshold {
                        info!(
                            patch_id = %candidate.patch_id,
                            speedup = candidate.speedup,
                            "early stop: cancelling outstanding workers"
                        );
                        let _ = cancel_tx.send(true);
                        join_set.abort_all();
                        stopped_early = true;
                    }
                }
            }

            indexed.push((out.index, candidate));
        }

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, c)| c).collect()
    }

    /// SNIPER: one call over the strike table; compound plans join the
    /// candidate pool like any worker output.
    async fn sniper_phase(
        &self,
        cx: &QueryContext,
        ir: &ScriptIr,
        scout: &ScoutResult,
        candidates: &mut Vec<Candidate>,
        runner: &mut BenchmarkRunner,
    ) {
        if !candidates.iter().any(|c| c.status.is_scored()) {
            return;
        }
        let strikes: Vec<StrikeRow> = candidates.iter().map(StrikeRow::from_candidate).collect();
        let gold = self.gold_for_tags(&[]);
        let inputs = self.prompt_inputs(cx, &gold);
        let prompt = build_sniper_prompt(&inputs, scout, &strikes);

        let response = match self.llm.analyze(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%e, "sniper call failed; keeping worker results");
                return;
            }
        };

        let reply = match parse_worker_response(&response) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%e, "sniper response unusable");
                return;
            }
        };

        let best_family = best_candidate_index(candidates)
            .map(|i| candidates[i].family)
            .unwrap_or(crate::transforms::Family::A);

        for (n, plan) in reply.plans.into_iter().take(2).enumerate() {
            let mut candidate = Candidate::new(
                format!("sniper_{:02}", n + 1),
                best_family,
                "sniper_compound",
                1.0,
            );
            candidate.worker_prompt = Some(prompt.clone());
            candidate.worker_response = Some(response.clone());
            let result = apply_patch_plan(ir, &plan);
            if result.success {
                candidate.output_sql = result.output_sql;
                candidate.plan = Some(plan);
            } else {
                candidate.mark_fail(
                    result
                        .error_summary()
                        .unwrap_or_else(|| "patch application failed".into()),
                );
            }
            self.gate_and_bench(&mut candidate, ir, cx, runner);
            candidates.push(candidate);
        }
    }

    /// Apply one worker reply: first plan that applies cleanly wins;
    /// whole-SQL replies go straight to the structural gate.
    fn candidate_from_reply(
        &self,
        probe: &ProbeSpec,
        ir: &ScriptIr,
        cx: &QueryContext,
        response: &str,
    ) -> Candidate {
        let mut candidate = probe_candidate(probe);
        candidate.worker_response = Some(response.to_string());

        let reply = match parse_worker_response(response) {
            Ok(reply) => reply,
            Err(e) => {
                candidate.mark_fail(format!("Failed to parse PatchPlan: {e}"));
                return candidate;
            }
        };

        if let Some(whole_sql) = reply.whole_sql {
            let report = crate::validate::tier1_structural(
                ir,
                &whole_sql,
                self.config.dialect,
                false,
            );
            if report.passed {
                candidate.output_sql = Some(whole_sql);
            } else {
                candidate.mark_fail(report.summary());
            }
            return candidate;
        }

        let mut last_error = String::from("reply contained no plans");
        for plan in &reply.plans {
            let result = apply_patch_plan(ir, plan);
            if result.success {
                candidate.output_sql = result.output_sql;
                candidate.plan = Some(plan.clone());
                debug!(
                    patch_id = %candidate.patch_id,
                    plan_id = %plan.plan_id,
                    query_id = %cx.query_id,
                    "plan applied"
                );
                return candidate;
            }
            last_error = result
                .error_summary()
                .unwrap_or_else(|| "patch application failed".into());
        }
        candidate.mark_fail(last_error);
        candidate
    }

    /// One retry for diagnosable Tier-1 failures, embedding the error,
    /// the rejected SQL, and the previous response.
    async fn retry_tier1(
        &self,
        candidate: &mut Candidate,
        probe: &ProbeSpec,
        ir: &ScriptIr,
        cx: &QueryContext,
        base_prompt: &str,
    ) {
        let error_text = candidate
            .apply_error
            .clone()
            .unwrap_or_else(|| "validation failed".into());
        let previous = candidate.worker_response.clone().unwrap_or_default();
        let retry_prompt = build_worker_retry_prompt(
            base_prompt,
            &error_text,
            candidate.output_sql.as_deref(),
            &previous,
        );

        let response = match self.llm.analyze(&retry_prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(patch_id = %candidate.patch_id, %e, "tier-1 retry call failed");
                candidate.retry_count = 1;
                return;
            }
        };

        let mut retried = self.candidate_from_reply(probe, ir, cx, &response);
        retried.retry_count = 1;
        retried.worker_prompt = Some(retry_prompt);
        debug!(patch_id = %retried.patch_id, ok = retried.output_sql.is_some(), "tier-1 retry applied");
        *candidate = retried;
    }

    /// Semantic gates then benchmark, mutating the candidate in place.
    fn gate_and_bench(
        &self,
        candidate: &mut Candidate,
        ir: &ScriptIr,
        cx: &QueryContext,
        runner: &mut BenchmarkRunner,
    ) {
        if candidate.status.is_terminal_failure() || candidate.output_sql.is_none() {
            return;
        }
        let output_sql = candidate.output_sql.clone().unwrap_or_default();

        let outcome = self.config.validator.validate_semantics(
            self.scratch_factory.as_deref(),
            self.dataset_factory.as_ref(),
            ir,
            &cx.original_sql,
            &output_sql,
        );
        match outcome {
            GateOutcome::Pass => candidate.semantic_passed = true,
            GateOutcome::Fail { reason, .. } => {
                candidate.mark_fail(reason);
                return;
            }
            GateOutcome::Unavailable { reason } => {
                candidate.semantic_passed = false;
                candidate.mark_error(reason);
                return;
            }
        }

        runner.bench_candidate(candidate);
    }

    fn gold_for_tags(&self, tags: &[&str]) -> Vec<&GoldExample> {
        self.gold
            .find(tags, self.config.dialect, self.config.gold_examples_per_prompt)
    }

    fn prompt_inputs<'a>(
        &'a self,
        cx: &'a QueryContext,
        gold: &'a [&'a GoldExample],
    ) -> PromptInputs<'a> {
        PromptInputs {
            query_id: &cx.query_id,
            original_sql: &cx.original_sql,
            explain_text: &cx.explain_text,
            ir_node_map: &cx.node_map,
            dialect: self.config.dialect,
            engine_version: self.config.engine_version.as_deref(),
            schema_context: &self.config.schema_context,
            engine_knowledge: if self.config.engine_knowledge.is_empty() {
                crate::knowledge::playbook(self.config.dialect)
            } else {
                &self.config.engine_knowledge
            },
            importance_stars: self.config.importance_stars,
            equivalence_tier: match self.config.validator.compare_mode {
                crate::validate::CompareMode::Ordered => crate::prompts::EquivalenceTier::Ordered,
                crate::validate::CompareMode::Unordered => {
                    crate::prompts::EquivalenceTier::Unordered
                }
            },
            do_not_do: &self.config.do_not_do,
            transforms: &cx.transforms,
            gold_examples: gold,
        }
    }
}

fn probe_candidate(probe: &ProbeSpec) -> Candidate {
    Candidate::new(
        probe.probe_id.clone(),
        probe.family,
        probe.transform_id.clone(),
        probe.confidence,
    )
}

fn probe_tags(probe: &ProbeSpec) -> Vec<&str> {
    transform_by_id(&probe.transform_id)
        .map(|t| t.tags.to_vec())
        .unwrap_or_default()
}

/// Failed candidates worth resurfacing to the sniper: gate failures and
/// hard errors, but not slow-yet-valid rewrites.
pub fn is_sniper_retry_error_candidate(candidate: &Candidate) -> bool {
    use crate::candidate::CandidateStatus;
    match candidate.status {
        CandidateStatus::Error => true,
        CandidateStatus::Fail => candidate.apply_error.as_deref().is_some_and(|e| {
            let e = e.to_lowercase();
            e.contains("tier-1") || e.contains("parse") || e.contains("patchplan")
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateStatus;
    use crate::transforms::Family;

    #[test]
    fn sniper_retry_detection_matches_failure_classes() {
        let mut tier1_fail = Candidate::new("p1", Family::A, "x", 0.5);
        tier1_fail.mark_fail("Tier-1: syntax error near FROM");

        let mut parse_fail = Candidate::new("p2", Family::A, "x", 0.5);
        parse_fail.mark_fail("Failed to parse PatchPlan: missing key");

        let mut hard_error = Candidate::new("p3", Family::A, "x", 0.5);
        hard_error.mark_error("Execution timeout");

        let mut slow_but_valid = Candidate::new("p4", Family::A, "x", 0.5);
        slow_but_valid.status = CandidateStatus::Neutral;
        slow_but_valid.speedup = Some(0.98);
        slow_but_valid.output_sql = Some("SELECT 1".into());

        assert!(is_sniper_retry_error_candidate(&tier1_fail));
        assert!(is_sniper_retry_error_candidate(&parse_fail));
        assert!(is_sniper_retry_error_candidate(&hard_error));
        assert!(!is_sniper_retry_error_candidate(&slow_but_valid));
    }
}
