//! Layered correctness gates for candidate rewrites.
//!
//! Three tiers, each blocking the next:
//! Tier-1 structural (no database), Tier-2 synthetic (small generated
//! sample), Tier-3 full dataset (authoritative). A candidate whose SQL
//! executes but returns non-equivalent data FAILs; a candidate whose
//! gates cannot run at all (executor unavailable) is an ERROR and never
//! reaches the benchmark.

pub mod equivalence;
pub mod structural;
pub mod synthetic;

pub use equivalence::{
    compare_result_sets, values_equal, CompareMode, EquivalenceReport, ABS_EPSILON, REL_EPSILON,
};
pub use structural::{tier1_structural, StructuralIssue, StructuralIssueKind, StructuralReport};
pub use synthetic::{generate_dataset, SyntheticDataset, SyntheticTable, SyntheticValidator};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exec::ExecutorFactory;
use crate::ir::ScriptIr;

/// The three gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Structural,
    Synthetic,
    FullDataset,
}

/// Verdict of the semantic (Tier-2 + Tier-3) stage.
#[derive(Clone, Debug)]
pub enum GateOutcome {
    Pass,
    /// The candidate executed but is not equivalent. Terminal.
    Fail { tier: Tier, reason: String },
    /// The gate itself could not run (connection lost, fixture failed).
    /// The candidate is an ERROR and must not be benchmarked.
    Unavailable { reason: String },
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, GateOutcome::Pass)
    }
}

/// Semantic validator configuration for one session.
#[derive(Clone, Debug)]
pub struct Validator {
    pub compare_mode: CompareMode,
    /// Tier-2 runner; `None` disables the synthetic gate.
    pub synthetic: Option<SyntheticValidator>,
    /// Tier-3 toggle; disabled deployments lean on the benchmark
    /// fail-fast checks instead.
    pub full_dataset: bool,
    pub query_timeout: Duration,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            compare_mode: CompareMode::Unordered,
            synthetic: Some(SyntheticValidator::default()),
            full_dataset: true,
            query_timeout: Duration::from_secs(300),
        }
    }
}

impl Validator {
    /// Run Tier-2 then Tier-3. Tier-1 is assumed to have already passed
    /// (the patch engine runs it as part of plan application).
    pub fn validate_semantics(
        &self,
        scratch_factory: Option<&dyn ExecutorFactory>,
        dataset_factory: &dyn ExecutorFactory,
        ir: &ScriptIr,
        baseline_sql: &str,
        candidate_sql: &str,
    ) -> GateOutcome {
        if let (Some(synthetic), Some(factory)) = (&self.synthetic, scratch_factory) {
            match synthetic.validate_pair(
                factory,
                ir,
                baseline_sql,
                candidate_sql,
                self.compare_mode,
            ) {
                Ok(report) if report.matched => {}
                Ok(report) => {
                    return GateOutcome::Fail {
                        tier: Tier::Synthetic,
                        reason: format!(
                            "Synthetic semantic mismatch: {}",
                            report.reason.unwrap_or_else(|| "rows diverge".into())
                        ),
                    };
                }
                Err(e) => {
                    return GateOutcome::Unavailable {
                        reason: format!("Equivalence check unavailable: {e}"),
                    };
                }
            }
        }

        if !self.full_dataset {
            return GateOutcome::Pass;
        }

        let mut executor = match dataset_factory.open() {
            Ok(executor) => executor,
            Err(e) => {
                return GateOutcome::Unavailable {
                    reason: format!("Equivalence check unavailable: {e}"),
                };
            }
        };
        let baseline = match executor.execute(baseline_sql, self.query_timeout) {
            Ok(rows) => rows,
            Err(e) => {
                return GateOutcome::Unavailable {
                    reason: format!("Equivalence check unavailable: baseline failed: {e}"),
                };
            }
        };
        let candidate = match executor.execute(candidate_sql, self.query_timeout) {
            Ok(rows) => rows,
            Err(e) => {
                // The candidate's own SQL failing on the real engine is a
                // verdict, not an outage.
                return GateOutcome::Fail {
                    tier: Tier::FullDataset,
                    reason: format!("candidate execution failed: {e}"),
                };
            }
        };

        let report = compare_result_sets(&baseline, &candidate, self.compare_mode);
        debug!(matched = report.matched, "full-dataset gate");
        if report.matched {
            GateOutcome::Pass
        } else {
            GateOutcome::Fail {
                tier: Tier::FullDataset,
                reason: report
                    .reason
                    .unwrap_or_else(|| "result sets diverge".into()),
            }
        }
    }
}
