//! Candidate rewrites and their status state machine.
//!
//! A [`Candidate`] is created by the orchestrator when a worker reply is
//! applied, then threaded through validation and benchmarking; each stage
//! mutates status and timing fields. Status transitions are explicit —
//! retry scope and terminal states are visible in [`CandidateStatus`]
//! rather than hidden in error handling.

use serde::{Deserialize, Serialize};

use crate::patch::PatchPlan;
use crate::transforms::Family;

/// Lifecycle + verdict of one candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStatus {
    /// Created, not yet through the gates.
    Pending,
    /// Correct and at least neutral on time (pre-classification).
    Pass,
    /// Gate or correctness failure; terminal.
    Fail,
    /// speedup >= 1.5
    Win,
    /// speedup >= 1.05
    Improved,
    /// speedup in [0.95, 1.05)
    Neutral,
    /// speedup < 0.95, correct SQL
    Regression,
    /// Infrastructure failure (connection lost, timeout, engine panic).
    Error,
}

impl CandidateStatus {
    /// Correct-and-benchmarked states.
    pub fn is_scored(&self) -> bool {
        matches!(
            self,
            CandidateStatus::Pass
                | CandidateStatus::Win
                | CandidateStatus::Improved
                | CandidateStatus::Neutral
                | CandidateStatus::Regression
        )
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, CandidateStatus::Fail | CandidateStatus::Error)
    }
}

/// One proposed rewrite with everything learned about it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub patch_id: String,
    pub family: Family,
    pub transform: String,
    pub relevance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
    pub semantic_passed: bool,
    pub correctness_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speedup: Option<f64>,
    pub status: CandidateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_response: Option<String>,
    /// Tier-1 retries consumed (0 or 1).
    #[serde(default)]
    pub retry_count: u8,
    /// The applied plan, when the worker spoke patch mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PatchPlan>,
}

impl Candidate {
    pub fn new(
        patch_id: impl Into<String>,
        family: Family,
        transform: impl Into<String>,
        relevance_score: f64,
    ) -> Self {
        Self {
            patch_id: patch_id.into(),
            family,
            transform: transform.into(),
            relevance_score,
            output_sql: None,
            apply_error: None,
            semantic_passed: false,
            correctness_verified: false,
            speedup: None,
            status: CandidateStatus::Pending,
            explain_text: None,
            original_ms: None,
            patch_ms: None,
            worker_prompt: None,
            worker_response: None,
            retry_count: 0,
            plan: None,
        }
    }

    pub fn mark_fail(&mut self, reason: impl Into<String>) {
        self.status = CandidateStatus::Fail;
        self.apply_error = Some(reason.into());
        self.speedup = Some(0.0);
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.status = CandidateStatus::Error;
        self.apply_error = Some(reason.into());
    }

    /// Steps in the applied plan; whole-SQL rewrites count as one.
    pub fn step_count(&self) -> usize {
        self.plan.as_ref().map_or(1, |p| p.steps.len())
    }

    /// Deterministic ranking key: higher speedup first, then shorter SQL,
    /// then fewer steps. Insertion order breaks remaining ties at the
    /// call site.
    pub fn ranking_key(&self) -> (f64, usize, usize) {
        (
            self.speedup.unwrap_or(0.0),
            self.output_sql.as_ref().map_or(usize::MAX, String::len),
            self.step_count(),
        )
    }

    /// Whether this candidate's Tier-1 failure looks diagnosable enough
    /// to spend the single retry on.
    pub fn tier1_retryable(&self) -> bool {
        if self.status != CandidateStatus::Fail || self.retry_count > 0 {
            return false;
        }
        let Some(error) = self.apply_error.as_deref() else {
            return false;
        };
        let error = error.to_lowercase();
        ["tier-1", "unresolved_target", "ambiguous_anchor", "payload_parse_error", "unknown alias", "column", "patchplan"]
            .iter()
            .any(|needle| error.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_sets_zero_speedup_and_reason() {
        let mut c = Candidate::new("p01", Family::B, "decorrelate", 0.9);
        c.mark_fail("Row count mismatch: orig=3 cand=1");
        assert_eq!(c.status, CandidateStatus::Fail);
        assert_eq!(c.speedup, Some(0.0));
        assert!(c.apply_error.unwrap().contains("Row count"));
    }

    #[test]
    fn tier1_failures_are_retryable_once() {
        let mut c = Candidate::new("p01", Family::A, "early_filter", 0.5);
        c.mark_fail("Tier-1: statement S0 references unknown alias \"x\"");
        assert!(c.tier1_retryable());
        c.retry_count = 1;
        assert!(!c.tier1_retryable());
    }

    #[test]
    fn hard_errors_are_not_tier1_retryable() {
        let mut c = Candidate::new("p02", Family::A, "early_filter", 0.5);
        c.mark_error("timeout");
        assert!(!c.tier1_retryable());
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&CandidateStatus::Win).unwrap();
        assert_eq!(json, "\"WIN\"");
    }
}
