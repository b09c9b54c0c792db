//! Per-session file artifacts and batch reporting.
//!
//! Every session gets its own directory under the configured root:
//! original/optimized SQL per candidate, prompts, raw responses, EXPLAIN
//! text, and a `status.json` manifest with a one-line failure summary per
//! candidate. Filenames carry `(phase, patch_id, attempt)` so appends
//! never collide across retries.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::dialect::Dialect;

use super::SessionResult;

/// The `status.json` document: session result plus run metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusManifest {
    pub query_id: String,
    pub dialect: Dialect,
    pub created_at: String,
    /// One line per candidate: `patch_id status speedup error?`.
    pub candidate_summaries: Vec<String>,
    pub result: SessionResult,
}

impl StatusManifest {
    pub fn from_result(result: &SessionResult, dialect: Dialect) -> Self {
        let candidate_summaries = result
            .candidates
            .iter()
            .map(|c| {
                let speedup = c
                    .speedup
                    .map_or_else(|| "-".to_string(), |s| format!("{s:.2}x"));
                match &c.apply_error {
                    Some(error) => format!("{} {:?} {} — {}", c.patch_id, c.status, speedup, error),
                    None => format!("{} {:?} {}", c.patch_id, c.status, speedup),
                }
            })
            .collect();
        Self {
            query_id: result.query_id.clone(),
            dialect,
            created_at: Utc::now().to_rfc3339(),
            candidate_summaries,
            result: result.clone(),
        }
    }
}

/// Writer for one session's artifact directory.
pub struct SessionArtifacts {
    dir: PathBuf,
}

impl SessionArtifacts {
    /// Create `root/<query_id>_<timestamp>_<run id>/`. The run-id suffix
    /// keeps two sessions for the same query in the same second apart.
    pub fn create(root: &Path, query_id: &str) -> io::Result<Self> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let run_id = Uuid::new_v4().simple().to_string();
        let dir = root.join(format!("{query_id}_{stamp}_{}", &run_id[..8]));
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Open an existing session directory (for the promotion scanner).
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write everything a finished session leaves behind. IO failures
    /// are logged, never raised: artifacts must not sink a session.
    pub fn write_session(&self, original_sql: &str, result: &SessionResult, dialect: Dialect) {
        self.write("original.sql", original_sql);
        for candidate in &result.candidates {
            let id = &candidate.patch_id;
            let attempt = candidate.retry_count;
            if let Some(sql) = &candidate.output_sql {
                self.write(&format!("{id}_optimized.sql"), sql);
            }
            if let Some(prompt) = &candidate.worker_prompt {
                self.write(&format!("worker_{id}_a{attempt}_prompt.txt"), prompt);
            }
            if let Some(response) = &candidate.worker_response {
                self.write(&format!("worker_{id}_a{attempt}_response.txt"), response);
            }
            if let Some(explain) = &candidate.explain_text {
                self.write(&format!("{id}_explain.txt"), explain);
            }
        }

        let manifest = StatusManifest::from_result(result, dialect);
        match serde_json::to_string_pretty(&manifest) {
            Ok(json) => self.write("status.json", &json),
            Err(e) => warn!(%e, "failed to serialize status manifest"),
        }
    }

    /// Append-only single-file write; phase/patch/attempt live in the
    /// name, so no cross-process locking is needed.
    pub fn write_phase_text(&self, phase: &str, patch_id: &str, attempt: u8, kind: &str, text: &str) {
        self.write(&format!("{phase}_{patch_id}_a{attempt}_{kind}.txt"), text);
    }

    fn write(&self, name: &str, contents: &str) {
        let path = self.dir.join(name);
        if let Err(e) = fs::write(&path, contents) {
            warn!(path = %path.display(), %e, "failed to write session artifact");
        }
    }
}

/// Write the per-batch benchmark summary CSV.
pub fn write_benchmark_csv(path: &Path, results: &[SessionResult]) -> io::Result<()> {
    let mut out = String::from(
        "query_id,baseline_ms,best_speedup,best_patch,candidates,passed,failed,errored\n",
    );
    for result in results {
        let best_patch = result
            .best_patch_idx
            .and_then(|i| result.candidates.get(i))
            .map_or("", |c| c.patch_id.as_str());
        let passed = result
            .candidates
            .iter()
            .filter(|c| c.status.is_scored())
            .count();
        let failed = result
            .candidates
            .iter()
            .filter(|c| c.status == crate::candidate::CandidateStatus::Fail)
            .count();
        let errored = result
            .candidates
            .iter()
            .filter(|c| c.status == crate::candidate::CandidateStatus::Error)
            .count();
        out.push_str(&format!(
            "{},{:.1},{:.3},{},{},{},{},{}\n",
            result.query_id,
            result.baseline_ms,
            result.best_speedup,
            best_patch,
            result.candidates.len(),
            passed,
            failed,
            errored,
        ));
    }
    fs::write(path, out)
}
