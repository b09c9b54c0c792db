//! Gold example store: verified rewrites injected into prompts.
//!
//! One JSON document per example on disk. Examples whose patch plans no
//! longer re-apply cleanly against their own original SQL are worse than
//! useless in a prompt, so [`verify_example`] re-runs them through the
//! patch engine.

use std::fs;
use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::dialect::Dialect;
use crate::ir::build_script_ir;
use crate::patch::{apply_patch_plan, PatchPlan};

/// A verified rewrite worth imitating.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GoldExample {
    pub id: String,
    pub dialect: Dialect,
    pub description: String,
    pub original_sql: String,
    pub optimized_sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_plan: Option<PatchPlan>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_speedup: Option<f64>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum GoldError {
    #[error("cannot read gold example store at {path}: {message}")]
    #[diagnostic(code(sqlbeam::gold::io))]
    Io { path: String, message: String },

    #[error("gold example {id}: original SQL no longer parses: {message}")]
    #[diagnostic(code(sqlbeam::gold::stale_sql))]
    StaleSql { id: String, message: String },

    #[error("gold example {id}: patch plan no longer applies: {message}")]
    #[diagnostic(code(sqlbeam::gold::stale_plan))]
    StalePlan { id: String, message: String },
}

/// In-memory collection of gold examples.
#[derive(Clone, Debug, Default)]
pub struct GoldStore {
    examples: Vec<GoldExample>,
}

impl GoldStore {
    pub fn from_examples(examples: Vec<GoldExample>) -> Self {
        Self { examples }
    }

    /// Load every `*.json` document in a directory. Malformed documents
    /// are skipped with a warning rather than poisoning the store.
    pub fn load_dir(dir: &Path) -> Result<Self, GoldError> {
        let entries = fs::read_dir(dir).map_err(|e| GoldError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;

        let mut examples = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GoldError::Io {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), %e, "skipping unreadable gold example");
                    continue;
                }
            };
            match serde_json::from_str::<GoldExample>(&text) {
                Ok(example) => examples.push(example),
                Err(e) => {
                    warn!(path = %path.display(), %e, "skipping malformed gold example");
                }
            }
        }
        examples.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self { examples })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn by_id(&self, id: &str) -> Option<&GoldExample> {
        self.examples.iter().find(|e| e.id == id)
    }

    /// Examples matching any of `tags` in this dialect, best-speedup
    /// first, capped at `limit`. Falls back to other dialects when the
    /// native set is empty (a PG example still teaches the shape).
    pub fn find(&self, tags: &[&str], dialect: Dialect, limit: usize) -> Vec<&GoldExample> {
        let matches_tags = |example: &GoldExample| {
            tags.is_empty() || example.tags.iter().any(|t| tags.contains(&t.as_str()))
        };

        let mut native: Vec<&GoldExample> = self
            .examples
            .iter()
            .filter(|e| e.dialect == dialect && matches_tags(e))
            .collect();
        if native.is_empty() {
            native = self.examples.iter().filter(|e| matches_tags(e)).collect();
        }
        native.sort_by(|a, b| {
            b.verified_speedup
                .unwrap_or(0.0)
                .partial_cmp(&a.verified_speedup.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        native.truncate(limit);
        native
    }
}

/// Re-apply a gold example's patch plan against its own original SQL.
pub fn verify_example(example: &GoldExample) -> Result<(), GoldError> {
    let ir = build_script_ir(&example.original_sql, example.dialect).map_err(|e| {
        GoldError::StaleSql {
            id: example.id.clone(),
            message: e.to_string(),
        }
    })?;

    let Some(plan) = &example.patch_plan else {
        return Ok(());
    };
    let result = apply_patch_plan(&ir, plan);
    if result.success {
        Ok(())
    } else {
        Err(GoldError::StalePlan {
            id: example.id.clone(),
            message: result
                .error_summary()
                .unwrap_or_else(|| "unknown failure".into()),
        })
    }
}
