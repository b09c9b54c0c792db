//! # sqlbeam
//!
//! A feedback-driven SQL rewrite engine for decision-support workloads:
//! take a slow analytical query plus its execution plan, search for a
//! semantically equivalent faster query, and prove both the equivalence
//! and the speedup before reporting it.
//!
//! ## Pipeline
//!
//! ```text
//! SQL + EXPLAIN text
//!     ↓
//! [ir]          → ScriptIR with anchor hashes + node map
//!     ↓
//! [transforms]  → feature extraction + gated transform catalog
//!     ↓
//! [prompts]     → analyst prompt → {probes | targets}
//!     ↓
//! [session]     → parallel workers → PatchPlans
//!     ↓
//! [patch]       → candidate SQL (Tier-1 gate inside)
//!     ↓
//! [validate]    → Tier-2 synthetic → Tier-3 full dataset
//!     ↓
//! [bench]       → fail-fast timing, winner confirmation
//!     ↓
//! [session]     → sniper synthesis → ranked SessionResult
//! ```
//!
//! ## Entry point
//!
//! The crate is consumed as a library; one call runs one query:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sqlbeam::exec::SqliteFactory;
//! use sqlbeam::llm::ScriptedClient;
//! use sqlbeam::session::{run_session, ExplainInput, SessionConfig};
//!
//! # fn main() -> Result<(), sqlbeam::session::SessionError> {
//! let llm = Arc::new(ScriptedClient::new(vec![]));
//! let db = Arc::new(SqliteFactory::new("tpcds.db"));
//! let result = run_session(
//!     "query_001",
//!     "SELECT 1",
//!     &ExplainInput::from_text("SEQ_SCAN t [100ms]"),
//!     llm,
//!     db,
//!     SessionConfig::default(),
//! )?;
//! println!("best speedup: {:.2}x", result.best_speedup);
//! # Ok(())
//! # }
//! ```
//!
//! LLM vendors and production database drivers stay outside the crate:
//! plug them in through [`llm::LlmClient`] and [`exec::ExecutorFactory`].

pub mod bench;
pub mod candidate;
pub mod dialect;
pub mod exec;
pub mod gold;
pub mod ir;
pub mod knowledge;
pub mod llm;
pub mod patch;
pub mod prompts;
pub mod session;
pub mod telemetry;
pub mod transforms;
pub mod validate;

pub use bench::{benchmark_query_patches, BenchmarkKnobs, BenchmarkSummary};
pub use candidate::{Candidate, CandidateStatus};
pub use dialect::Dialect;
pub use ir::{build_script_ir, render_ir_node_map, AnchorHash, ScriptIr};
pub use patch::{apply_patch_plan, PatchPlan, PatchResult, PatchStep};
pub use session::{run_session, BeamMode, BeamSession, SessionConfig, SessionResult};
pub use transforms::{applicable_transforms, extract_features, Family};
pub use validate::{CompareMode, Validator};
