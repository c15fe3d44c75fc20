//! Evergreen - session continuity for long-running assisted work
//!
//! Checkpoint as you go, hand off when you stop, recover when you crash.
//!
//! # Overview
//!
//! Work in a workspace is recorded at two grains. Cheap checkpoints merge a
//! partial update into a running per-workspace state and persist the whole of
//! it, so the latest checkpoint alone is enough to resume. Full saves write a
//! self-sufficient snapshot (JSON plus a markdown rendering) and end the
//! session cleanly. Every so many checkpoints the running state escalates to a
//! full snapshot on its own.
//!
//! A session that never ended cleanly is reported once by crash recovery,
//! together with what its last checkpoint says.
//!
//! # Operations
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `save_session` | Write a full snapshot, end the session cleanly |
//! | `load_session` | Resume from a snapshot, open a new session |
//! | `checkpoint` | Merge a partial update, escalate when due |
//! | `recover_crash` | Report and consume the latest unclean session |
//! | `log_decision` | Append to the decision log |
//! | `query_decisions` | Filter the decision log |
//! | `compress_context` | Shrink text toward a token budget |
//! | `score_handoff` | Rate how resumable a handoff is |
//!
//! # Quick Start
//!
//! ```no_run
//! use evergreen::{CheckpointRequest, CheckpointUpdate, Config, Continuity};
//!
//! let continuity = Continuity::open(Config::load().unwrap()).unwrap();
//!
//! let recovery = continuity.recover_crash(Some("api")).unwrap();
//! if let Some(prompt) = recovery.prompt {
//!     println!("{}", prompt);
//! }
//!
//! let result = continuity
//!     .checkpoint(CheckpointRequest {
//!         workspace: "api".to_string(),
//!         update: CheckpointUpdate::new("added pagination"),
//!     })
//!     .unwrap();
//! println!("checkpoint {} ({} since escalation)", result.checkpoint_id, result.checkpoint_count);
//! ```

pub mod accumulator;
pub mod compress;
pub mod config;
pub mod continuity;
pub mod db;
pub mod decisions;
pub mod error;
pub mod git;
pub mod handoff;
pub mod init;
pub mod recovery;
pub mod render;
pub mod schema;
pub mod snapshot;
pub mod types;

pub use accumulator::{AccumulatorState, CheckpointUpdate, SessionAccumulator, SESSION_END_OPERATION};
pub use compress::{compress, estimate_tokens, CompressedContext};
pub use config::Config;
pub use continuity::{
    CheckpointRequest, CheckpointResult, CompressRequest, Continuity, DecisionQueryResult,
    HandoffReport, LoadRequest, LoadResult, LogDecisionRequest, LogDecisionResult, SaveRequest,
    SaveResult,
};
pub use db::{Checkpoint, Database, SessionRecord};
pub use decisions::{DecisionFilter, DecisionLog};
pub use error::{Error, Result};
pub use handoff::{HandoffFields, HandoffScore};
pub use recovery::{CrashDetector, CrashRecovery};
pub use snapshot::{SnapshotPaths, SnapshotStore};
pub use types::{
    Category, CheckpointState, CompletedOperation, Decision, GitState, Impact, OperationResult,
    SessionState, Trigger,
};
