//! The eight continuity operations behind one handle
//!
//! Every operation takes a flat request and returns a flat, serializable
//! result. Nothing here knows how requests arrive; the CLI in `main.rs` is one
//! caller, tests are another.

use crate::accumulator::{CheckpointUpdate, SessionAccumulator, SESSION_END_OPERATION};
use crate::compress::{self, CompressedContext};
use crate::config::Config;
use crate::db::{Checkpoint, Database};
use crate::decisions::{DecisionFilter, DecisionLog};
use crate::error::{Error, Result};
use crate::handoff::{self, HandoffFields, HandoffScore};
use crate::init;
use crate::recovery::{CrashDetector, CrashRecovery};
use crate::snapshot::{SnapshotStore, SESSION_ID_KEY};
use crate::types::{
    now_timestamp, parse_timestamp, Category, CheckpointState, CompletedOperation, Decision, GitState,
    Impact, SessionState, Trigger,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}

// ============================================================================
// Requests and results
// ============================================================================

/// Everything a full save records; nothing is taken from the accumulator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    pub workspace: String,
    pub phase: String,
    #[serde(default)]
    pub completed_operations: Vec<CompletedOperation>,
    #[serde(default)]
    pub active_files: Vec<String>,
    #[serde(default)]
    pub decisions_made: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub uncommitted: bool,
    #[serde(default)]
    pub git_hash: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveResult {
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
    pub session_id: String,
    pub checkpoint_id: String,
    pub handoff_score: HandoffScore,
    pub meets_threshold: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadRequest {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `found == false` is a fresh start, not a failure
#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub found: bool,
    pub state: Option<SessionState>,
    pub markdown: Option<String>,
    pub json_path: Option<PathBuf>,
    pub age_hours: Option<f64>,
    /// The session record opened for the resumed work
    pub session_id: Option<String>,
}

impl LoadResult {
    fn fresh_start() -> Self {
        Self {
            found: false,
            state: None,
            markdown: None,
            json_path: None,
            age_hours: None,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub workspace: String,
    #[serde(flatten)]
    pub update: CheckpointUpdate,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointResult {
    pub checkpoint_id: String,
    pub workspace: String,
    pub timestamp: String,
    pub operation: String,
    pub checkpoint_count: u32,
    pub auto_escalated: bool,
    pub handoff_path: Option<PathBuf>,
    /// Set when escalation was due but its artifacts could not be written, or
    /// when they were written but the session record could not be rotated
    pub escalation_error: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDecisionRequest {
    pub workspace: String,
    pub category: Category,
    pub decision: String,
    pub rationale: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub revisit_trigger: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogDecisionResult {
    pub decision: Decision,
    /// Advisory only; the decision is recorded either way
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionQueryResult {
    pub count: usize,
    pub decisions: Vec<Decision>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressRequest {
    pub text: String,
    /// Falls back to `[compression] target_tokens`
    #[serde(default)]
    pub target_tokens: Option<usize>,
    #[serde(default)]
    pub preserve: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandoffReport {
    #[serde(flatten)]
    pub score: HandoffScore,
    pub threshold: u8,
    pub meets_threshold: bool,
}

/// First three words of a decision, the key for the similarity check
fn similarity_keyword(text: &str) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().take(3).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

fn age_hours(timestamp: &str) -> Option<f64> {
    let saved = parse_timestamp(timestamp)?;
    let millis = (Utc::now() - saved).num_milliseconds() as f64;
    Some((millis / 3_600_000.0 * 10.0).round() / 10.0)
}

// ============================================================================
// Facade
// ============================================================================

pub struct Continuity {
    config: Config,
    db: Arc<Database>,
    snapshots: SnapshotStore,
    decisions: DecisionLog,
    accumulator: SessionAccumulator,
    detector: CrashDetector,
}

impl Continuity {
    /// Bootstrap the data directory if needed and open every store
    pub fn open(config: Config) -> Result<Self> {
        init::bootstrap(&config)?;
        let db = Arc::new(Database::open_at(config.db_path())?);
        let accumulator = SessionAccumulator::new(
            db.clone(),
            SnapshotStore::new(config.sessions_dir()),
            config.checkpoint.keep,
            config.checkpoint.escalation_threshold,
        );
        Ok(Self {
            snapshots: SnapshotStore::new(config.sessions_dir()),
            decisions: DecisionLog::new(config.decision_log_path()),
            detector: CrashDetector::new(db.clone()),
            accumulator,
            db,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn accumulator(&self) -> &SessionAccumulator {
        &self.accumulator
    }

    /// Write a complete snapshot and end the tracked session cleanly
    ///
    /// The only path that sets `ended_cleanly` and the only path that clears the
    /// workspace's accumulator. Runs under the workspace lock.
    pub fn save_session(&self, request: SaveRequest) -> Result<SaveResult> {
        require(&request.workspace, "workspace")?;
        require(&request.phase, "phase")?;
        let workspace = request.workspace.clone();

        let mut state = SessionState {
            workspace: request.workspace,
            timestamp: now_timestamp(),
            phase: request.phase,
            completed_operations: request.completed_operations,
            active_files: request.active_files,
            decisions_made: request.decisions_made,
            next_steps: request.next_steps,
            git: GitState {
                branch: request.git_branch,
                uncommitted: request.uncommitted,
            },
            warnings: request.warnings,
            metadata: request.metadata,
        };
        let git_hash = request.git_hash;

        let (paths, session_id, checkpoint) = self.accumulator.with_workspace(&workspace, |slot| {
            let tracked = self.db.open_session(&workspace)?;
            let session_id = match tracked {
                Some(ref record) => record.session_id.clone(),
                None => Uuid::new_v4().to_string(),
            };
            state
                .metadata
                .insert(SESSION_ID_KEY.to_string(), serde_json::json!(session_id));

            let paths = self.snapshots.write(&state, false)?;
            if tracked.is_none() {
                self.db.start_session_with_id(&workspace, &session_id)?;
            }
            let handoff = paths.json.to_string_lossy().to_string();
            self.db.end_session(&session_id, true, Some(&handoff))?;

            let checkpoint = self.db.insert_checkpoint(
                &workspace,
                SESSION_END_OPERATION,
                &CheckpointState::from(&state),
                git_hash.as_deref(),
                Trigger::Manual,
                self.config.checkpoint.keep,
            )?;
            *slot = None;
            Ok::<_, Error>((paths, session_id, checkpoint))
        })?;
        self.accumulator.release(&workspace);

        let handoff_score = handoff::score(&HandoffFields::from(&state));
        let threshold = self.config.handoff.score_threshold;
        let meets_threshold = handoff_score.meets(threshold);
        if !meets_threshold {
            warn!(workspace = %workspace, score = handoff_score.score, threshold, "handoff below threshold");
        }
        info!(workspace = %workspace, session_id = %session_id, path = %paths.json.display(), "session saved");

        Ok(SaveResult {
            json_path: paths.json,
            markdown_path: paths.markdown,
            session_id,
            checkpoint_id: checkpoint.checkpoint_id,
            handoff_score,
            meets_threshold,
        })
    }

    /// Resume from the best matching snapshot and open a new session record
    pub fn load_session(&self, request: LoadRequest) -> Result<LoadResult> {
        let workspace = request.workspace.as_deref().filter(|ws| !ws.trim().is_empty());
        let session_id = request.session_id.as_deref().filter(|id| !id.trim().is_empty());

        let Some(snapshot) = self.snapshots.find(workspace, session_id)? else {
            info!(workspace = ?workspace, session_id = ?session_id, "no snapshot found; fresh start");
            return Ok(LoadResult::fresh_start());
        };

        let record = self.db.start_session(&snapshot.state.workspace)?;
        info!(
            workspace = %snapshot.state.workspace,
            session_id = %record.session_id,
            path = %snapshot.paths.json.display(),
            "session loaded"
        );

        Ok(LoadResult {
            found: true,
            age_hours: age_hours(&snapshot.state.timestamp),
            json_path: Some(snapshot.paths.json),
            markdown: Some(snapshot.markdown),
            state: Some(snapshot.state),
            session_id: Some(record.session_id),
        })
    }

    /// Merge a partial update; escalation trouble is reported, never raised
    pub fn checkpoint(&self, request: CheckpointRequest) -> Result<CheckpointResult> {
        let outcome = self.accumulator.merge(&request.workspace, &request.update)?;

        let (auto_escalated, handoff_path, escalation_error, rotated) = match outcome.escalation {
            Some(Ok(escalated)) => (
                true,
                Some(escalated.paths.json),
                escalated.rotation_error,
                escalated.session_id,
            ),
            Some(Err(e)) => (false, None, Some(e.to_string()), None),
            None => (false, None, None, None),
        };
        let session_id = match rotated {
            Some(id) => Some(id),
            None => self.db.open_session(&request.workspace)?.map(|r| r.session_id),
        };

        let checkpoint = outcome.checkpoint;
        Ok(CheckpointResult {
            checkpoint_id: checkpoint.checkpoint_id,
            workspace: checkpoint.workspace,
            timestamp: checkpoint.created_at,
            operation: checkpoint.operation,
            checkpoint_count: outcome.checkpoint_count,
            auto_escalated,
            handoff_path,
            escalation_error,
            session_id,
        })
    }

    /// Report and consume the most recent crashed session
    pub fn recover_crash(&self, workspace: Option<&str>) -> Result<CrashRecovery> {
        self.detector.recover(workspace.filter(|ws| !ws.trim().is_empty()))
    }

    /// Append a decision, flagging a likely duplicate without refusing it
    pub fn log_decision(&self, request: LogDecisionRequest) -> Result<LogDecisionResult> {
        require(&request.workspace, "workspace")?;
        require(&request.decision, "decision")?;
        require(&request.rationale, "rationale")?;

        let similar = match similarity_keyword(&request.decision) {
            Some(keyword) => self.decisions.query(&DecisionFilter {
                workspace: Some(request.workspace.clone()),
                keyword: Some(keyword),
                ..Default::default()
            })?,
            None => Vec::new(),
        };
        let warning = similar.first().map(|existing| {
            format!(
                "Possible duplicate of decision {} (\"{}\"); recorded anyway",
                existing.id, existing.decision
            )
        });

        let decision = Decision {
            id: Uuid::new_v4().to_string(),
            timestamp: now_timestamp(),
            workspace: request.workspace,
            category: request.category,
            decision: request.decision,
            rationale: request.rationale,
            alternatives: request.alternatives,
            impact: request.impact,
            revisit_trigger: request.revisit_trigger,
        };
        self.decisions.append(&decision)?;
        info!(id = %decision.id, workspace = %decision.workspace, category = %decision.category, "decision logged");

        Ok(LogDecisionResult { decision, warning })
    }

    pub fn query_decisions(&self, filter: &DecisionFilter) -> Result<DecisionQueryResult> {
        let decisions = self.decisions.query(filter)?;
        Ok(DecisionQueryResult {
            count: decisions.len(),
            decisions,
        })
    }

    pub fn compress_context(&self, request: &CompressRequest) -> Result<CompressedContext> {
        let target = match request.target_tokens {
            Some(0) => return Err(Error::Validation("target_tokens must be positive".to_string())),
            Some(n) => n,
            None => self.config.compression.target_tokens,
        };
        Ok(compress::compress(&request.text, target, &request.preserve))
    }

    pub fn score_handoff(&self, fields: &HandoffFields) -> HandoffReport {
        let threshold = self.config.handoff.score_threshold;
        let score = handoff::score(fields);
        HandoffReport {
            meets_threshold: score.meets(threshold),
            score,
            threshold,
        }
    }

    /// Newest-first checkpoint history for a workspace
    pub fn list_checkpoints(&self, workspace: &str, limit: i64) -> Result<Vec<Checkpoint>> {
        require(workspace, "workspace")?;
        self.db.list_checkpoints(workspace, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(temp: &TempDir) -> Continuity {
        Continuity::open(Config::with_data_dir(temp.path().join(".evergreen"))).unwrap()
    }

    #[test]
    fn test_similarity_keyword() {
        assert_eq!(similarity_keyword("Use SQLite for storage").as_deref(), Some("Use SQLite for"));
        assert_eq!(similarity_keyword("  Use   SQLite ").as_deref(), Some("Use SQLite"));
        assert_eq!(similarity_keyword("   "), None);
    }

    #[test]
    fn test_age_hours_rounds_to_one_decimal() {
        let ninety_minutes_ago = crate::types::format_timestamp(Utc::now() - chrono::Duration::minutes(90));
        assert_eq!(age_hours(&ninety_minutes_ago), Some(1.5));
        assert_eq!(age_hours("not a timestamp"), None);
    }

    #[test]
    fn test_open_bootstraps_data_dir() {
        let temp = TempDir::new().unwrap();
        let continuity = open(&temp);
        assert!(continuity.config().sessions_dir().is_dir());
        assert!(continuity.config().decision_log_path().is_file());
        assert!(continuity.config().db_path().is_file());
    }

    #[test]
    fn test_save_rejects_missing_fields_before_writing() {
        let temp = TempDir::new().unwrap();
        let continuity = open(&temp);
        let err = continuity
            .save_session(SaveRequest {
                workspace: "w".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(std::fs::read_dir(continuity.config().sessions_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_compress_target_defaults_and_zero_is_rejected() {
        let temp = TempDir::new().unwrap();
        let continuity = open(&temp);

        let request = CompressRequest {
            text: "short".to_string(),
            ..Default::default()
        };
        let result = continuity.compress_context(&request).unwrap();
        assert_eq!(result.compressed, "short");
        assert_eq!(result.ratio, 1.0);

        let zero = CompressRequest {
            target_tokens: Some(0),
            ..request
        };
        assert!(matches!(continuity.compress_context(&zero), Err(Error::Validation(_))));
    }

    #[test]
    fn test_score_handoff_reports_threshold() {
        let temp = TempDir::new().unwrap();
        let continuity = open(&temp);
        let report = continuity.score_handoff(&HandoffFields::default());
        assert_eq!(report.threshold, 80);
        assert!(!report.meets_threshold);
        assert!(report.score.missing.contains(&"workspace".to_string()));
    }

    #[test]
    fn test_checkpoint_request_accepts_flat_json() {
        let request: CheckpointRequest = serde_json::from_str(
            r#"{"workspace": "w", "operation": "parsed", "trigger": "auto", "next_steps": ["x"]}"#,
        )
        .unwrap();
        assert_eq!(request.workspace, "w");
        assert_eq!(request.update.operation, "parsed");
        assert_eq!(request.update.trigger, Trigger::Auto);
        assert_eq!(request.update.next_steps, Some(vec!["x".to_string()]));
    }
}
