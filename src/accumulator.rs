//! Per-workspace session accumulator
//!
//! Every checkpoint merges a partial update into the workspace's running state
//! and persists the whole running state, so the latest checkpoint alone is
//! enough to resume. After `escalation_threshold` checkpoints the running state
//! is promoted to a full snapshot on disk.
//!
//! Merge policy per field:
//!
//! | Field | Policy |
//! |-------|--------|
//! | `phase` | last write wins, absent leaves it alone |
//! | `active_files`, `next_steps` | replaced when present |
//! | `warnings` | appended |
//! | `decisions` | appended, exact duplicates dropped |
//! | `completed_operations` | one entry per checkpoint |

use crate::db::{Checkpoint, Database, SessionRecord};
use crate::error::{Error, Result};
use crate::git;
use crate::snapshot::{SnapshotPaths, SnapshotStore, SESSION_ID_KEY};
use crate::types::{
    now_timestamp, CheckpointState, CompletedOperation, GitState, OperationResult, SessionState,
    Trigger,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Operation label of the checkpoint a clean save leaves behind
pub const SESSION_END_OPERATION: &str = "session_end";

/// A partial update; absent fields leave the running state untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointUpdate {
    /// What was just completed
    pub operation: String,
    #[serde(default)]
    pub result: Option<OperationResult>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub active_files: Option<Vec<String>>,
    #[serde(default)]
    pub next_steps: Option<Vec<String>>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub git_hash: Option<String>,
    #[serde(default)]
    pub trigger: Trigger,
}

impl CheckpointUpdate {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }
}

/// Running state for one workspace
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccumulatorState {
    pub workspace: String,
    pub phase: Option<String>,
    pub completed_operations: Vec<CompletedOperation>,
    pub active_files: Vec<String>,
    pub decisions_made: Vec<String>,
    pub next_steps: Vec<String>,
    pub warnings: Vec<String>,
    pub checkpoints_since_escalation: u32,
    pub last_escalation: Option<String>,
}

impl AccumulatorState {
    pub fn new(workspace: &str) -> Self {
        Self {
            workspace: workspace.to_string(),
            ..Default::default()
        }
    }

    /// Resume from a persisted checkpoint; the escalation counter restarts at zero
    pub fn hydrate(workspace: &str, payload: CheckpointState) -> Self {
        Self {
            workspace: workspace.to_string(),
            phase: payload.phase,
            completed_operations: payload.completed_operations,
            active_files: payload.active_files,
            decisions_made: payload.decisions_made,
            next_steps: payload.next_steps,
            warnings: payload.warnings,
            checkpoints_since_escalation: 0,
            last_escalation: None,
        }
    }

    /// Merge one update and count it
    pub fn apply(&mut self, update: &CheckpointUpdate) {
        if let Some(ref phase) = update.phase {
            self.phase = Some(phase.clone());
        }
        if let Some(ref files) = update.active_files {
            self.active_files = files.clone();
        }
        if let Some(ref steps) = update.next_steps {
            self.next_steps = steps.clone();
        }
        self.warnings.extend(update.warnings.iter().cloned());
        for decision in &update.decisions {
            if !self.decisions_made.contains(decision) {
                self.decisions_made.push(decision.clone());
            }
        }
        self.completed_operations.push(CompletedOperation::now(
            update.operation.clone(),
            update.result.unwrap_or_default(),
        ));
        self.checkpoints_since_escalation += 1;
    }

    /// The full running state, as stored in every checkpoint
    pub fn payload(&self) -> CheckpointState {
        CheckpointState {
            phase: self.phase.clone(),
            completed_operations: self.completed_operations.clone(),
            active_files: self.active_files.clone(),
            decisions_made: self.decisions_made.clone(),
            next_steps: self.next_steps.clone(),
            warnings: self.warnings.clone(),
        }
    }

    pub fn to_session_state(&self, git: GitState) -> SessionState {
        SessionState {
            workspace: self.workspace.clone(),
            timestamp: now_timestamp(),
            phase: self.phase.clone().unwrap_or_else(|| "in-progress".to_string()),
            completed_operations: self.completed_operations.clone(),
            active_files: self.active_files.clone(),
            decisions_made: self.decisions_made.clone(),
            next_steps: self.next_steps.clone(),
            git,
            warnings: self.warnings.clone(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Result of an automatic escalation
///
/// The artifacts are on disk whenever this exists. Rotating the session
/// record is a separate step and can fail on its own.
#[derive(Debug, Clone, Serialize)]
pub struct Escalated {
    pub paths: SnapshotPaths,
    /// Session record opened by the rotation
    pub session_id: Option<String>,
    pub rotation_error: Option<String>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub checkpoint: Checkpoint,
    /// Counter value this checkpoint reached, before any reset
    pub checkpoint_count: u32,
    /// `None` when no escalation was due. An `Err` never undoes the checkpoint.
    pub escalation: Option<Result<Escalated>>,
}

type Slot = Arc<Mutex<Option<AccumulatorState>>>;

/// Owns every workspace's running state
///
/// One slot per workspace, each behind its own lock: merges on different
/// workspaces proceed in parallel, merges on the same workspace queue.
pub struct SessionAccumulator {
    db: Arc<Database>,
    snapshots: SnapshotStore,
    keep: usize,
    threshold: u32,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionAccumulator {
    pub fn new(db: Arc<Database>, snapshots: SnapshotStore, keep: usize, threshold: u32) -> Self {
        Self {
            db,
            snapshots,
            keep,
            threshold: threshold.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, workspace: &str) -> Slot {
        let mut slots = self.slots.lock();
        slots
            .entry(workspace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Run `f` holding the workspace's exclusive lock
    pub fn with_workspace<R>(&self, workspace: &str, f: impl FnOnce(&mut Option<AccumulatorState>) -> R) -> R {
        let slot = self.slot(workspace);
        let mut guard = slot.lock();
        f(&mut guard)
    }

    /// Copy of a workspace's running state, if any
    pub fn peek(&self, workspace: &str) -> Option<AccumulatorState> {
        let slot = self.slots.lock().get(workspace).cloned()?;
        let guard = slot.lock();
        (*guard).clone()
    }

    /// Drop a workspace's running state and its slot
    pub fn clear(&self, workspace: &str) {
        self.with_workspace(workspace, |state| *state = None);
        self.release(workspace);
    }

    /// Forget a workspace's slot if it is empty and nobody else holds it
    pub fn release(&self, workspace: &str) {
        let mut slots = self.slots.lock();
        let idle = slots
            .get(workspace)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && slot.lock().is_none());
        if idle {
            slots.remove(workspace);
        }
    }

    /// Workspaces currently holding a slot
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn hydrate(&self, workspace: &str) -> Result<AccumulatorState> {
        let Some(latest) = self.db.latest_checkpoint(workspace)? else {
            return Ok(AccumulatorState::new(workspace));
        };
        if latest.operation == SESSION_END_OPERATION {
            return Ok(AccumulatorState::new(workspace));
        }
        match latest.state() {
            Ok(payload) => {
                debug!(workspace, checkpoint_id = %latest.checkpoint_id, "accumulator hydrated from checkpoint");
                Ok(AccumulatorState::hydrate(workspace, payload))
            }
            Err(e) => {
                warn!(workspace, error = %e, "ignoring unreadable checkpoint");
                Ok(AccumulatorState::new(workspace))
            }
        }
    }

    /// Merge an update, persist the running state, escalate when due
    pub fn merge(&self, workspace: &str, update: &CheckpointUpdate) -> Result<MergeOutcome> {
        if workspace.trim().is_empty() {
            return Err(Error::Validation("workspace is required".to_string()));
        }
        if update.operation.trim().is_empty() {
            return Err(Error::Validation("operation is required".to_string()));
        }

        let slot = self.slot(workspace);
        let mut guard = slot.lock();

        let mut state = match guard.take() {
            Some(state) => state,
            None => self.hydrate(workspace)?,
        };
        let previous = state.clone();
        state.apply(update);

        let checkpoint = match self.db.insert_checkpoint(
            workspace,
            &update.operation,
            &state.payload(),
            update.git_hash.as_deref(),
            update.trigger,
            self.keep,
        ) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                *guard = Some(previous);
                return Err(e);
            }
        };
        *guard = Some(state.clone());
        let checkpoint_count = state.checkpoints_since_escalation;
        debug!(workspace, checkpoint_id = %checkpoint.checkpoint_id, count = checkpoint_count, "checkpoint written");

        let session = match self.db.open_session(workspace)? {
            Some(record) => record,
            None => self.db.start_session(workspace)?,
        };
        self.db.increment_operations(&session.session_id)?;

        let escalation = if checkpoint_count >= self.threshold {
            Some(self.escalate(&mut state, &session.session_id))
        } else {
            None
        };

        *guard = Some(state);
        Ok(MergeOutcome {
            checkpoint,
            checkpoint_count,
            escalation,
        })
    }

    /// Promote the running state to a full snapshot and rotate the session record
    ///
    /// The counter resets once the artifacts are on disk. If writing them fails
    /// the counter is left alone so the next checkpoint tries again. A failed
    /// rotation is reported on the `Escalated` value, since the snapshot stands.
    fn escalate(&self, state: &mut AccumulatorState, session_id: &str) -> Result<Escalated> {
        let count = state.checkpoints_since_escalation;
        let mut snapshot = state.to_session_state(git::current_state());
        snapshot.warnings.push(format!(
            "Auto-escalated to a full snapshot after {} checkpoints",
            count
        ));
        snapshot.metadata.insert("auto_escalated".to_string(), serde_json::json!(true));
        snapshot.metadata.insert("checkpoint_count".to_string(), serde_json::json!(count));
        snapshot.metadata.insert(SESSION_ID_KEY.to_string(), serde_json::json!(session_id));
        if let Some(ref last) = state.last_escalation {
            snapshot.metadata.insert("previous_escalation".to_string(), serde_json::json!(last));
        }

        let paths = match self.snapshots.write(&snapshot, true) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(workspace = %state.workspace, error = %e, "auto-escalation failed");
                return Err(e);
            }
        };

        state.checkpoints_since_escalation = 0;
        state.last_escalation = Some(snapshot.timestamp.clone());
        info!(workspace = %state.workspace, path = %paths.json.display(), count, "auto-escalated to snapshot");

        let (next_session, rotation_error) = match self.rotate(session_id, &state.workspace, &paths) {
            Ok(next) => (Some(next.session_id), None),
            Err(e) => {
                warn!(workspace = %state.workspace, session_id, error = %e, "session rotation failed after escalation");
                (None, Some(e.to_string()))
            }
        };

        Ok(Escalated {
            paths,
            session_id: next_session,
            rotation_error,
        })
    }

    /// Close the escalated record, not cleanly, and open its successor
    fn rotate(&self, session_id: &str, workspace: &str, paths: &SnapshotPaths) -> Result<SessionRecord> {
        let handoff = paths.json.to_string_lossy().to_string();
        self.db.end_session(session_id, false, Some(&handoff))?;
        self.db.start_session(workspace)
    }
}
