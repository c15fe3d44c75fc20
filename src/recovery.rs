//! Crash detection
//!
//! A session record that never got an end time is either still running or
//! crashed. Detection consumes it: the record is moved from unclean to closed,
//! so the same crash is reported exactly once.

use crate::db::{Database, SessionRecord};
use crate::error::Result;
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

/// A detected session that has not been consumed yet
#[derive(Debug)]
pub struct UncleanSession {
    record: SessionRecord,
}

/// A crashed session after detection has consumed it
#[derive(Debug)]
pub struct ClosedSession {
    record: SessionRecord,
}

impl UncleanSession {
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Stamp an end time, leaving `ended_cleanly` false
    ///
    /// `None` when another caller closed the record first; only the caller
    /// that closes it owns the crash.
    pub fn close(self, db: &Database) -> Result<Option<ClosedSession>> {
        if !db.close_if_open(&self.record.session_id)? {
            return Ok(None);
        }
        let record = db
            .get_session(&self.record.session_id)?
            .unwrap_or(self.record);
        Ok(Some(ClosedSession { record }))
    }
}

impl ClosedSession {
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }
}

/// What the last checkpoint of a crashed session says
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub operation: String,
    pub timestamp: String,
    pub next_step: Option<String>,
    pub active_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrashRecovery {
    pub detected: bool,
    pub session_id: Option<String>,
    pub workspace: Option<String>,
    pub started_at: Option<String>,
    pub operations_completed: i32,
    pub operations_lost: i32,
    pub last_checkpoint: Option<CheckpointSummary>,
    pub prompt: Option<String>,
}

impl CrashRecovery {
    pub fn none() -> Self {
        Self {
            detected: false,
            session_id: None,
            workspace: None,
            started_at: None,
            operations_completed: 0,
            operations_lost: 0,
            last_checkpoint: None,
            prompt: None,
        }
    }
}

fn recovery_prompt(record: &SessionRecord, checkpoint: Option<&CheckpointSummary>) -> String {
    let mut prompt = String::new();
    writeln!(
        prompt,
        "Previous session {} in workspace '{}' did not end cleanly.",
        record.session_id, record.workspace
    )
    .unwrap();
    writeln!(prompt, "Started: {}", record.started_at).unwrap();
    writeln!(prompt, "Operations completed: {}", record.operations_count).unwrap();

    match checkpoint {
        Some(cp) => {
            writeln!(prompt, "Last checkpoint: {} at {}", cp.operation, cp.timestamp).unwrap();
            if let Some(ref step) = cp.next_step {
                writeln!(prompt, "Next step: {}", step).unwrap();
            }
            if !cp.active_files.is_empty() {
                writeln!(prompt, "Active files: {}", cp.active_files.join(", ")).unwrap();
            }
            write!(prompt, "Resume from the last checkpoint; it carries the full accumulated state.").unwrap();
        }
        None => {
            write!(
                prompt,
                "No checkpoint was recorded; {} operation(s) may need to be redone.",
                record.operations_count
            )
            .unwrap();
        }
    }
    prompt
}

pub struct CrashDetector {
    db: Arc<Database>,
}

impl CrashDetector {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Most recent unclean session, without consuming it
    pub fn detect(&self, workspace: Option<&str>) -> Result<Option<UncleanSession>> {
        Ok(self
            .db
            .unclean_sessions(workspace)?
            .into_iter()
            .next()
            .map(|record| UncleanSession { record }))
    }

    fn summarize_checkpoint(&self, workspace: &str) -> Result<Option<CheckpointSummary>> {
        let Some(checkpoint) = self.db.latest_checkpoint(workspace)? else {
            return Ok(None);
        };
        match checkpoint.state() {
            Ok(payload) => Ok(Some(CheckpointSummary {
                next_step: payload.next_steps.first().cloned(),
                active_files: payload.active_files,
                checkpoint_id: checkpoint.checkpoint_id,
                operation: checkpoint.operation,
                timestamp: checkpoint.created_at,
            })),
            Err(e) => {
                warn!(workspace, error = %e, "latest checkpoint unreadable; recovering without it");
                Ok(None)
            }
        }
    }

    /// Detect, report and consume the most recent crash
    ///
    /// A record closed by a concurrent caller between detection and close is
    /// theirs to report; detection moves on to the next unclean record.
    pub fn recover(&self, workspace: Option<&str>) -> Result<CrashRecovery> {
        let closed = loop {
            let Some(unclean) = self.detect(workspace)? else {
                return Ok(CrashRecovery::none());
            };
            if let Some(closed) = unclean.close(&self.db)? {
                break closed;
            }
        };
        let record = closed.record();

        let checkpoint = self.summarize_checkpoint(&record.workspace)?;
        let prompt = recovery_prompt(record, checkpoint.as_ref());

        let operations_lost = if checkpoint.is_some() { 0 } else { record.operations_count };
        info!(
            workspace = %record.workspace,
            session_id = %record.session_id,
            operations_lost,
            "crashed session detected"
        );

        Ok(CrashRecovery {
            detected: true,
            session_id: Some(record.session_id.clone()),
            workspace: Some(record.workspace.clone()),
            started_at: Some(record.started_at.clone()),
            operations_completed: record.operations_count,
            operations_lost,
            last_checkpoint: checkpoint,
            prompt: Some(prompt),
        })
    }
}
