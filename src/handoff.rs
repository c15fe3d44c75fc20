//! Handoff completeness scoring
//!
//! A handoff is only useful if the next session can act on it. The score is a
//! fixed point table over the fields that make that possible, minus a couple of
//! quality penalties.

use crate::types::SessionState;
use serde::{Deserialize, Serialize};

/// Candidate handoff, as much of it as the caller has
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffFields {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub active_files: Vec<String>,
    #[serde(default)]
    pub completed_operations: Vec<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub decisions_made: Vec<String>,
}

impl From<&SessionState> for HandoffFields {
    fn from(state: &SessionState) -> Self {
        Self {
            workspace: Some(state.workspace.clone()),
            phase: Some(state.phase.clone()),
            next_steps: state.next_steps.clone(),
            active_files: state.active_files.clone(),
            completed_operations: state
                .completed_operations
                .iter()
                .map(|op| op.description.clone())
                .collect(),
            git_branch: state.git.branch.clone(),
            warnings: state.warnings.clone(),
            decisions_made: state.decisions_made.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffScore {
    pub score: u8,
    pub missing: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl HandoffScore {
    pub fn meets(&self, threshold: u8) -> bool {
        self.score >= threshold
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub fn score(fields: &HandoffFields) -> HandoffScore {
    let mut points: i32 = 0;
    let mut missing = Vec::new();
    let mut warnings = Vec::new();
    let mut suggestions = Vec::new();

    if present(&fields.workspace).is_some() {
        points += 10;
    } else {
        missing.push("workspace".to_string());
    }

    let phase = present(&fields.phase);
    if phase.is_some() {
        points += 10;
    } else {
        missing.push("phase".to_string());
    }

    if !fields.next_steps.is_empty() {
        points += 20;
    } else {
        missing.push("next_steps".to_string());
    }

    if !fields.active_files.is_empty() {
        points += 10;
    } else {
        missing.push("active_files".to_string());
    }

    if !fields.completed_operations.is_empty() {
        points += 10;
    } else {
        missing.push("completed_operations".to_string());
    }

    if present(&fields.git_branch).is_some() {
        points += 10;
    } else {
        suggestions.push("Record the git branch so the next session checks out the right code".to_string());
    }

    if !fields.warnings.is_empty() {
        points += 5;
    }

    if !fields.decisions_made.is_empty() {
        points += 15;
    } else {
        suggestions.push("Note the decisions made this session so they are not re-litigated".to_string());
    }

    match phase {
        Some(p) if p.chars().count() > 3 => points += 10,
        Some(p) => suggestions.push(format!("Phase '{}' is terse; describe where the work stands", p)),
        None => suggestions.push("Name the phase so the next session knows where the work stands".to_string()),
    }

    if let Some(first) = fields.next_steps.first() {
        if first.trim().chars().count() < 10 {
            points -= 5;
            warnings.push(format!("First next step '{}' is too short to act on", first));
        }
    }
    if fields.next_steps.len() > 10 {
        points -= 5;
        warnings.push(format!(
            "{} next steps listed; keep the handoff to the 10 that matter",
            fields.next_steps.len()
        ));
    }

    HandoffScore {
        score: points.clamp(0, 100) as u8,
        missing,
        warnings,
        suggestions,
    }
}
