//! Value types shared across stores
//!
//! Everything here crosses component boundaries by value.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Current instant as RFC 3339 UTC with millisecond precision
///
/// Fixed width and a `Z` suffix, so lexical order matches chronological order.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Outcome of a completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    #[default]
    Success,
    Failure,
    Partial,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::Success => write!(f, "success"),
            OperationResult::Failure => write!(f, "failure"),
            OperationResult::Partial => write!(f, "partial"),
        }
    }
}

impl FromStr for OperationResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(OperationResult::Success),
            "failure" => Ok(OperationResult::Failure),
            "partial" => Ok(OperationResult::Partial),
            other => Err(format!(
                "unknown operation result '{}' (expected success, failure or partial)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedOperation {
    pub timestamp: String,
    pub description: String,
    pub result: OperationResult,
}

impl CompletedOperation {
    pub fn now(description: impl Into<String>, result: OperationResult) -> Self {
        Self {
            timestamp: now_timestamp(),
            description: description.into(),
            result,
        }
    }
}

/// What caused a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Manual,
    Shim,
    Kernl,
    Gitflow,
    Auto,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Shim => "shim",
            Trigger::Kernl => "kernl",
            Trigger::Gitflow => "gitflow",
            Trigger::Auto => "auto",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "shim" => Ok(Trigger::Shim),
            "kernl" => Ok(Trigger::Kernl),
            "gitflow" => Ok(Trigger::Gitflow),
            "auto" => Ok(Trigger::Auto),
            other => Err(format!("unknown trigger '{}'", other)),
        }
    }
}

/// Source-control state captured with a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GitState {
    pub branch: Option<String>,
    pub uncommitted: bool,
}

/// Complete, self-sufficient handoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub workspace: String,
    pub timestamp: String,
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
    pub git: GitState,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Accumulated state carried by every checkpoint
///
/// Each checkpoint stores the running total, never a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckpointState {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub completed_operations: Vec<CompletedOperation>,
    #[serde(default)]
    pub active_files: Vec<String>,
    #[serde(default)]
    pub decisions_made: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl From<&SessionState> for CheckpointState {
    fn from(state: &SessionState) -> Self {
        Self {
            phase: Some(state.phase.clone()),
            completed_operations: state.completed_operations.clone(),
            active_files: state.active_files.clone(),
            decisions_made: state.decisions_made.clone(),
            next_steps: state.next_steps.clone(),
            warnings: state.warnings.clone(),
        }
    }
}

/// Decision category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Architectural,
    Technical,
    Process,
    Tooling,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Architectural => "architectural",
            Category::Technical => "technical",
            Category::Process => "process",
            Category::Tooling => "tooling",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "architectural" => Ok(Category::Architectural),
            "technical" => Ok(Category::Technical),
            "process" => Ok(Category::Process),
            "tooling" => Ok(Category::Tooling),
            other => Err(format!(
                "unknown category '{}' (expected architectural, technical, process or tooling)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    High,
    #[default]
    Medium,
    Low,
}

impl FromStr for Impact {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Impact::High),
            "medium" => Ok(Impact::Medium),
            "low" => Ok(Impact::Low),
            other => Err(format!("unknown impact '{}' (expected high, medium or low)", other)),
        }
    }
}

/// Immutable decision record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub timestamp: String,
    pub workspace: String,
    pub category: Category,
    pub decision: String,
    pub rationale: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub impact: Impact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisit_trigger: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = parse_timestamp("2025-01-01T09:00:00.000Z").unwrap();
        let later = parse_timestamp("2025-01-01T10:00:00.000Z").unwrap();
        let a = format_timestamp(earlier);
        let b = format_timestamp(later);
        assert!(a < b);
        assert_eq!(a, "2025-01-01T09:00:00.000Z");
    }

    #[test]
    fn test_offset_timestamps_normalize_to_utc() {
        let parsed = parse_timestamp("2025-01-01T12:00:00+02:00").unwrap();
        assert_eq!(format_timestamp(parsed), "2025-01-01T10:00:00.000Z");
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&Trigger::Gitflow).unwrap(), "\"gitflow\"");
        assert_eq!(serde_json::to_string(&OperationResult::Partial).unwrap(), "\"partial\"");
        assert_eq!("architectural".parse::<Category>().unwrap(), Category::Architectural);
        assert!("strategic".parse::<Category>().is_err());
    }

    #[test]
    fn test_checkpoint_state_from_session_state() {
        let state = SessionState {
            workspace: "w".to_string(),
            timestamp: now_timestamp(),
            phase: "testing".to_string(),
            completed_operations: vec![CompletedOperation::now("ran tests", OperationResult::Success)],
            active_files: vec!["src/lib.rs".to_string()],
            decisions_made: vec![],
            next_steps: vec!["ship it".to_string()],
            git: GitState::default(),
            warnings: vec![],
            metadata: BTreeMap::new(),
        };
        let payload = CheckpointState::from(&state);
        assert_eq!(payload.phase.as_deref(), Some("testing"));
        assert_eq!(payload.completed_operations.len(), 1);
        assert_eq!(payload.next_steps, vec!["ship it".to_string()]);
    }
}
