//! Append-only decision log
//!
//! One JSON record per line. An empty or missing file is a valid log with zero
//! decisions; a corrupt line is dropped on read and the rest stay queryable.

use crate::error::{Error, Result};
use crate::types::{Category, Decision};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Filters for `DecisionLog::query`, all ANDed; `None` matches everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionFilter {
    pub workspace: Option<String>,
    pub category: Option<Category>,
    /// Inclusive lower bound, compared lexically against the timestamp
    pub since: Option<String>,
    /// Case-insensitive substring of decision, rationale or alternatives
    pub keyword: Option<String>,
}

impl DecisionFilter {
    pub fn matches(&self, decision: &Decision) -> bool {
        if let Some(ref ws) = self.workspace {
            if &decision.workspace != ws {
                return false;
            }
        }
        if let Some(category) = self.category {
            if decision.category != category {
                return false;
            }
        }
        if let Some(ref since) = self.since {
            if decision.timestamp.as_str() < since.as_str() {
                return false;
            }
        }
        if let Some(ref keyword) = self.keyword {
            let haystack = format!(
                "{} {} {}",
                decision.decision,
                decision.rationale,
                decision.alternatives.join(" ")
            )
            .to_lowercase();
            if !haystack.contains(&keyword.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// JSONL-backed decision log
#[derive(Debug, Clone)]
pub struct DecisionLog {
    path: PathBuf,
}

impl DecisionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line
    ///
    /// The whole line goes out in one `write_all` on an append-mode handle.
    pub fn append(&self, decision: &Decision) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_string(decision)
            .map_err(|e| Error::Storage(format!("failed to serialize decision: {}", e)))?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        debug!(id = %decision.id, workspace = %decision.workspace, "decision appended");
        Ok(())
    }

    /// Every parseable record, in append order
    pub fn read_all(&self) -> Result<Vec<Decision>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut decisions = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Decision>(&line) {
                Ok(decision) => decisions.push(decision),
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "skipping malformed decision record");
                }
            }
        }
        Ok(decisions)
    }

    pub fn query(&self, filter: &DecisionFilter) -> Result<Vec<Decision>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect())
    }
}
