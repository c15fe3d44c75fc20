//! Markdown rendering of a session snapshot
//!
//! Derived artifact only: the JSON snapshot is the source of truth.

use crate::types::{OperationResult, SessionState};
use std::fmt::Write;

fn result_marker(result: OperationResult) -> &'static str {
    match result {
        OperationResult::Success => "[OK]",
        OperationResult::Failure => "[FAIL]",
        OperationResult::Partial => "[PARTIAL]",
    }
}

/// Render a snapshot as a handoff briefing for the next session
pub fn render_markdown(state: &SessionState) -> String {
    let mut md = String::new();

    writeln!(md, "# Session Handoff: {}", state.workspace).unwrap();
    writeln!(md).unwrap();
    writeln!(md, "**Saved:** {}", state.timestamp).unwrap();
    writeln!(md, "**Phase:** {}", state.phase).unwrap();
    if let Some(ref branch) = state.git.branch {
        let dirty = if state.git.uncommitted { " (uncommitted changes)" } else { "" };
        writeln!(md, "**Branch:** `{}`{}", branch, dirty).unwrap();
    }
    writeln!(md).unwrap();

    if !state.next_steps.is_empty() {
        writeln!(md, "## Next Steps").unwrap();
        writeln!(md).unwrap();
        for (i, step) in state.next_steps.iter().enumerate() {
            writeln!(md, "{}. {}", i + 1, step).unwrap();
        }
        writeln!(md).unwrap();
    }

    if !state.warnings.is_empty() {
        writeln!(md, "## Warnings").unwrap();
        writeln!(md).unwrap();
        for warning in &state.warnings {
            writeln!(md, "- [WARN] {}", warning).unwrap();
        }
        writeln!(md).unwrap();
    }

    if !state.decisions_made.is_empty() {
        writeln!(md, "## Decisions").unwrap();
        writeln!(md).unwrap();
        for decision in &state.decisions_made {
            writeln!(md, "- {}", decision).unwrap();
        }
        writeln!(md).unwrap();
    }

    if !state.active_files.is_empty() {
        writeln!(md, "## Active Files").unwrap();
        writeln!(md).unwrap();
        for file in &state.active_files {
            writeln!(md, "- `{}`", file).unwrap();
        }
        writeln!(md).unwrap();
    }

    if !state.completed_operations.is_empty() {
        writeln!(md, "## Completed Operations").unwrap();
        writeln!(md).unwrap();
        for op in &state.completed_operations {
            writeln!(md, "- {} {} ({})", result_marker(op.result), op.description, op.timestamp).unwrap();
        }
        writeln!(md).unwrap();
    }

    if !state.metadata.is_empty() {
        writeln!(md, "## Metadata").unwrap();
        writeln!(md).unwrap();
        for (key, value) in &state.metadata {
            writeln!(md, "- **{}:** {}", key, value).unwrap();
        }
        writeln!(md).unwrap();
    }

    md
}
