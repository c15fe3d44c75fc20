//! Source-control probes
//!
//! Best effort: outside a repository, or without git installed, every probe
//! returns `None`/`false` instead of failing.

use crate::types::GitState;
use std::process::Command;

fn git_output(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout).ok()
            } else {
                None
            }
        })
}

/// Get current git branch name
pub fn current_branch() -> Option<String> {
    git_output(&["rev-parse", "--abbrev-ref", "HEAD"])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s != "HEAD")
}

/// Get the current HEAD commit hash (short form, 7 chars)
pub fn current_commit() -> Option<String> {
    git_output(&["rev-parse", "--short", "HEAD"])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Whether the working tree has uncommitted changes
pub fn has_uncommitted_changes() -> bool {
    git_output(&["status", "--porcelain"])
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

pub fn current_state() -> GitState {
    GitState {
        branch: current_branch(),
        uncommitted: has_uncommitted_changes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probes_never_panic() {
        // Works inside or outside a repository
        let state = current_state();
        if let Some(branch) = state.branch {
            assert!(!branch.is_empty());
            assert_ne!(branch, "HEAD");
        }
        if let Some(commit) = current_commit() {
            assert!(!commit.is_empty());
        }
    }
}
