//! Context compression under a token budget
//!
//! Lines are triaged, not summarized: anything that carries a decision, a next
//! step, a warning or a caller-pinned string survives verbatim; plain prose is
//! admitted afterwards only while the budget lasts.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref WARNING_MARKER: Regex = Regex::new(
        r"(?i)(⚠|❌|✗|\[(warn|warning|fail|failed|error)\]|\b(warning|error|failed|failure)\b)"
    )
    .unwrap();
    static ref PROGRESS_MARKER: Regex =
        Regex::new(r"(?i)(✅|✓|✔|🔄|⏳|\[(ok|done|success|wip|in[ -]progress)\])\s*").unwrap();
}

/// Rough token count: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressedContext {
    pub compressed: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub ratio: f64,
}

/// How a line is treated; first matching rule wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineClass {
    Preserved,
    Heading,
    Decision,
    NextStep,
    Warning,
    Progress,
    Compressible,
}

fn classify(line: &str, preserve: &[&str]) -> LineClass {
    if preserve.iter().any(|p| line.contains(p)) {
        return LineClass::Preserved;
    }
    if line.trim_start().starts_with('#') {
        return LineClass::Heading;
    }
    let lower = line.to_lowercase();
    if lower.contains("decision") || lower.contains("ratified") {
        return LineClass::Decision;
    }
    if lower.contains("next") || lower.contains("todo") {
        return LineClass::NextStep;
    }
    if WARNING_MARKER.is_match(line) {
        return LineClass::Warning;
    }
    if PROGRESS_MARKER.is_match(line) {
        return LineClass::Progress;
    }
    LineClass::Compressible
}

fn ratio(original: usize, compressed: usize) -> f64 {
    (original as f64 / compressed.max(1) as f64 * 10.0).round() / 10.0
}

/// Compress `text` toward `target_tokens`
///
/// Text already within budget comes back untouched. Otherwise kept lines are
/// emitted first in original order (progress markers stripped), then plain
/// lines in original order until the first one that would overflow the
/// remaining budget.
pub fn compress(text: &str, target_tokens: usize, preserve: &[String]) -> CompressedContext {
    let original_tokens = estimate_tokens(text);
    if original_tokens <= target_tokens {
        return CompressedContext {
            compressed: text.to_string(),
            original_tokens,
            compressed_tokens: original_tokens,
            ratio: 1.0,
        };
    }

    let preserve: Vec<&str> = preserve.iter().map(String::as_str).filter(|p| !p.is_empty()).collect();

    let mut kept: Vec<String> = Vec::new();
    let mut compressible: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        match classify(line, &preserve) {
            LineClass::Compressible => compressible.push(line),
            LineClass::Progress => kept.push(PROGRESS_MARKER.replace_all(line, "").trim_end().to_string()),
            _ => kept.push(line.to_string()),
        }
    }

    let mut output = kept.join("\n");
    let used = estimate_tokens(&output);
    if used < target_tokens {
        let budget_chars = (target_tokens - used) * 4;
        let mut added = 0;
        for line in compressible {
            let len = line.chars().count();
            if added + len > budget_chars {
                break;
            }
            added += len;
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(line);
        }
    }

    let compressed_tokens = estimate_tokens(&output);
    CompressedContext {
        compressed: output,
        original_tokens,
        compressed_tokens,
        ratio: ratio(original_tokens, compressed_tokens),
    }
}
