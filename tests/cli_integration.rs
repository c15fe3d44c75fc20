//! Integration tests for the evergreen CLI
//!
//! These tests exercise the full CLI workflow against a temporary data
//! directory. They verify that commands work end-to-end without mocking.

use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

/// Helper to run evergreen with a specific data directory
fn run_evergreen(args: &[&str], data_dir: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_evergreen"))
        .args(args)
        .env("EVERGREEN_DATA_DIR", data_dir)
        .env_remove("EVERGREEN_LOG")
        .output()
        .expect("Failed to execute evergreen")
}

/// Helper to get stdout as string
fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Helper to get stderr as string
fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Run a command that must succeed and parse its JSON output
fn run_json(args: &[&str], data_dir: &Path) -> serde_json::Value {
    let output = run_evergreen(args, data_dir);
    assert!(
        output.status.success(),
        "{:?} failed: {}",
        args,
        stderr(&output)
    );
    serde_json::from_str(&stdout(&output)).expect("stdout should be JSON")
}

fn data_dir(temp: &TempDir) -> std::path::PathBuf {
    temp.path().join(".evergreen")
}

// =============================================================================
// Basic Command Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_evergreen"))
        .arg("--help")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("evergreen"));
    assert!(out.contains("checkpoint"));
}

#[test]
fn test_version_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_evergreen"))
        .arg("--version")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    assert!(stdout(&output).contains("evergreen"));
}

#[test]
fn test_completion_zsh() {
    let output = Command::new(env!("CARGO_BIN_EXE_evergreen"))
        .args(["completion", "zsh"])
        .output()
        .expect("Failed to execute");

    assert!(
        output.status.success(),
        "completion zsh failed: {}",
        stderr(&output)
    );
    assert!(
        stdout(&output).contains("#compdef evergreen"),
        "zsh completion should contain #compdef"
    );
}

// =============================================================================
// Init
// =============================================================================

#[test]
fn test_init_creates_layout() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);

    let output = run_evergreen(&["init"], &dir);
    assert!(output.status.success(), "init failed: {}", stderr(&output));
    assert!(dir.join("config.toml").exists());
    assert!(dir.join("evergreen.db").exists());
    assert!(dir.join("sessions").is_dir());
    assert!(dir.join("decisions").join("decisions.jsonl").exists());

    let again = run_evergreen(&["init"], &dir);
    assert!(again.status.success());
    assert!(stdout(&again).contains("already initialized"));
}

// =============================================================================
// Checkpoint, save, load, recover
// =============================================================================

#[test]
fn test_checkpoints_accumulate_across_processes() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);

    let first = run_json(
        &["checkpoint", "-w", "api", "-o", "added routes", "--next", "write handlers", "--phase", "build"],
        &dir,
    );
    assert_eq!(first["checkpoint_count"], 1);
    assert_eq!(first["auto_escalated"], false);

    let second = run_json(&["checkpoint", "-w", "api", "-o", "wrote handlers", "--trigger", "auto"], &dir);
    assert_eq!(second["checkpoint_count"], 1);
    assert_eq!(second["session_id"], first["session_id"]);

    let history = run_json(&["checkpoints", "-w", "api"], &dir);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["operation"], "wrote handlers");
    assert_eq!(history[0]["trigger_source"], "auto");
    // The newest checkpoint carries both operations and the earlier next step
    let state: serde_json::Value =
        serde_json::from_str(history[0]["state_json"].as_str().unwrap()).unwrap();
    assert_eq!(state["completed_operations"].as_array().unwrap().len(), 2);
    assert_eq!(state["next_steps"][0], "write handlers");
}

#[test]
fn test_crash_is_reported_once() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);

    run_json(&["checkpoint", "-w", "api", "-o", "started", "--file", "src/lib.rs"], &dir);

    let recovery = run_json(&["recover", "-w", "api"], &dir);
    assert_eq!(recovery["detected"], true);
    assert_eq!(recovery["operations_lost"], 0);
    assert_eq!(recovery["last_checkpoint"]["active_files"][0], "src/lib.rs");

    let again = run_json(&["recover", "-w", "api"], &dir);
    assert_eq!(again["detected"], false);
}

#[test]
fn test_save_then_load() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);

    let saved = run_json(
        &[
            "save", "-w", "api", "-p", "implementation",
            "--op", "router skeleton",
            "--op", "failure:load test",
            "--next", "Profile the slow endpoint",
            "--file", "src/router.rs",
            "--decision", "Use axum",
            "--branch", "feature/router",
            "--meta", "ticket=API-7",
        ],
        &dir,
    );
    assert!(Path::new(saved["json_path"].as_str().unwrap()).exists());
    assert!(Path::new(saved["markdown_path"].as_str().unwrap()).exists());
    assert!(saved["handoff_score"]["score"].as_u64().unwrap() > 0);

    let clean = run_json(&["recover", "-w", "api"], &dir);
    assert_eq!(clean["detected"], false);

    let loaded = run_json(&["load", "-w", "api"], &dir);
    assert_eq!(loaded["found"], true);
    assert_eq!(loaded["state"]["phase"], "implementation");
    assert_eq!(loaded["state"]["completed_operations"][1]["result"], "failure");
    assert_eq!(loaded["state"]["metadata"]["ticket"], "API-7");

    let markdown = run_evergreen(&["load", "-w", "api", "--markdown"], &dir);
    assert!(markdown.status.success());
    assert!(stdout(&markdown).contains("Profile the slow endpoint"));
}

#[test]
fn test_load_with_nothing_saved() {
    let temp = TempDir::new().unwrap();
    let loaded = run_json(&["load"], &data_dir(&temp));
    assert_eq!(loaded["found"], false);
    assert!(loaded["state"].is_null());
}

#[test]
fn test_save_requires_phase() {
    let temp = TempDir::new().unwrap();
    let output = run_evergreen(&["save", "-w", "api", "-p", " "], &data_dir(&temp));
    assert!(!output.status.success());
    assert!(stderr(&output).contains("phase is required"));
}

// =============================================================================
// Decisions
// =============================================================================

#[test]
fn test_decide_and_query() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);

    let first = run_json(
        &["decide", "-w", "api", "-c", "technical", "-d", "Use SQLite for state", "-r", "zero setup", "--alt", "postgres"],
        &dir,
    );
    assert!(first["warning"].is_null());

    let output = run_evergreen(
        &["decide", "-w", "api", "-c", "technical", "-d", "Use SQLite for sessions", "-r", "same reason"],
        &dir,
    );
    assert!(output.status.success());
    assert!(stderr(&output).contains("Warning:"));
    let second: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let warning = second["warning"].as_str().unwrap();
    assert!(warning.contains(first["decision"]["id"].as_str().unwrap()));

    let all = run_json(&["decisions"], &dir);
    assert_eq!(all["count"], 2);
    assert_eq!(all["decisions"][0]["decision"], "Use SQLite for state");

    let by_keyword = run_json(&["decisions", "-k", "POSTGRES"], &dir);
    assert_eq!(by_keyword["count"], 1);

    let by_category = run_json(&["decisions", "-c", "process"], &dir);
    assert_eq!(by_category["count"], 0);
}

#[test]
fn test_decide_rejects_unknown_category() {
    let temp = TempDir::new().unwrap();
    let output = run_evergreen(
        &["decide", "-w", "api", "-c", "vibes", "-d", "x", "-r", "y"],
        &data_dir(&temp),
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown category"));
}

// =============================================================================
// Pure operations
// =============================================================================

#[test]
fn test_compress_from_file() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("notes.md");
    std::fs::write(&input, "# Title\nDecision: use X\nrandom line\n[OK] built thing").unwrap();

    let result = run_json(
        &["compress", "-i", input.to_str().unwrap(), "-t", "1"],
        &data_dir(&temp),
    );
    assert_eq!(result["compressed"], "# Title\nDecision: use X\nbuilt thing");
    assert_eq!(result["original_tokens"], 13);
    assert_eq!(result["ratio"], 1.4);
}

#[test]
fn test_score_reports_missing_fields() {
    let temp = TempDir::new().unwrap();
    let report = run_json(&["score", "-w", "api"], &data_dir(&temp));
    assert_eq!(report["score"], 10);
    assert_eq!(report["threshold"], 80);
    assert_eq!(report["meets_threshold"], false);
    let missing = report["missing"].as_array().unwrap();
    assert!(missing.iter().any(|m| m == "next_steps"));
}
