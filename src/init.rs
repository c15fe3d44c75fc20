//! Data directory bootstrap
//!
//! `evergreen init` (and the first open of a fresh directory) lays out
//! everything the stores expect and writes the resolved config back.

use crate::config::Config;
use crate::error::Result;
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};

const GITIGNORE: &str = "# Local state - snapshots and decisions are worth committing, the database is not\nevergreen.db\nevergreen.db-*\n*.tmp\n";

fn ensure_dir(path: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        created.push(path.to_path_buf());
    }
    Ok(())
}

fn ensure_file(path: &Path, contents: &str, created: &mut Vec<PathBuf>) -> Result<()> {
    if !path.exists() {
        fs::write(path, contents)?;
        created.push(path.to_path_buf());
    }
    Ok(())
}

/// Create whatever is missing; returns the paths that were created
pub fn bootstrap(config: &Config) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();

    ensure_dir(config.data_dir(), &mut created)?;
    ensure_dir(&config.sessions_dir(), &mut created)?;
    ensure_dir(&config.decisions_dir(), &mut created)?;
    ensure_file(&config.decision_log_path(), "", &mut created)?;
    ensure_file(&config.data_dir().join(".gitignore"), GITIGNORE, &mut created)?;

    if config.write_if_missing()? {
        created.push(config.config_path());
    }

    Ok(created)
}

/// Print what `bootstrap` did
pub fn print_report(config: &Config, created: &[PathBuf]) {
    if created.is_empty() {
        println!(
            "{} {} already initialized",
            "ok".green().bold(),
            config.data_dir().display()
        );
        return;
    }
    for path in created {
        println!("   {} {}", "Creating".green(), path.display());
    }
    println!(
        "\n{} session continuity ready in {}",
        "Initialized".green().bold(),
        config.data_dir().display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bootstrap_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp.path().join(".evergreen"));

        let created = bootstrap(&config).unwrap();
        assert!(created.contains(&config.sessions_dir()));
        assert!(created.contains(&config.decision_log_path()));
        assert!(created.contains(&config.config_path()));
        assert_eq!(fs::read_to_string(config.decision_log_path()).unwrap(), "");

        assert!(bootstrap(&config).unwrap().is_empty());
    }

    #[test]
    fn test_bootstrap_writes_resolved_config() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join(".evergreen");
        let mut config = Config::with_data_dir(&data_dir);
        config.checkpoint.escalation_threshold = 9;
        bootstrap(&config).unwrap();

        let reloaded = Config::load_from_data_dir(&data_dir).unwrap();
        assert_eq!(reloaded.checkpoint.escalation_threshold, 9);
    }
}
