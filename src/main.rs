//! Evergreen CLI
//!
//! Every command prints its result as pretty JSON on stdout. Logs go to stderr,
//! filtered by `EVERGREEN_LOG` (default `warn`).

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use evergreen::{
    git, init, Category, CheckpointRequest, CheckpointUpdate, CompletedOperation, CompressRequest,
    Config, Continuity, DecisionFilter, Error, HandoffFields, Impact, LoadRequest,
    LogDecisionRequest, OperationResult, Result, SaveRequest, Trigger,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "EVERGREEN_LOG";

#[derive(Parser, Debug)]
#[command(name = "evergreen")]
#[command(author, version, about = "Session continuity: checkpoints, handoffs and crash recovery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the data directory, database and default config
    Init,

    /// Write a full session snapshot and end the session cleanly
    Save {
        #[arg(short, long)]
        workspace: String,

        #[arg(short, long)]
        phase: String,

        /// Completed operation, optionally prefixed `failure:` or `partial:` (repeatable)
        #[arg(long = "op")]
        operations: Vec<String>,

        /// Active file (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Decision made this session (repeatable)
        #[arg(long = "decision")]
        decisions: Vec<String>,

        /// Next step, in order (repeatable)
        #[arg(long = "next")]
        next_steps: Vec<String>,

        /// Warning for whoever resumes (repeatable)
        #[arg(long = "warning")]
        warnings: Vec<String>,

        /// Branch name (default: probed from git)
        #[arg(long)]
        branch: Option<String>,

        /// Mark the working tree dirty (default: probed from git)
        #[arg(long)]
        uncommitted: bool,

        /// Commit hash for the final checkpoint (default: probed from git)
        #[arg(long)]
        git_hash: Option<String>,

        /// Metadata entry as key=value (repeatable)
        #[arg(long = "meta")]
        metadata: Vec<String>,
    },

    /// Resume from the newest matching snapshot
    Load {
        #[arg(short, long)]
        workspace: Option<String>,

        /// Snapshot stem or session id
        #[arg(short, long)]
        session_id: Option<String>,

        /// Print only the markdown rendering
        #[arg(long)]
        markdown: bool,
    },

    /// Record a checkpoint after completing an operation
    Checkpoint {
        #[arg(short, long)]
        workspace: String,

        /// What was just completed
        #[arg(short, long)]
        operation: String,

        #[arg(long, default_value = "success")]
        result: OperationResult,

        #[arg(short, long)]
        phase: Option<String>,

        /// Replaces the active file list (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Empty the active file list
        #[arg(long, conflicts_with = "files")]
        clear_files: bool,

        /// Replaces the next-step list (repeatable)
        #[arg(long = "next")]
        next_steps: Vec<String>,

        /// Empty the next-step list
        #[arg(long, conflicts_with = "next_steps")]
        clear_next: bool,

        /// Decision to add (repeatable)
        #[arg(long = "decision")]
        decisions: Vec<String>,

        /// Warning to add (repeatable)
        #[arg(long = "warning")]
        warnings: Vec<String>,

        /// Commit hash (default: probed from git)
        #[arg(long)]
        git_hash: Option<String>,

        /// manual, shim, kernl, gitflow or auto
        #[arg(long, default_value = "manual")]
        trigger: Trigger,
    },

    /// Report and consume the latest session that did not end cleanly
    Recover {
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// Append a decision to the log
    Decide {
        #[arg(short, long)]
        workspace: String,

        /// architectural, technical, process or tooling
        #[arg(short, long)]
        category: Category,

        #[arg(short, long)]
        decision: String,

        #[arg(short, long)]
        rationale: String,

        /// Alternative considered (repeatable)
        #[arg(long = "alt")]
        alternatives: Vec<String>,

        /// high, medium or low
        #[arg(long, default_value = "medium")]
        impact: Impact,

        /// Condition under which to reconsider
        #[arg(long)]
        revisit: Option<String>,
    },

    /// Query the decision log
    Decisions {
        #[arg(short, long)]
        workspace: Option<String>,

        #[arg(short, long)]
        category: Option<Category>,

        /// Inclusive lower bound on the timestamp
        #[arg(long)]
        since: Option<String>,

        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Compress text toward a token budget
    Compress {
        /// Input file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Token budget (default: from config)
        #[arg(short, long)]
        target: Option<usize>,

        /// Keep any line containing this string (repeatable)
        #[arg(long)]
        preserve: Vec<String>,

        /// Print only the compressed text
        #[arg(long)]
        text_only: bool,
    },

    /// Score how resumable a handoff would be
    Score {
        #[arg(short, long)]
        workspace: Option<String>,

        #[arg(short, long)]
        phase: Option<String>,

        #[arg(long = "next")]
        next_steps: Vec<String>,

        #[arg(long = "file")]
        files: Vec<String>,

        #[arg(long = "op")]
        operations: Vec<String>,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long = "warning")]
        warnings: Vec<String>,

        #[arg(long = "decision")]
        decisions: Vec<String>,
    },

    /// List a workspace's checkpoint history, newest first
    Checkpoints {
        #[arg(short, long)]
        workspace: String,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Generate shell completions
    Completion {
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(cli.command) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Storage(format!("failed to serialize output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// `failure:wrote parser` -> failure, anything without a known prefix -> success
fn parse_operation(raw: &str) -> CompletedOperation {
    if let Some((head, rest)) = raw.split_once(':') {
        if let Ok(result) = head.trim().parse::<OperationResult>() {
            return CompletedOperation::now(rest.trim(), result);
        }
    }
    CompletedOperation::now(raw.trim(), OperationResult::Success)
}

fn parse_metadata(entries: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut metadata = BTreeMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(Error::Validation(format!(
                "metadata '{}' is not in key=value form",
                entry
            )));
        };
        metadata.insert(key.trim().to_string(), serde_json::json!(value.trim()));
    }
    Ok(metadata)
}

/// Absent flags leave the list alone; an explicit clear empties it
fn replacement(values: Vec<String>, clear: bool) -> Option<Vec<String>> {
    if clear {
        Some(Vec::new())
    } else if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// The flag wins; git is only asked when it is absent
fn working_tree_dirty(flag: bool, ask_git: impl FnOnce() -> bool) -> bool {
    flag || ask_git()
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "evergreen", &mut io::stdout());
            Ok(())
        }

        Command::Init => {
            let config = Config::load()?;
            let created = init::bootstrap(&config)?;
            Continuity::open(config.clone())?;
            init::print_report(&config, &created);
            Ok(())
        }

        Command::Save {
            workspace,
            phase,
            operations,
            files,
            decisions,
            next_steps,
            warnings,
            branch,
            uncommitted,
            git_hash,
            metadata,
        } => {
            let continuity = Continuity::open(Config::load()?)?;
            let request = SaveRequest {
                workspace,
                phase,
                completed_operations: operations.iter().map(|op| parse_operation(op)).collect(),
                active_files: files,
                decisions_made: decisions,
                next_steps,
                git_branch: branch.or_else(git::current_branch),
                uncommitted: working_tree_dirty(uncommitted, git::has_uncommitted_changes),
                git_hash: git_hash.or_else(git::current_commit),
                warnings,
                metadata: parse_metadata(&metadata)?,
            };
            print_json(&continuity.save_session(request)?)
        }

        Command::Load {
            workspace,
            session_id,
            markdown,
        } => {
            let continuity = Continuity::open(Config::load()?)?;
            let result = continuity.load_session(LoadRequest {
                workspace,
                session_id,
            })?;
            if markdown {
                match result.markdown {
                    Some(ref text) => println!("{}", text),
                    None => eprintln!("No snapshot found; starting fresh."),
                }
                return Ok(());
            }
            print_json(&result)
        }

        Command::Checkpoint {
            workspace,
            operation,
            result,
            phase,
            files,
            clear_files,
            next_steps,
            clear_next,
            decisions,
            warnings,
            git_hash,
            trigger,
        } => {
            let continuity = Continuity::open(Config::load()?)?;
            let update = CheckpointUpdate {
                operation,
                result: Some(result),
                phase,
                active_files: replacement(files, clear_files),
                next_steps: replacement(next_steps, clear_next),
                decisions,
                warnings,
                git_hash: git_hash.or_else(git::current_commit),
                trigger,
            };
            print_json(&continuity.checkpoint(CheckpointRequest { workspace, update })?)
        }

        Command::Recover { workspace } => {
            let continuity = Continuity::open(Config::load()?)?;
            print_json(&continuity.recover_crash(workspace.as_deref())?)
        }

        Command::Decide {
            workspace,
            category,
            decision,
            rationale,
            alternatives,
            impact,
            revisit,
        } => {
            let continuity = Continuity::open(Config::load()?)?;
            let result = continuity.log_decision(LogDecisionRequest {
                workspace,
                category,
                decision,
                rationale,
                alternatives,
                impact,
                revisit_trigger: revisit,
            })?;
            if let Some(ref warning) = result.warning {
                eprintln!("{} {}", "Warning:".yellow().bold(), warning);
            }
            print_json(&result)
        }

        Command::Decisions {
            workspace,
            category,
            since,
            keyword,
        } => {
            let continuity = Continuity::open(Config::load()?)?;
            let filter = DecisionFilter {
                workspace,
                category,
                since,
                keyword,
            };
            print_json(&continuity.query_decisions(&filter)?)
        }

        Command::Compress {
            input,
            target,
            preserve,
            text_only,
        } => {
            let continuity = Continuity::open(Config::load()?)?;
            let text = match input {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let result = continuity.compress_context(&CompressRequest {
                text,
                target_tokens: target,
                preserve,
            })?;
            if text_only {
                println!("{}", result.compressed);
                return Ok(());
            }
            print_json(&result)
        }

        Command::Score {
            workspace,
            phase,
            next_steps,
            files,
            operations,
            branch,
            warnings,
            decisions,
        } => {
            let continuity = Continuity::open(Config::load()?)?;
            let fields = HandoffFields {
                workspace,
                phase,
                next_steps,
                active_files: files,
                completed_operations: operations,
                git_branch: branch,
                warnings,
                decisions_made: decisions,
            };
            print_json(&continuity.score_handoff(&fields))
        }

        Command::Checkpoints { workspace, limit } => {
            let continuity = Continuity::open(Config::load()?)?;
            print_json(&continuity.list_checkpoints(&workspace, limit)?)
        }
    }
}
