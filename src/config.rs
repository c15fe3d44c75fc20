//! Configuration file support for evergreen
//!
//! Reads from .evergreen/config.toml

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the data directory, looked up like `.git`
pub const DATA_DIR_NAME: &str = ".evergreen";

/// Overrides the data directory outright when set
pub const DATA_DIR_ENV: &str = "EVERGREEN_DATA_DIR";

const CONFIG_FILE: &str = "config.toml";
const DB_FILE: &str = "evergreen.db";
const DECISION_LOG_FILE: &str = "decisions.jsonl";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Where state lives on disk
    #[serde(default)]
    pub storage: StorageConfig,

    /// Checkpoint history and escalation
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Context compression defaults
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Handoff completeness gate
    #[serde(default)]
    pub handoff: HandoffConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Data directory root
    /// Default: ".evergreen"
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Session snapshots, relative to `data_dir` unless absolute
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Decision log, relative to `data_dir` unless absolute
    #[serde(default = "default_decisions_dir")]
    pub decisions_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CheckpointConfig {
    /// Checkpoints kept per workspace after each write
    /// Default: 50
    #[serde(default = "default_keep")]
    pub keep: usize,

    /// Checkpoints between automatic escalations to a full snapshot
    /// Default: 15
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CompressionConfig {
    /// Default: 1000
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HandoffConfig {
    /// Minimum score a saved handoff should reach
    /// Default: 80
    #[serde(default = "default_score_threshold")]
    pub score_threshold: u8,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DATA_DIR_NAME)
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_decisions_dir() -> PathBuf {
    PathBuf::from("decisions")
}

fn default_keep() -> usize {
    50
}

fn default_escalation_threshold() -> u32 {
    15
}

fn default_target_tokens() -> usize {
    1000
}

fn default_score_threshold() -> u8 {
    80
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sessions_dir: default_sessions_dir(),
            decisions_dir: default_decisions_dir(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            keep: default_keep(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
        }
    }
}

impl Config {
    /// Default config rooted at an explicit data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    /// Load config for the current directory
    ///
    /// `EVERGREEN_DATA_DIR` wins over discovery. Otherwise walks up looking for
    /// `.evergreen/config.toml`; falls back to defaults rooted at `./.evergreen`.
    pub fn load() -> Result<Self> {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            let dir = PathBuf::from(dir);
            return Self::load_from_data_dir(&dir);
        }

        match Self::find_data_dir() {
            Some(dir) => Self::load_from_data_dir(&dir),
            None => Ok(Self::default()),
        }
    }

    /// Load `<data_dir>/config.toml`, or defaults if it does not exist yet
    ///
    /// The returned config always points at `data_dir`, whatever the file says.
    pub fn load_from_data_dir(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str::<Config>(&contents)
                .map_err(|e| Error::malformed(path.display().to_string(), e))?
        } else {
            Self::default()
        };
        config.storage.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    /// Write the resolved config back so later runs see the same values
    ///
    /// Returns false when a config file already existed.
    pub fn write_if_missing(&self) -> Result<bool> {
        let path = self.config_path();
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Storage(format!("failed to serialize config: {}", e)))?;
        std::fs::write(&path, contents)?;
        Ok(true)
    }

    /// Find .evergreen by walking up directory tree
    fn find_data_dir() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let data_dir = dir.join(DATA_DIR_NAME);
            if data_dir.join(CONFIG_FILE).exists() {
                return Some(data_dir);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    pub fn data_dir(&self) -> &Path {
        &self.storage.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage.data_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage.data_dir.join(DB_FILE)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.sessions_dir)
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.decisions_dir)
    }

    pub fn decision_log_path(&self) -> PathBuf {
        self.decisions_dir().join(DECISION_LOG_FILE)
    }
}
