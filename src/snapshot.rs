//! Session snapshot artifacts
//!
//! Each save or escalation writes `<date>_<workspace>_<time>[_auto].json` plus a
//! `.md` rendering beside it. Files are never rewritten after the rename that
//! publishes them.

use crate::error::{Error, Result};
use crate::render::render_markdown;
use crate::types::{parse_timestamp, SessionState};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Metadata key under which a snapshot records the session it closed
pub const SESSION_ID_KEY: &str = "session_id";

/// Paths of one published snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

/// A snapshot read back from disk
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub state: SessionState,
    pub paths: SnapshotPaths,
    pub markdown: String,
}

/// Reduce a workspace name to something safe inside a file name
pub fn workspace_slug(workspace: &str) -> String {
    let slug: String = workspace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if slug.is_empty() {
        "workspace".to_string()
    } else {
        slug
    }
}

/// `(date, time)` parsed out of a snapshot file stem, used as the sort key
fn stem_sort_key(stem: &str) -> (String, String) {
    let stem = stem.strip_suffix("_auto").unwrap_or(stem);
    let date = stem.split('_').next().unwrap_or_default().to_string();
    let time = stem.rsplit('_').next().unwrap_or_default().to_string();
    (date, time)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Directory of snapshot artifacts
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic file stem from the snapshot's own timestamp
    pub fn file_stem(state: &SessionState, auto: bool) -> String {
        let at = parse_timestamp(&state.timestamp).unwrap_or_else(Utc::now);
        let mut stem = format!(
            "{}_{}_{}",
            at.format("%Y-%m-%d"),
            workspace_slug(&state.workspace),
            at.format("%H-%M-%S-%3f")
        );
        if auto {
            stem.push_str("_auto");
        }
        stem
    }

    /// Persist the structured record and its markdown rendering
    pub fn write(&self, state: &SessionState, auto: bool) -> Result<SnapshotPaths> {
        std::fs::create_dir_all(&self.dir)?;

        let stem = Self::file_stem(state, auto);
        let paths = SnapshotPaths {
            json: self.dir.join(format!("{}.json", stem)),
            markdown: self.dir.join(format!("{}.md", stem)),
        };

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| Error::Storage(format!("failed to serialize snapshot: {}", e)))?;
        write_atomic(&paths.json, &json)?;
        write_atomic(&paths.markdown, &render_markdown(state))?;

        debug!(workspace = %state.workspace, path = %paths.json.display(), auto, "snapshot written");
        Ok(paths)
    }

    /// Snapshot file stems, newest first
    fn list_stems(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut stems = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }

        stems.sort_by(|a, b| {
            (stem_sort_key(b), b.as_str()).cmp(&(stem_sort_key(a), a.as_str()))
        });
        Ok(stems)
    }

    /// Read one snapshot by file stem
    pub fn read(&self, stem: &str) -> Result<StoredSnapshot> {
        let paths = SnapshotPaths {
            json: self.dir.join(format!("{}.json", stem)),
            markdown: self.dir.join(format!("{}.md", stem)),
        };
        let contents = match std::fs::read_to_string(&paths.json) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("snapshot {}", stem)));
            }
            Err(e) => return Err(e.into()),
        };
        let state: SessionState = serde_json::from_str(&contents)
            .map_err(|e| Error::malformed(format!("snapshot {}", stem), e))?;
        let markdown = std::fs::read_to_string(&paths.markdown)
            .unwrap_or_else(|_| render_markdown(&state));

        Ok(StoredSnapshot { state, paths, markdown })
    }

    /// Read a stem, skipping it if it does not parse
    fn read_lenient(&self, stem: &str) -> Result<Option<StoredSnapshot>> {
        match self.read(stem) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(Error::Malformed { what, reason }) => {
                warn!(%what, %reason, "skipping malformed snapshot");
                Ok(None)
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Select a snapshot to resume from
    ///
    /// With `session_id`: an exact stem match, then a stem containing it, then a
    /// snapshot whose metadata names that session. With only `workspace`: the
    /// newest snapshot whose recorded workspace is exactly that name. With neither: the newest snapshot overall.
    /// `Ok(None)` means nothing matched, which callers treat as a fresh start.
    pub fn find(&self, workspace: Option<&str>, session_id: Option<&str>) -> Result<Option<StoredSnapshot>> {
        let stems = self.list_stems()?;

        if let Some(id) = session_id {
            if let Some(stem) = stems.iter().find(|s| s.as_str() == id) {
                return self.read_lenient(stem);
            }
            for stem in stems.iter().filter(|s| s.contains(id)) {
                if let Some(snapshot) = self.read_lenient(stem)? {
                    return Ok(Some(snapshot));
                }
            }
            for stem in &stems {
                if let Some(snapshot) = self.read_lenient(stem)? {
                    let recorded = snapshot.state.metadata.get(SESSION_ID_KEY).and_then(|v| v.as_str());
                    if recorded == Some(id) {
                        return Ok(Some(snapshot));
                    }
                }
            }
            return Ok(None);
        }

        // Distinct workspaces can share a slug; the slug only narrows the reads
        let needle = workspace.map(|ws| format!("_{}_", workspace_slug(ws)));
        for stem in &stems {
            if let Some(ref needle) = needle {
                if !stem.contains(needle.as_str()) {
                    continue;
                }
            }
            if let Some(snapshot) = self.read_lenient(stem)? {
                if workspace.is_some_and(|ws| snapshot.state.workspace != ws) {
                    continue;
                }
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GitState;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn state(workspace: &str, timestamp: &str) -> SessionState {
        SessionState {
            workspace: workspace.to_string(),
            timestamp: timestamp.to_string(),
            phase: "build".to_string(),
            completed_operations: vec![],
            active_files: vec![],
            decisions_made: vec![],
            next_steps: vec![format!("continue {}", workspace)],
            git: GitState::default(),
            warnings: vec![],
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_file_stem_is_deterministic() {
        let s = state("my project", "2025-03-04T05:06:07.089Z");
        assert_eq!(SnapshotStore::file_stem(&s, false), "2025-03-04_my-project_05-06-07-089");
        assert_eq!(SnapshotStore::file_stem(&s, true), "2025-03-04_my-project_05-06-07-089_auto");
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path().join("sessions"));
        let s = state("api", "2025-03-04T05:06:07.089Z");

        let paths = store.write(&s, false).unwrap();
        assert!(paths.json.exists());
        assert!(paths.markdown.exists());

        let found = store.find(Some("api"), None).unwrap().unwrap();
        assert_eq!(found.state, s);
        assert!(found.markdown.contains("# Session Handoff: api"));
    }

    #[test]
    fn test_missing_directory_is_fresh_start() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path().join("nope"));
        assert!(store.find(None, None).unwrap().is_none());
        assert!(store.find(Some("api"), None).unwrap().is_none());
    }

    #[test]
    fn test_newest_wins_across_workspaces() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.write(&state("zeta", "2025-03-04T01:00:00.000Z"), false).unwrap();
        store.write(&state("alpha", "2025-03-04T02:00:00.000Z"), true).unwrap();
        store.write(&state("alpha", "2025-03-03T23:00:00.000Z"), false).unwrap();

        let newest = store.find(None, None).unwrap().unwrap();
        assert_eq!(newest.state.workspace, "alpha");
        assert_eq!(newest.state.timestamp, "2025-03-04T02:00:00.000Z");

        let zeta = store.find(Some("zeta"), None).unwrap().unwrap();
        assert_eq!(zeta.state.workspace, "zeta");
    }

    #[test]
    fn test_workspaces_sharing_a_slug_stay_apart() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.write(&state("api-v2", "2025-03-04T01:00:00.000Z"), false).unwrap();
        store.write(&state("api/v2", "2025-03-04T02:00:00.000Z"), false).unwrap();
        store.write(&state("日本", "2025-03-04T03:00:00.000Z"), false).unwrap();
        assert_eq!(workspace_slug("api/v2"), workspace_slug("api-v2"));

        let dashed = store.find(Some("api-v2"), None).unwrap().unwrap();
        assert_eq!(dashed.state.workspace, "api-v2");
        let slashed = store.find(Some("api/v2"), None).unwrap().unwrap();
        assert_eq!(slashed.state.workspace, "api/v2");

        assert!(store.find(Some("中国"), None).unwrap().is_none());
        assert!(store.find(Some("api v2"), None).unwrap().is_none());
    }

    #[test]
    fn test_malformed_snapshot_is_skipped() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.write(&state("api", "2025-03-04T01:00:00.000Z"), false).unwrap();
        std::fs::write(temp.path().join("2025-03-05_api_00-00-00-000.json"), "{broken").unwrap();

        let found = store.find(Some("api"), None).unwrap().unwrap();
        assert_eq!(found.state.timestamp, "2025-03-04T01:00:00.000Z");
    }

    #[test]
    fn test_find_by_session_id() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let mut tagged = state("api", "2025-03-04T01:00:00.000Z");
        tagged
            .metadata
            .insert(SESSION_ID_KEY.to_string(), serde_json::json!("sess-123"));
        store.write(&tagged, false).unwrap();
        store.write(&state("api", "2025-03-04T02:00:00.000Z"), false).unwrap();

        let by_meta = store.find(None, Some("sess-123")).unwrap().unwrap();
        assert_eq!(by_meta.state.timestamp, "2025-03-04T01:00:00.000Z");

        let by_stem = store.find(None, Some("2025-03-04_api_02-00-00-000")).unwrap().unwrap();
        assert_eq!(by_stem.state.timestamp, "2025-03-04T02:00:00.000Z");

        assert!(store.find(None, Some("missing")).unwrap().is_none());
    }
}
