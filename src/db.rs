//! SQLite database with Diesel ORM
//!
//! Stores checkpoints and session records. Tables are created on open.

use crate::error::{Error, Result};
use crate::schema::*;
use crate::types::{now_timestamp, CheckpointState, Trigger};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable checkpoint
#[derive(Insertable)]
#[diesel(table_name = checkpoints)]
pub struct NewCheckpoint<'a> {
    pub checkpoint_id: &'a str,
    pub workspace: &'a str,
    pub created_at: &'a str,
    pub operation: &'a str,
    pub state_json: &'a str,
    pub git_hash: Option<&'a str>,
    pub trigger_source: &'a str,
}

/// Queryable checkpoint
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = checkpoints)]
pub struct Checkpoint {
    pub id: i32,
    pub checkpoint_id: String,
    pub workspace: String,
    pub created_at: String,
    pub operation: String,
    pub state_json: String,
    pub git_hash: Option<String>,
    pub trigger_source: String,
}

impl Checkpoint {
    /// Decode the accumulated state this checkpoint carries
    pub fn state(&self) -> Result<CheckpointState> {
        serde_json::from_str(&self.state_json)
            .map_err(|e| Error::malformed(format!("checkpoint {}", self.checkpoint_id), e))
    }

    pub fn trigger(&self) -> Option<Trigger> {
        self.trigger_source.parse().ok()
    }
}

/// Insertable session record
#[derive(Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSessionRecord<'a> {
    pub session_id: &'a str,
    pub workspace: &'a str,
    pub started_at: &'a str,
    pub ended_at: Option<&'a str>,
    pub operations_count: i32,
    pub ended_cleanly: bool,
    pub handoff_path: Option<&'a str>,
}

/// Queryable session record
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, serde::Serialize)]
#[diesel(table_name = sessions)]
pub struct SessionRecord {
    pub id: i32,
    pub session_id: String,
    pub workspace: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub operations_count: i32,
    pub ended_cleanly: bool,
    pub handoff_path: Option<String>,
}

impl SessionRecord {
    /// No end time and no clean end: still running, or crashed
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none() && !self.ended_cleanly
    }
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas
#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open database at specified path, creating tables as needed
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        conn.batch_execute("PRAGMA journal_mode = WAL;")?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                checkpoint_id TEXT NOT NULL UNIQUE,
                workspace TEXT NOT NULL,
                created_at TEXT NOT NULL,
                operation TEXT NOT NULL,
                state_json TEXT NOT NULL,
                git_hash TEXT,
                trigger_source TEXT NOT NULL DEFAULT 'manual'
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                session_id TEXT NOT NULL UNIQUE,
                workspace TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                operations_count INTEGER NOT NULL DEFAULT 0,
                ended_cleanly BOOLEAN NOT NULL DEFAULT 0,
                handoff_path TEXT
            )
        "#).execute(&mut conn)?;

        // "Latest for workspace" lookups
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_checkpoints_workspace_time ON checkpoints(workspace, created_at DESC)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_sessions_workspace_time ON sessions(workspace, started_at DESC)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_sessions_unclean ON sessions(ended_cleanly, ended_at)").execute(&mut conn)?;

        Ok(())
    }

    // ========================================================================
    // Checkpoint Operations
    // ========================================================================

    /// Write a checkpoint and prune the workspace's history to `keep` entries
    ///
    /// Insert and prune share one transaction. Oldest by timestamp go first;
    /// equal timestamps fall back to insertion order.
    pub fn insert_checkpoint(
        &self,
        workspace: &str,
        operation: &str,
        state: &CheckpointState,
        git_hash: Option<&str>,
        trigger: Trigger,
        keep: usize,
    ) -> Result<Checkpoint> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| Error::Storage(format!("failed to serialize checkpoint state: {}", e)))?;
        let checkpoint_id = Uuid::new_v4().to_string();
        let now = now_timestamp();
        let keep = keep.max(1) as i64;

        let new_checkpoint = NewCheckpoint {
            checkpoint_id: &checkpoint_id,
            workspace,
            created_at: &now,
            operation,
            state_json: &state_json,
            git_hash,
            trigger_source: trigger.as_str(),
        };

        let mut conn = self.get_conn()?;
        let (checkpoint, pruned) = conn.immediate_transaction::<_, Error, _>(|conn| {
            diesel::insert_into(checkpoints::table)
                .values(&new_checkpoint)
                .execute(conn)?;

            let keep_ids: Vec<i32> = checkpoints::table
                .filter(checkpoints::workspace.eq(workspace))
                .order((checkpoints::created_at.desc(), checkpoints::id.desc()))
                .select(checkpoints::id)
                .limit(keep)
                .load(conn)?;

            let pruned = diesel::delete(
                checkpoints::table
                    .filter(checkpoints::workspace.eq(workspace))
                    .filter(checkpoints::id.ne_all(keep_ids)),
            )
            .execute(conn)?;

            let checkpoint = checkpoints::table
                .filter(checkpoints::checkpoint_id.eq(&checkpoint_id))
                .first::<Checkpoint>(conn)?;

            Ok((checkpoint, pruned))
        })?;

        if pruned > 0 {
            debug!(workspace, pruned, "pruned checkpoint history");
        }
        Ok(checkpoint)
    }

    /// Most recent checkpoint for a workspace
    pub fn latest_checkpoint(&self, workspace: &str) -> Result<Option<Checkpoint>> {
        let mut conn = self.get_conn()?;
        let checkpoint = checkpoints::table
            .filter(checkpoints::workspace.eq(workspace))
            .order((checkpoints::created_at.desc(), checkpoints::id.desc()))
            .first::<Checkpoint>(&mut conn)
            .optional()?;
        Ok(checkpoint)
    }

    /// Checkpoints for a workspace, newest first
    pub fn list_checkpoints(&self, workspace: &str, limit: i64) -> Result<Vec<Checkpoint>> {
        let mut conn = self.get_conn()?;
        let rows = checkpoints::table
            .filter(checkpoints::workspace.eq(workspace))
            .order((checkpoints::created_at.desc(), checkpoints::id.desc()))
            .limit(limit)
            .load::<Checkpoint>(&mut conn)?;
        Ok(rows)
    }

    pub fn count_checkpoints(&self, workspace: &str) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let count = checkpoints::table
            .filter(checkpoints::workspace.eq(workspace))
            .count()
            .get_result(&mut conn)?;
        Ok(count)
    }

    // ========================================================================
    // Session Record Operations
    // ========================================================================

    /// Open a new session record, not yet cleanly ended
    pub fn start_session(&self, workspace: &str) -> Result<SessionRecord> {
        self.start_session_with_id(workspace, &Uuid::new_v4().to_string())
    }

    /// Open a session record under an id the caller already handed out
    pub fn start_session_with_id(&self, workspace: &str, session_id: &str) -> Result<SessionRecord> {
        let mut conn = self.get_conn()?;
        let now = now_timestamp();

        let new_session = NewSessionRecord {
            session_id,
            workspace,
            started_at: &now,
            ended_at: None,
            operations_count: 0,
            ended_cleanly: false,
            handoff_path: None,
        };

        diesel::insert_into(sessions::table)
            .values(&new_session)
            .execute(&mut conn)?;

        let record = sessions::table
            .filter(sessions::session_id.eq(session_id))
            .first::<SessionRecord>(&mut conn)?;

        debug!(workspace, session_id = %record.session_id, "session started");
        Ok(record)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.get_conn()?;
        let record = sessions::table
            .filter(sessions::session_id.eq(session_id))
            .first::<SessionRecord>(&mut conn)
            .optional()?;
        Ok(record)
    }

    /// The workspace's currently tracked session: newest record with no end time
    pub fn open_session(&self, workspace: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.get_conn()?;
        let record = sessions::table
            .filter(sessions::workspace.eq(workspace))
            .filter(sessions::ended_at.is_null())
            .filter(sessions::ended_cleanly.eq(false))
            .order((sessions::started_at.desc(), sessions::id.desc()))
            .first::<SessionRecord>(&mut conn)
            .optional()?;
        Ok(record)
    }

    /// Stamp an end time on a session record
    ///
    /// `ended_cleanly` is written as given, so callers closing a crashed or
    /// rotated record pass `false` explicitly.
    pub fn end_session(
        &self,
        session_id: &str,
        ended_cleanly: bool,
        handoff_path: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now_timestamp();

        let updated = diesel::update(sessions::table.filter(sessions::session_id.eq(session_id)))
            .set((
                sessions::ended_at.eq(Some(now.as_str())),
                sessions::ended_cleanly.eq(ended_cleanly),
                sessions::handoff_path.eq(handoff_path),
            ))
            .execute(&mut conn)?;

        if updated == 0 {
            return Err(Error::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }

    /// Close a record only if it is still open; false means someone else closed it first
    ///
    /// A single conditional UPDATE, so of any number of concurrent callers
    /// exactly one sees `true`.
    pub fn close_if_open(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let now = now_timestamp();

        let updated = diesel::update(
            sessions::table
                .filter(sessions::session_id.eq(session_id))
                .filter(sessions::ended_at.is_null())
                .filter(sessions::ended_cleanly.eq(false)),
        )
        .set((
            sessions::ended_at.eq(Some(now.as_str())),
            sessions::ended_cleanly.eq(false),
        ))
        .execute(&mut conn)?;

        Ok(updated == 1)
    }

    pub fn increment_operations(&self, session_id: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let updated = diesel::update(sessions::table.filter(sessions::session_id.eq(session_id)))
            .set(sessions::operations_count.eq(sessions::operations_count + 1))
            .execute(&mut conn)?;

        if updated == 0 {
            return Err(Error::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }

    /// Records never closed, newest first, optionally scoped to a workspace
    pub fn unclean_sessions(&self, workspace: Option<&str>) -> Result<Vec<SessionRecord>> {
        let mut conn = self.get_conn()?;
        let mut query = sessions::table
            .filter(sessions::ended_cleanly.eq(false))
            .filter(sessions::ended_at.is_null())
            .into_boxed();

        if let Some(ws) = workspace {
            query = query.filter(sessions::workspace.eq(ws));
        }

        let records = query
            .order((sessions::started_at.desc(), sessions::id.desc()))
            .load::<SessionRecord>(&mut conn)?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, Database) {
        let temp = TempDir::new().unwrap();
        let db = Database::open_at(temp.path().join("test.db")).unwrap();
        (temp, db)
    }

    fn payload(step: &str) -> CheckpointState {
        CheckpointState {
            phase: Some("build".to_string()),
            next_steps: vec![step.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_read_latest_checkpoint() {
        let (_temp, db) = temp_db();
        db.insert_checkpoint("w", "first", &payload("a"), None, Trigger::Manual, 50).unwrap();
        let second = db
            .insert_checkpoint("w", "second", &payload("b"), Some("abc1234"), Trigger::Gitflow, 50)
            .unwrap();

        let latest = db.latest_checkpoint("w").unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second.checkpoint_id);
        assert_eq!(latest.operation, "second");
        assert_eq!(latest.git_hash.as_deref(), Some("abc1234"));
        assert_eq!(latest.trigger(), Some(Trigger::Gitflow));
        assert_eq!(latest.state().unwrap().next_steps, vec!["b".to_string()]);

        assert!(db.latest_checkpoint("other").unwrap().is_none());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let (_temp, db) = temp_db();
        for i in 0..8 {
            db.insert_checkpoint("w", &format!("op {}", i), &payload("x"), None, Trigger::Auto, 3)
                .unwrap();
        }
        db.insert_checkpoint("elsewhere", "op", &payload("x"), None, Trigger::Auto, 3).unwrap();

        assert_eq!(db.count_checkpoints("w").unwrap(), 3);
        assert_eq!(db.count_checkpoints("elsewhere").unwrap(), 1);

        let ops: Vec<String> = db
            .list_checkpoints("w", 10)
            .unwrap()
            .into_iter()
            .map(|c| c.operation)
            .collect();
        assert_eq!(ops, vec!["op 7", "op 6", "op 5"]);
    }

    #[test]
    fn test_malformed_payload_is_reported() {
        let (_temp, db) = temp_db();
        let mut checkpoint = db
            .insert_checkpoint("w", "op", &payload("x"), None, Trigger::Manual, 50)
            .unwrap();
        checkpoint.state_json = "{not json".to_string();
        assert!(matches!(checkpoint.state(), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_session_lifecycle() {
        let (_temp, db) = temp_db();
        let record = db.start_session("w").unwrap();
        assert!(record.is_open());
        assert_eq!(db.open_session("w").unwrap().unwrap().session_id, record.session_id);

        db.increment_operations(&record.session_id).unwrap();
        db.increment_operations(&record.session_id).unwrap();
        db.end_session(&record.session_id, true, Some("sessions/x.json")).unwrap();

        let closed = db.get_session(&record.session_id).unwrap().unwrap();
        assert_eq!(closed.operations_count, 2);
        assert!(closed.ended_cleanly);
        assert!(closed.ended_at.is_some());
        assert_eq!(closed.handoff_path.as_deref(), Some("sessions/x.json"));
        assert!(db.open_session("w").unwrap().is_none());
    }

    #[test]
    fn test_unclean_sessions_scoping() {
        let (_temp, db) = temp_db();
        let a = db.start_session("a").unwrap();
        let b = db.start_session("b").unwrap();
        let closed = db.start_session("a").unwrap();
        db.end_session(&closed.session_id, false, None).unwrap();

        let all = db.unclean_sessions(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, b.session_id);

        let only_a = db.unclean_sessions(Some("a")).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].session_id, a.session_id);
    }

    #[test]
    fn test_close_if_open_succeeds_once() {
        let (_temp, db) = temp_db();
        let record = db.start_session("w").unwrap();

        assert!(db.close_if_open(&record.session_id).unwrap());
        assert!(!db.close_if_open(&record.session_id).unwrap());

        let closed = db.get_session(&record.session_id).unwrap().unwrap();
        assert!(closed.ended_at.is_some());
        assert!(!closed.ended_cleanly);

        let clean = db.start_session("w").unwrap();
        db.end_session(&clean.session_id, true, None).unwrap();
        assert!(!db.close_if_open(&clean.session_id).unwrap());
        assert!(db.get_session(&clean.session_id).unwrap().unwrap().ended_cleanly);
        assert!(!db.close_if_open("nope").unwrap());
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let (_temp, db) = temp_db();
        assert!(db.end_session("nope", true, None).unwrap_err().is_not_found());
        assert!(db.increment_operations("nope").unwrap_err().is_not_found());
    }
}
