//! Graceful-restart store: a single-row SQLite table that durably captures
//! scheduler and relay state across a process restart.
//!
//! Exactly one row may carry `status = completed` at a time.
//! [`RestartStore::load_and_consume_completed_snapshot`] reads and deletes
//! that row in one transaction, making recovery at-most-once by
//! construction: a second call after a successful load returns `Ok(None)`.

use std::path::Path;
use parking_lot::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sa_domain::tool::Message;

/// Snapshot format version. Bumped whenever the payload shape changes in a
/// way that makes an old snapshot unsafe to restore.
pub const SNAPSHOT_VERSION: u32 = 1;

const SINGLETON_ID: i64 = 1;

#[derive(Debug, Error)]
pub enum RestartStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RestartStoreError>;

/// Whether an in-flight Agent Run Context was active or merely queued at
/// the moment the snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRecoveryKind {
    Active,
    Queued,
}

/// Recovery hint carried alongside the messages of an in-flight or queued
/// request: the already-visible partial text (if any), so a resumed run can
/// be told what the surface has already shown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryBlock {
    #[serde(default)]
    pub partial_text: Option<String>,
}

/// One queued or active request captured at drain time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecoveryEntry {
    pub kind: AgentRecoveryKind,
    pub request_id: String,
    pub session_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub recovery: Option<RecoveryBlock>,
}

/// One relay's observable state captured at drain time, enough to
/// pre-create a surface stream at the recorded refs and resume the output
/// topic subscription from the recorded cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySnapshot {
    pub request_id: String,
    pub session_id: String,
    pub surface_tag: String,
    #[serde(default)]
    pub created_output_refs: Vec<String>,
    pub visible_text: String,
    /// tool-call id -> latest status line.
    #[serde(default)]
    pub tool_status: Vec<(String, String)>,
    pub out_cursor: u64,
}

/// The full durable snapshot: everything needed to reconstruct scheduler
/// and relay state after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub version: u32,
    pub created_at_ms: i64,
    pub deadline_ms: u64,
    pub agents: Vec<AgentRecoveryEntry>,
    pub relays: Vec<RelaySnapshot>,
}

impl RecoverySnapshot {
    pub fn new(deadline_ms: u64, created_at_ms: i64) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            created_at_ms,
            deadline_ms,
            agents: Vec::new(),
            relays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowStatus {
    Completed,
}

impl RowStatus {
    fn as_str(self) -> &'static str {
        match self {
            RowStatus::Completed => "completed",
        }
    }
}

/// Single-writer store guarded by an in-process mutex, per the spec's
/// shared-resource policy: only one save is ever in flight, and boot-time
/// loads are one-shot.
pub struct RestartStore {
    conn: Mutex<Connection>,
}

impl RestartStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS graceful_restart_state (
                singleton_id INTEGER PRIMARY KEY,
                status       TEXT NOT NULL,
                updated_ts   INTEGER NOT NULL,
                payload_json TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Upsert the singleton row with `status = completed`. Called exactly
    /// once during drain, after both the scheduler queue and all relay
    /// states have been captured.
    ///
    /// Errors here are fatal to the draining process: the operator must
    /// resolve a save failure, since an unsaveable snapshot means the
    /// in-flight work is about to be lost.
    pub fn save_completed_snapshot(&self, snapshot: &RecoverySnapshot, now_ms: i64) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO graceful_restart_state (singleton_id, status, updated_ts, payload_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(singleton_id) DO UPDATE SET
                status = excluded.status,
                updated_ts = excluded.updated_ts,
                payload_json = excluded.payload_json",
            params![SINGLETON_ID, RowStatus::Completed.as_str(), now_ms, payload],
        )?;
        Ok(())
    }

    /// Read the row and unconditionally delete it in the same transaction,
    /// whether or not it was usable. Returns the snapshot only when the row
    /// existed, its status was `completed`, its version matched
    /// [`SNAPSHOT_VERSION`], and its payload parsed — any other case
    /// (missing row, wrong version, malformed JSON) is treated as "no
    /// recovery available" and returns `Ok(None)`, never an error, per the
    /// load-side error policy.
    pub fn load_and_consume_completed_snapshot(&self) -> Result<Option<RecoverySnapshot>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT status, payload_json FROM graceful_restart_state WHERE singleton_id = ?1",
                params![SINGLETON_ID],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        tx.execute(
            "DELETE FROM graceful_restart_state WHERE singleton_id = ?1",
            params![SINGLETON_ID],
        )?;
        tx.commit()?;

        let Some((status, payload_json)) = row else {
            return Ok(None);
        };
        if status != RowStatus::Completed.as_str() {
            return Ok(None);
        }
        let snapshot: RecoverySnapshot = match serde_json::from_str(&payload_json) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "graceful-restart snapshot failed to parse, discarding");
                return Ok(None);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "graceful-restart snapshot version mismatch, discarding"
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// Unconditionally delete the singleton row, used for resets.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM graceful_restart_state WHERE singleton_id = ?1",
            params![SINGLETON_ID],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::tool::Message;

    fn sample_snapshot() -> RecoverySnapshot {
        let mut snapshot = RecoverySnapshot::new(3000, 1_700_000_000_000);
        snapshot.agents.push(AgentRecoveryEntry {
            kind: AgentRecoveryKind::Active,
            request_id: "r1".into(),
            session_id: "s1".into(),
            messages: vec![Message::user("hi")],
            recovery: Some(RecoveryBlock {
                partial_text: Some("starting".into()),
            }),
        });
        snapshot.agents.push(AgentRecoveryEntry {
            kind: AgentRecoveryKind::Queued,
            request_id: "r2".into(),
            session_id: "s1".into(),
            messages: vec![Message::user("attachment message")],
            recovery: None,
        });
        snapshot.relays.push(RelaySnapshot {
            request_id: "r1".into(),
            session_id: "s1".into(),
            surface_tag: "discord".into(),
            created_output_refs: vec!["msg-123".into()],
            visible_text: "starting".into(),
            tool_status: vec![("t1".into(), "start".into())],
            out_cursor: 7,
        });
        snapshot
    }

    #[test]
    fn load_without_save_returns_none() {
        let store = RestartStore::open_in_memory().unwrap();
        assert!(store.load_and_consume_completed_snapshot().unwrap().is_none());
    }

    /// Testable property #7: at-most-once recovery.
    #[test]
    fn at_most_once_recovery() {
        let store = RestartStore::open_in_memory().unwrap();
        let snapshot = sample_snapshot();
        store.save_completed_snapshot(&snapshot, 1_700_000_001_000).unwrap();

        let first = store.load_and_consume_completed_snapshot().unwrap();
        assert!(first.is_some());
        let second = store.load_and_consume_completed_snapshot().unwrap();
        assert!(second.is_none());
    }

    /// Testable property #6 / scenario S6: restart round-trip.
    #[test]
    fn restart_round_trip_preserves_semantic_content() {
        let store = RestartStore::open_in_memory().unwrap();
        let snapshot = sample_snapshot();
        store.save_completed_snapshot(&snapshot, 1_700_000_001_000).unwrap();

        let restored = store
            .load_and_consume_completed_snapshot()
            .unwrap()
            .expect("snapshot should load");

        assert_eq!(restored.version, SNAPSHOT_VERSION);
        assert_eq!(restored.agents.len(), 2);
        assert_eq!(restored.agents[0].kind, AgentRecoveryKind::Active);
        assert_eq!(
            restored.agents[0].recovery.as_ref().unwrap().partial_text.as_deref(),
            Some("starting")
        );
        assert_eq!(restored.agents[1].kind, AgentRecoveryKind::Queued);
        assert_eq!(restored.relays.len(), 1);
        assert_eq!(restored.relays[0].visible_text, "starting");
        assert_eq!(restored.relays[0].out_cursor, 7);
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let store = RestartStore::open_in_memory().unwrap();
        let first = RecoverySnapshot::new(1000, 1);
        let mut second = RecoverySnapshot::new(2000, 2);
        second.relays.push(RelaySnapshot {
            request_id: "r9".into(),
            session_id: "s9".into(),
            surface_tag: "github".into(),
            created_output_refs: vec![],
            visible_text: "second".into(),
            tool_status: vec![],
            out_cursor: 0,
        });

        store.save_completed_snapshot(&first, 1).unwrap();
        store.save_completed_snapshot(&second, 2).unwrap();

        let restored = store
            .load_and_consume_completed_snapshot()
            .unwrap()
            .expect("snapshot should load");
        assert_eq!(restored.relays.len(), 1);
        assert_eq!(restored.relays[0].request_id, "r9");
    }

    #[test]
    fn clear_removes_unconsumed_snapshot() {
        let store = RestartStore::open_in_memory().unwrap();
        store.save_completed_snapshot(&sample_snapshot(), 1).unwrap();
        store.clear().unwrap();
        assert!(store.load_and_consume_completed_snapshot().unwrap().is_none());
    }

    #[test]
    fn version_mismatch_is_treated_as_no_snapshot() {
        let store = RestartStore::open_in_memory().unwrap();
        let mut snapshot = sample_snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        store.save_completed_snapshot(&snapshot, 1).unwrap();

        assert!(store.load_and_consume_completed_snapshot().unwrap().is_none());
        // The row was still consumed even though it was rejected.
        assert!(store.load_and_consume_completed_snapshot().unwrap().is_none());
    }

    #[test]
    fn open_on_disk_persists_across_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("restart.sqlite3");

        {
            let store = RestartStore::open(&db_path).unwrap();
            store.save_completed_snapshot(&sample_snapshot(), 1).unwrap();
        }

        let store = RestartStore::open(&db_path).unwrap();
        let restored = store.load_and_consume_completed_snapshot().unwrap();
        assert!(restored.is_some());
    }
}
