//! Snapshot stores: where the ledger lives between mutations and across restarts

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::core::ledger::LedgerSnapshot;
use crate::error::{TradingError, TradingResult};

/// Keyed storage for ledger snapshots. One key per grid session.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, session_id: &str) -> TradingResult<Option<LedgerSnapshot>>;

    fn save(&self, session_id: &str, snapshot: &LedgerSnapshot) -> TradingResult<()>;

    /// Sessions that have a snapshot
    fn sessions(&self) -> TradingResult<Vec<String>>;
}

/// Build the store selected in `[persistence]`
pub fn open_store(config: &PersistenceConfig) -> TradingResult<Arc<dyn SnapshotStore>> {
    match config.backend {
        PersistenceBackend::Sqlite => Ok(Arc::new(SqliteSnapshotStore::open(&config.path)?)),
        PersistenceBackend::Json => Ok(Arc::new(JsonFileSnapshotStore::new(&config.path)?)),
    }
}

/// One row of the snapshot trail
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotHistoryEntry {
    pub revision: i64,
    pub position: String,
    pub realized_pnl: String,
    pub saved_at: String,
}

pub struct SqliteSnapshotStore {
    db: Database,
}

impl SqliteSnapshotStore {
    pub fn open<P: AsRef<Path>>(path: P) -> TradingResult<Self> {
        Self::with_database(Database::new(path)?)
    }

    pub fn in_memory() -> TradingResult<Self> {
        Self::with_database(Database::new_in_memory()?)
    }

    pub fn with_database(db: Database) -> TradingResult<Self> {
        db.run_migrations()?;
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Most recent snapshot writes for a session, newest first
    pub fn history(&self, session_id: &str, limit: usize) -> TradingResult<Vec<SnapshotHistoryEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT revision, position, realized_pnl, saved_at FROM snapshot_history
             WHERE session_id = ?1 ORDER BY revision DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok(SnapshotHistoryEntry {
                revision: row.get(0)?,
                position: row.get(1)?,
                realized_pnl: row.get(2)?,
                saved_at: row.get(3)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, session_id: &str) -> TradingResult<Option<LedgerSnapshot>> {
        let conn = self.db.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM ledger_snapshots WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| LedgerSnapshot::from_json(&json)).transpose()
    }

    fn save(&self, session_id: &str, snapshot: &LedgerSnapshot) -> TradingResult<()> {
        let json = snapshot.to_json()?;
        let saved_at = snapshot.saved_at.to_rfc3339();
        let position = snapshot.ledger.position().to_string();
        let realized_pnl = snapshot.ledger.realized_pnl().to_string();

        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO ledger_snapshots (session_id, version, revision, snapshot, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id) DO UPDATE SET
                    version = excluded.version,
                    revision = excluded.revision,
                    snapshot = excluded.snapshot,
                    saved_at = excluded.saved_at",
                params![session_id, snapshot.version, snapshot.revision as i64, json, saved_at],
            )?;
            tx.execute(
                "INSERT INTO snapshot_history (session_id, revision, position, realized_pnl, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, snapshot.revision as i64, position, realized_pnl, saved_at],
            )?;
            Ok(())
        })?;

        debug!("Saved snapshot {} revision {}", session_id, snapshot.revision);
        Ok(())
    }

    fn sessions(&self) -> TradingResult<Vec<String>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare("SELECT session_id FROM ledger_snapshots ORDER BY session_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}

/// One JSON file per session, replaced atomically on every save
pub struct JsonFileSnapshotStore {
    dir: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> TradingResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: &str) -> TradingResult<PathBuf> {
        if session_id.is_empty() || session_id.contains(['/', '\\']) || session_id.starts_with('.') {
            return Err(TradingError::ConfigurationInvalid(format!(
                "session id {:?} cannot be used as a file name",
                session_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn load(&self, session_id: &str) -> TradingResult<Option<LedgerSnapshot>> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        LedgerSnapshot::from_json(&content).map(Some)
    }

    fn save(&self, session_id: &str, snapshot: &LedgerSnapshot) -> TradingResult<()> {
        let path = self.path_for(session_id)?;
        let temp_path = path.with_extension("json.tmp");

        let content = snapshot.to_json()?;
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;

        debug!("Saved snapshot to {:?}", path);
        Ok(())
    }

    fn sessions(&self) -> TradingResult<Vec<String>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    sessions.push(stem.to_string());
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

/// Process-local store with switchable write failures, used by dry runs and tests
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following save fail until switched off
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn snapshots(&self) -> TradingResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.snapshots
            .lock()
            .map_err(|_| TradingError::PersistenceFailure("snapshot map lock poisoned".to_string()))
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self, session_id: &str) -> TradingResult<Option<LedgerSnapshot>> {
        let snapshots = self.snapshots()?;
        snapshots
            .get(session_id)
            .map(|json| LedgerSnapshot::from_json(json))
            .transpose()
    }

    fn save(&self, session_id: &str, snapshot: &LedgerSnapshot) -> TradingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TradingError::PersistenceFailure("injected write failure".to_string()));
        }
        let json = snapshot.to_json()?;
        self.snapshots()?.insert(session_id.to_string(), json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sessions(&self) -> TradingResult<Vec<String>> {
        let mut sessions: Vec<String> = self.snapshots()?.keys().cloned().collect();
        sessions.sort();
        Ok(sessions)
    }
}
