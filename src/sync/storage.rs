//! SQLite implementation of [`SharedStore`].
//!
//! Every process that opens the same database file is a separate execution
//! context. Writes by other connections are detected through
//! `PRAGMA data_version`, which only changes when *another* connection commits.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::SyncError;
use super::shared::{ExternalChange, SharedStore};
use super::store::Snapshot;

/// Schema for the shared snapshot table.
const SHARED_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    version INTEGER NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

struct WatchState {
  data_version: i64,
  /// Last version seen per key, from our own writes or from polling
  seen: HashMap<String, u64>,
}

/// SQLite-backed shared store.
pub struct SqliteSharedStore {
  conn: Mutex<Connection>,
  state: Mutex<WatchState>,
  watchers: Mutex<Vec<mpsc::UnboundedSender<ExternalChange>>>,
}

impl SqliteSharedStore {
  /// Open the shared store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the shared store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create shared store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open shared store at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    conn
      .execute_batch(SHARED_SCHEMA)
      .map_err(|e| eyre!("Failed to run shared store migrations: {}", e))?;

    let data_version = read_data_version(&conn).map_err(|e| eyre!("{}", e))?;
    let seen = read_versions(&conn).map_err(|e| eyre!("{}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      state: Mutex::new(WatchState { data_version, seen }),
      watchers: Mutex::new(Vec::new()),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("campus-sync").join("shared.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }

  fn state(&self) -> MutexGuard<'_, WatchState> {
    self.state.lock().unwrap_or_else(|p| p.into_inner())
  }

  /// Collect writes committed by other connections since the last poll.
  pub fn poll_changes(&self) -> Result<Vec<ExternalChange>, SyncError> {
    let conn = self.conn()?;
    let data_version = read_data_version(&conn)?;

    let mut state = self.state();
    if data_version == state.data_version {
      return Ok(Vec::new());
    }
    state.data_version = data_version;

    let mut stmt = conn
      .prepare("SELECT key, data, version FROM snapshots")
      .map_err(|e| storage_err("Failed to prepare snapshot scan", e))?;
    let rows: Vec<(String, Vec<u8>, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| storage_err("Failed to scan snapshots", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut changes = Vec::new();
    for (key, data, version) in rows {
      let version = version as u64;
      if state.seen.get(&key) == Some(&version) {
        continue;
      }
      match serde_json::from_slice::<Snapshot>(&data) {
        Ok(snapshot) => {
          state.seen.insert(key.clone(), version);
          changes.push(ExternalChange { key, snapshot });
        }
        Err(e) => warn!(key, error = %e, "skipping undecodable snapshot"),
      }
    }

    if !changes.is_empty() {
      debug!(count = changes.len(), "detected external snapshot writes");
    }
    Ok(changes)
  }

  fn dispatch(&self, changes: Vec<ExternalChange>) {
    if changes.is_empty() {
      return;
    }
    let mut watchers = self.watchers.lock().unwrap_or_else(|p| p.into_inner());
    watchers.retain(|tx| changes.iter().all(|change| tx.send(change.clone()).is_ok()));
  }

  /// Poll for external writes every `every` and forward them to watchers.
  pub fn spawn_watcher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let store = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        match store.poll_changes() {
          Ok(changes) => store.dispatch(changes),
          Err(e) => warn!(error = %e, "failed to poll shared store"),
        }
      }
    })
  }
}

impl SharedStore for SqliteSharedStore {
  fn write(&self, key: &str, snapshot: &Snapshot) -> Result<(), SyncError> {
    let data = serde_json::to_vec(snapshot)
      .map_err(|e| SyncError::Storage(format!("Failed to serialize snapshot: {}", e)))?;

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO snapshots (key, data, version, written_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![key, data, snapshot.version as i64],
      )
      .map_err(|e| storage_err("Failed to store snapshot", e))?;

    self.state().seen.insert(key.to_string(), snapshot.version);
    Ok(())
  }

  fn read(&self, key: &str) -> Result<Option<Snapshot>, SyncError> {
    let conn = self.conn()?;
    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM snapshots WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| storage_err("Failed to read snapshot", e))?;

    match data {
      Some(data) => serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| SyncError::Storage(format!("Failed to deserialize snapshot {}: {}", key, e))),
      None => Ok(None),
    }
  }

  fn watch(&self) -> mpsc::UnboundedReceiver<ExternalChange> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .watchers
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .push(tx);
    rx
  }
}

fn storage_err(context: &str, e: rusqlite::Error) -> SyncError {
  SyncError::Storage(format!("{}: {}", context, e))
}

fn read_data_version(conn: &Connection) -> Result<i64, SyncError> {
  conn
    .query_row("PRAGMA data_version", [], |row| row.get(0))
    .map_err(|e| storage_err("Failed to read data_version", e))
}

fn read_versions(conn: &Connection) -> Result<HashMap<String, u64>, SyncError> {
  let mut stmt = conn
    .prepare("SELECT key, version FROM snapshots")
    .map_err(|e| storage_err("Failed to prepare version scan", e))?;
  let versions = stmt
    .query_map([], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })
    .map_err(|e| storage_err("Failed to scan versions", e))?
    .filter_map(|r| r.ok())
    .collect();
  Ok(versions)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::store::Origin;
  use serde_json::json;

  fn snapshot(version: u64) -> Snapshot {
    Snapshot {
      items: vec![json!({ "id": "s1", "v": version })],
      timestamp: 1_700_000_000_000,
      origin: Origin::Local,
      version,
    }
  }

  #[test]
  fn test_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteSharedStore::open(&dir.path().join("shared.db")).unwrap();

    assert_eq!(store.read("campus_connect_students").unwrap(), None);
    store.write("campus_connect_students", &snapshot(3)).unwrap();
    assert_eq!(
      store.read("campus_connect_students").unwrap(),
      Some(snapshot(3))
    );
  }

  #[test]
  fn test_snapshots_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("shared.db");
    {
      let store = SqliteSharedStore::open(&path).unwrap();
      store.write("campus_connect_fees", &snapshot(7)).unwrap();
    }
    let reopened = SqliteSharedStore::open(&path).unwrap();
    assert_eq!(reopened.read("campus_connect_fees").unwrap(), Some(snapshot(7)));
    // Existing rows are not reported as fresh changes
    assert!(reopened.poll_changes().unwrap().is_empty());
  }

  #[test]
  fn test_other_connection_writes_are_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let tab_a = SqliteSharedStore::open(&path).unwrap();
    let tab_b = SqliteSharedStore::open(&path).unwrap();

    tab_a.write("campus_connect_results", &snapshot(2)).unwrap();

    // The writer never sees its own write as external
    assert!(tab_a.poll_changes().unwrap().is_empty());

    let changes = tab_b.poll_changes().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, "campus_connect_results");
    assert_eq!(changes[0].snapshot, snapshot(2));

    assert!(tab_b.poll_changes().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_watcher_forwards_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let writer = SqliteSharedStore::open(&path).unwrap();
    let reader = Arc::new(SqliteSharedStore::open(&path).unwrap());
    let mut rx = reader.watch();
    let task = reader.spawn_watcher(Duration::from_millis(10));

    writer.write("campus_connect_messages", &snapshot(4)).unwrap();

    let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("no change delivered")
      .unwrap();
    assert_eq!(change.snapshot.version, 4);
    task.abort();
  }
}
