//! Storage shared between execution contexts.
//!
//! Several processes (or several managers in one process) may write the same
//! namespaced keys. Each context gets change signals for writes made by the
//! *other* contexts and decides whether to apply them by version.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::error::SyncError;
use super::store::Snapshot;

/// Write made by another execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalChange {
  pub key: String,
  pub snapshot: Snapshot,
}

/// Key/value snapshot storage visible to every execution context.
pub trait SharedStore: Send + Sync {
  fn write(&self, key: &str, snapshot: &Snapshot) -> Result<(), SyncError>;

  fn read(&self, key: &str) -> Result<Option<Snapshot>, SyncError>;

  /// Stream of writes performed by other contexts.
  fn watch(&self) -> mpsc::UnboundedReceiver<ExternalChange>;
}

struct Watcher {
  context: u64,
  tx: mpsc::UnboundedSender<ExternalChange>,
}

#[derive(Default)]
struct Backing {
  entries: Mutex<HashMap<String, Snapshot>>,
  watchers: Mutex<Vec<Watcher>>,
  next_context: AtomicU64,
}

/// In-process [`SharedStore`]. Each handle from [`MemorySharedStore::context`]
/// behaves like a separate execution context over the same data.
#[derive(Clone)]
pub struct MemorySharedStore {
  backing: Arc<Backing>,
  context: u64,
}

impl Default for MemorySharedStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemorySharedStore {
  pub fn new() -> Self {
    let backing = Arc::new(Backing::default());
    let context = backing.next_context.fetch_add(1, Ordering::Relaxed);
    Self { backing, context }
  }

  /// New context sharing this store's data.
  pub fn context(&self) -> Self {
    Self {
      backing: Arc::clone(&self.backing),
      context: self.backing.next_context.fetch_add(1, Ordering::Relaxed),
    }
  }

  /// Write as if from an anonymous foreign context; every handle is notified.
  pub fn write_external(&self, key: &str, snapshot: &Snapshot) {
    let foreign = self.backing.next_context.fetch_add(1, Ordering::Relaxed);
    self.store_and_notify(foreign, key, snapshot);
  }

  fn store_and_notify(&self, writer: u64, key: &str, snapshot: &Snapshot) {
    self
      .backing
      .entries
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .insert(key.to_string(), snapshot.clone());

    let mut watchers = self
      .backing
      .watchers
      .lock()
      .unwrap_or_else(|p| p.into_inner());
    watchers.retain(|w| {
      if w.context == writer {
        return !w.tx.is_closed();
      }
      w.tx
        .send(ExternalChange {
          key: key.to_string(),
          snapshot: snapshot.clone(),
        })
        .is_ok()
    });
  }
}

impl SharedStore for MemorySharedStore {
  fn write(&self, key: &str, snapshot: &Snapshot) -> Result<(), SyncError> {
    self.store_and_notify(self.context, key, snapshot);
    Ok(())
  }

  fn read(&self, key: &str) -> Result<Option<Snapshot>, SyncError> {
    Ok(
      self
        .backing
        .entries
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(key)
        .cloned(),
    )
  }

  fn watch(&self) -> mpsc::UnboundedReceiver<ExternalChange> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .backing
      .watchers
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .push(Watcher {
        context: self.context,
        tx,
      });
    rx
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::store::Origin;
  use serde_json::json;

  fn snapshot(version: u64) -> Snapshot {
    Snapshot {
      items: vec![json!({ "id": version })],
      timestamp: 0,
      origin: Origin::Local,
      version,
    }
  }

  #[test]
  fn test_writer_does_not_hear_itself() {
    let tab_a = MemorySharedStore::new();
    let tab_b = tab_a.context();
    let mut rx_a = tab_a.watch();
    let mut rx_b = tab_b.watch();

    tab_a.write("campus_connect_students", &snapshot(2)).unwrap();

    let change = rx_b.try_recv().unwrap();
    assert_eq!(change.key, "campus_connect_students");
    assert_eq!(change.snapshot.version, 2);
    assert!(rx_a.try_recv().is_err());

    assert_eq!(
      tab_b.read("campus_connect_students").unwrap(),
      Some(snapshot(2))
    );
  }

  #[test]
  fn test_external_write_reaches_everyone() {
    let tab_a = MemorySharedStore::new();
    let mut rx_a = tab_a.watch();

    tab_a.write_external("campus_connect_fees", &snapshot(5));

    assert_eq!(rx_a.try_recv().unwrap().snapshot.version, 5);
  }
}
