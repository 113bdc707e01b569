//! Store records, persisted snapshots and the identity merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a store mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
  /// A call on this process's API
  Local,
  /// Another execution context writing the shared store
  Storage,
  /// Reconciliation with the remote authority
  Remote,
}

impl std::fmt::Display for Origin {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Origin::Local => "local",
      Origin::Storage => "storage",
      Origin::Remote => "remote",
    })
  }
}

/// In-memory state of one named collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
  pub name: String,
  pub items: Vec<Value>,
  pub last_sync: DateTime<Utc>,
  /// Starts at 1, +1 per successful mutation
  pub version: u64,
}

impl StoreRecord {
  pub fn new(name: &str, items: Vec<Value>, now: DateTime<Utc>) -> Self {
    Self {
      name: name.to_string(),
      items,
      last_sync: now,
      version: 1,
    }
  }

  /// Restore a record from its persisted snapshot, keeping the persisted version.
  pub fn from_snapshot(name: &str, snapshot: Snapshot) -> Self {
    Self {
      name: name.to_string(),
      last_sync: DateTime::from_timestamp_millis(snapshot.timestamp).unwrap_or_default(),
      items: snapshot.items,
      version: snapshot.version,
    }
  }

  pub fn snapshot(&self, origin: Origin) -> Snapshot {
    Snapshot {
      items: self.items.clone(),
      timestamp: self.last_sync.timestamp_millis(),
      origin,
      version: self.version,
    }
  }
}

/// Serialized form of a store in the shared cross-context store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub items: Vec<Value>,
  /// Epoch milliseconds
  pub timestamp: i64,
  pub origin: Origin,
  pub version: u64,
}

/// Identity of an entity, if it has one.
pub fn item_id(item: &Value) -> Option<&Value> {
  item.get("id").filter(|id| !id.is_null())
}

/// Shallow field merge: every field of `changes` overrides `target`.
pub fn merge_fields(target: &mut Value, changes: &Map<String, Value>) {
  if let Value::Object(fields) = target {
    for (key, value) in changes {
      fields.insert(key.clone(), value.clone());
    }
  } else {
    *target = Value::Object(changes.clone());
  }
}

/// Upsert `remote` into `local` by `id`.
///
/// Remote items with a matching local item override its fields in place;
/// unseen remote items are appended in remote order; local-only items stay.
/// Remote items without an id are appended as-is.
pub fn merge_by_id(local: &mut Vec<Value>, remote: Vec<Value>) {
  for remote_item in remote {
    let position = item_id(&remote_item)
      .and_then(|id| local.iter().position(|item| item_id(item) == Some(id)));
    match (position, remote_item) {
      (Some(idx), Value::Object(fields)) => merge_fields(&mut local[idx], &fields),
      (Some(idx), other) => local[idx] = other,
      (None, item) => local.push(item),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_merge_by_id() {
    let mut local = vec![
      json!({ "id": 1, "name": "Ana", "grade": "A", "local_note": "keep" }),
      json!({ "id": 2, "name": "Ben" }),
    ];
    let remote = vec![
      json!({ "id": 1, "grade": "B" }),
      json!({ "id": 3, "name": "Cai" }),
    ];

    merge_by_id(&mut local, remote);

    assert_eq!(
      local,
      vec![
        json!({ "id": 1, "name": "Ana", "grade": "B", "local_note": "keep" }),
        json!({ "id": 2, "name": "Ben" }),
        json!({ "id": 3, "name": "Cai" }),
      ]
    );
  }

  #[test]
  fn test_merge_distinguishes_id_types() {
    let mut local = vec![json!({ "id": "1", "v": "local" })];
    merge_by_id(&mut local, vec![json!({ "id": 1, "v": "remote" })]);
    assert_eq!(local.len(), 2);
  }

  #[test]
  fn test_snapshot_round_trip_keeps_version() {
    let now = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
    let mut record = StoreRecord::new("fees", vec![json!({ "id": "f1" })], now);
    record.version = 9;

    let snapshot = record.snapshot(Origin::Remote);
    assert_eq!(snapshot.timestamp, 1_700_000_000_123);
    assert_eq!(
      serde_json::to_value(&snapshot).unwrap(),
      json!({
        "items": [{ "id": "f1" }],
        "timestamp": 1_700_000_000_123i64,
        "origin": "remote",
        "version": 9
      })
    );

    let restored = StoreRecord::from_snapshot("fees", snapshot);
    assert_eq!(restored, record);
  }
}
