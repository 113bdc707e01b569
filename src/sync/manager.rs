//! Versioned stores with subscriber fan-out, shared persistence and remote reconciliation.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::event::{names, panic_message, EventBus, HandlerId};
use crate::gateway::Connectivity;

use super::error::SyncError;
use super::remote::RemoteSource;
use super::shared::{ExternalChange, SharedStore};
use super::store::{item_id, merge_by_id, merge_fields, Origin, StoreRecord};

/// Prefix for shared-store keys unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "campus_connect_";

/// Stores created by [`SyncManager::initialize_stores`] when none are configured.
pub const DEFAULT_STORES: [&str; 7] = [
  "students",
  "assignments",
  "fees",
  "results",
  "messages",
  "notifications",
  "announcements",
];

/// New contents of a store, handed to subscribers after every mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreUpdate {
  pub store: String,
  pub items: Vec<Value>,
  pub version: u64,
  pub origin: Origin,
}

pub type Subscriber = Arc<dyn Fn(&StoreUpdate) + Send + Sync>;

/// Handle returned by [`SyncManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
  pub last_sync: DateTime<Utc>,
  pub version: u64,
  pub item_count: usize,
}

/// Result of reconciling one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
  /// Remote items merged; the store is now at `version`
  Merged { version: u64 },
  /// Nothing to do: offline or no remote configured
  Skipped,
}

/// Updates of one store waiting to be handed to subscribers.
#[derive(Default)]
struct Lane {
  queued: VecDeque<StoreUpdate>,
  delivering: bool,
}

#[derive(Debug, Clone)]
struct PendingSync {
  store: String,
  queued_at: DateTime<Utc>,
}

/// Owner of every named store.
///
/// Mutations bump the version, persist to the shared store and notify
/// subscribers, in that order. The version bump and the persisted write happen
/// under one lock, so persisted order always matches version order.
/// Subscribers of a store see its updates one at a time in version order,
/// even when several threads mutate it at once.
pub struct SyncManager {
  stores: Mutex<BTreeMap<String, StoreRecord>>,
  subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, Subscriber)>>>,
  outbox: Mutex<HashMap<String, Lane>>,
  next_subscription: AtomicU64,
  pending: Mutex<VecDeque<PendingSync>>,
  shared: Arc<dyn SharedStore>,
  remote: Option<Arc<dyn RemoteSource>>,
  connectivity: Connectivity,
  bus: Option<EventBus>,
  clock: Arc<dyn Clock>,
  namespace: String,
}

impl SyncManager {
  pub fn new(shared: Arc<dyn SharedStore>, connectivity: Connectivity) -> Self {
    Self {
      stores: Mutex::new(BTreeMap::new()),
      subscribers: Mutex::new(HashMap::new()),
      outbox: Mutex::new(HashMap::new()),
      next_subscription: AtomicU64::new(0),
      pending: Mutex::new(VecDeque::new()),
      shared,
      remote: None,
      connectivity,
      bus: None,
      clock: Arc::new(SystemClock),
      namespace: DEFAULT_NAMESPACE.to_string(),
    }
  }

  pub fn with_remote(mut self, remote: Arc<dyn RemoteSource>) -> Self {
    self.remote = Some(remote);
    self
  }

  /// Publish `store.updated` and `sync.failed` on `bus`.
  pub fn with_bus(mut self, bus: EventBus) -> Self {
    self.bus = Some(bus);
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  fn stores(&self) -> MutexGuard<'_, BTreeMap<String, StoreRecord>> {
    self.stores.lock().unwrap_or_else(|p| p.into_inner())
  }

  fn subscribers(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriptionId, Subscriber)>>> {
    self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
  }

  fn outbox(&self) -> MutexGuard<'_, HashMap<String, Lane>> {
    self.outbox.lock().unwrap_or_else(|p| p.into_inner())
  }

  fn pending(&self) -> MutexGuard<'_, VecDeque<PendingSync>> {
    self.pending.lock().unwrap_or_else(|p| p.into_inner())
  }

  /// Shared-store key for `store`.
  pub fn storage_key(&self, store: &str) -> String {
    format!("{}{}", self.namespace, store)
  }

  /// Create `name` holding `initial`, or replace the items of an existing store.
  ///
  /// A new store starts one version above whatever is already persisted under
  /// its key (version 1 when nothing is) and is written through without
  /// notifying anyone. An existing store gets an ordinary replacement: version
  /// bump, persist, notify. Returns the resulting version.
  pub fn register_store(&self, name: &str, initial: Vec<Value>) -> Result<u64, SyncError> {
    self.register(name, initial, Origin::Local)
  }

  fn register(&self, name: &str, items: Vec<Value>, origin: Origin) -> Result<u64, SyncError> {
    {
      let mut stores = self.stores();
      if !stores.contains_key(name) {
        let key = self.storage_key(name);
        let persisted = self.shared.read(&key)?.map_or(0, |snapshot| snapshot.version);
        let mut record = StoreRecord::new(name, items, self.clock.now());
        record.version = persisted + 1;
        self.shared.write(&key, &record.snapshot(origin))?;
        let version = record.version;
        stores.insert(name.to_string(), record);
        debug!(store = name, version, "registered store");
        return Ok(version);
      }
    }

    let ((), version) = self.mutate(name, origin, move |current| {
      *current = items;
      Some(())
    })?;
    Ok(version)
  }

  /// Restore `name` from its persisted snapshot, keeping the persisted version.
  ///
  /// Returns the store's items afterwards. Nothing is restored when nothing was
  /// persisted or the local copy is at least as new.
  pub fn load_from_storage(&self, name: &str) -> Result<Vec<Value>, SyncError> {
    let Some(snapshot) = self.shared.read(&self.storage_key(name))? else {
      return Ok(self.get_data(name));
    };
    let mut stores = self.stores();
    if let Some(current) = stores.get(name) {
      if current.version >= snapshot.version {
        return Ok(current.items.clone());
      }
    }
    let record = StoreRecord::from_snapshot(name, snapshot);
    let items = record.items.clone();
    debug!(store = name, version = record.version, "restored store from storage");
    stores.insert(name.to_string(), record);
    Ok(items)
  }

  /// Register every store in `names`, restoring persisted snapshots where present.
  ///
  /// A store whose snapshot cannot be read or written is logged and starts
  /// empty in memory; its first mutation persists it.
  pub fn initialize_stores<S: AsRef<str>>(&self, names: &[S]) {
    for name in names {
      let name = name.as_ref();
      let outcome = self.load_from_storage(name).and_then(|_| {
        if !self.has_store(name) {
          self.register_store(name, Vec::new())?;
        }
        Ok(())
      });
      if let Err(e) = outcome {
        warn!(store = name, error = %e, "failed to restore store, starting empty");
        self
          .stores()
          .entry(name.to_string())
          .or_insert_with(|| StoreRecord::new(name, Vec::new(), self.clock.now()));
      }
    }
    info!(count = names.len(), "stores initialized");
  }

  pub fn has_store(&self, name: &str) -> bool {
    self.stores().contains_key(name)
  }

  pub fn store_names(&self) -> Vec<String> {
    self.stores().keys().cloned().collect()
  }

  /// Current items of `name`; empty for unknown stores.
  pub fn get_data(&self, name: &str) -> Vec<Value> {
    self
      .stores()
      .get(name)
      .map(|record| record.items.clone())
      .unwrap_or_default()
  }

  pub fn version(&self, name: &str) -> Option<u64> {
    self.stores().get(name).map(|record| record.version)
  }

  /// Replace the items of `name`.
  ///
  /// An unknown store is registered with `items` the way
  /// [`register_store`](Self::register_store) does, without notifying
  /// subscribers. Returns the resulting version.
  pub fn set_data(&self, name: &str, items: Vec<Value>, origin: Origin) -> Result<u64, SyncError> {
    self.register(name, items, origin)
  }

  /// Append `item` (a JSON object) to `name`.
  pub fn add_item(&self, name: &str, item: Value) -> Result<Value, SyncError> {
    if !item.is_object() {
      return Err(SyncError::Validation(format!(
        "store items must be JSON objects, got {}",
        item
      )));
    }
    let (added, _) = self.mutate(name, Origin::Local, move |items| {
      items.push(item.clone());
      Some(item)
    })?;
    Ok(added)
  }

  /// Merge `changes` into the item whose id is `id`.
  ///
  /// Returns the updated item, or `None` (and no version change) when no item
  /// has that id.
  pub fn update_item(
    &self,
    name: &str,
    id: &Value,
    changes: Map<String, Value>,
  ) -> Result<Option<Value>, SyncError> {
    let updated = self.mutate(name, Origin::Local, |items| {
      let item = items.iter_mut().find(|item| item_id(item) == Some(id))?;
      merge_fields(item, &changes);
      Some(item.clone())
    });
    match updated {
      Ok((item, _)) => Ok(Some(item)),
      Err(MutateError::Unchanged) => Ok(None),
      Err(MutateError::Failed(e)) => Err(e),
    }
  }

  /// Remove every item whose id is `id`. Returns false if none matched.
  pub fn remove_item(&self, name: &str, id: &Value) -> Result<bool, SyncError> {
    let removed = self.mutate(name, Origin::Local, |items| {
      let before = items.len();
      items.retain(|item| item_id(item) != Some(id));
      (items.len() != before).then_some(())
    });
    match removed {
      Ok(_) => Ok(true),
      Err(MutateError::Unchanged) => Ok(false),
      Err(MutateError::Failed(e)) => Err(e),
    }
  }

  /// Apply `change` to a copy of the store's items and commit it.
  ///
  /// `change` returning `None` leaves the store untouched. The new snapshot is
  /// persisted before the record is replaced, so a storage failure leaves both
  /// at the previous version.
  fn mutate<R>(
    &self,
    name: &str,
    origin: Origin,
    change: impl FnOnce(&mut Vec<Value>) -> Option<R>,
  ) -> Result<(R, u64), MutateError> {
    let (result, version) = {
      let mut stores = self.stores();
      let record = stores
        .get_mut(name)
        .ok_or_else(|| SyncError::UnknownStore(name.to_string()))?;

      let mut items = record.items.clone();
      let result = change(&mut items).ok_or(MutateError::Unchanged)?;

      let next = StoreRecord {
        name: record.name.clone(),
        items,
        last_sync: self.clock.now(),
        version: record.version + 1,
      };
      self
        .shared
        .write(&self.storage_key(name), &next.snapshot(origin))?;
      *record = next;

      self.enqueue(StoreUpdate {
        store: name.to_string(),
        items: record.items.clone(),
        version: record.version,
        origin,
      });
      (result, record.version)
    };

    self.deliver(name);
    Ok((result, version))
  }

  /// Queue `update` for delivery. Called with the store lock held, so each
  /// lane fills in version order.
  fn enqueue(&self, update: StoreUpdate) {
    self
      .outbox()
      .entry(update.store.clone())
      .or_default()
      .queued
      .push_back(update);
  }

  /// Hand queued updates of `store` to its subscribers, oldest first.
  ///
  /// Only one caller delivers a given store at a time. Anyone arriving while
  /// a delivery is running leaves their update to that caller.
  fn deliver(&self, store: &str) {
    {
      let mut outbox = self.outbox();
      let lane = outbox.entry(store.to_string()).or_default();
      if lane.delivering {
        return;
      }
      lane.delivering = true;
    }

    loop {
      let next = {
        let mut outbox = self.outbox();
        let lane = outbox.entry(store.to_string()).or_default();
        match lane.queued.pop_front() {
          Some(update) => update,
          None => {
            lane.delivering = false;
            return;
          }
        }
      };
      self.notify(&next);
    }
  }

  /// Call `callback` with the new contents after every mutation of `store`.
  pub fn subscribe<F>(&self, store: &str, callback: F) -> SubscriptionId
  where
    F: Fn(&StoreUpdate) + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
    self
      .subscribers()
      .entry(store.to_string())
      .or_default()
      .push((id, Arc::new(callback)));
    id
  }

  pub fn unsubscribe(&self, store: &str, id: SubscriptionId) -> bool {
    let mut subscribers = self.subscribers();
    let Some(list) = subscribers.get_mut(store) else {
      return false;
    };
    let before = list.len();
    list.retain(|(sid, _)| *sid != id);
    list.len() != before
  }

  fn notify(&self, update: &StoreUpdate) {
    let callbacks: Vec<Subscriber> = match self.subscribers().get(&update.store) {
      Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
      None => Vec::new(),
    };

    for callback in callbacks {
      if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(update))) {
        error!(
          store = %update.store,
          error = %panic_message(&*panic),
          "store subscriber panicked"
        );
      }
    }

    self.publish(
      names::STORE_UPDATED,
      json!({
        "store": update.store,
        "version": update.version,
        "origin": update.origin,
        "count": update.items.len(),
      }),
    );
  }

  /// Apply a snapshot written by another execution context.
  ///
  /// Only applied when its version is strictly greater than the local one
  /// (or the store is unknown locally). Returns whether it was applied.
  pub fn apply_external_change(&self, change: ExternalChange) -> bool {
    let Some(name) = change.key.strip_prefix(&self.namespace) else {
      return false;
    };
    if name.is_empty() {
      return false;
    }

    let version = {
      let mut stores = self.stores();
      if let Some(current) = stores.get(name) {
        if change.snapshot.version <= current.version {
          debug!(
            store = name,
            local = current.version,
            incoming = change.snapshot.version,
            "discarding stale external change"
          );
          return false;
        }
      }

      let mut record = StoreRecord::from_snapshot(name, change.snapshot);
      record.last_sync = self.clock.now();
      let version = record.version;
      self.enqueue(StoreUpdate {
        store: name.to_string(),
        items: record.items.clone(),
        version,
        origin: Origin::Storage,
      });
      stores.insert(name.to_string(), record);
      version
    };

    debug!(store = name, version, "applied external change");
    self.deliver(name);
    true
  }

  /// Apply changes from other contexts as the shared store reports them.
  pub fn spawn_change_listener(self: &Arc<Self>) -> JoinHandle<()> {
    let manager = Arc::clone(self);
    let mut rx = self.shared.watch();
    tokio::spawn(async move {
      while let Some(change) = rx.recv().await {
        manager.apply_external_change(change);
      }
    })
  }

  /// Fetch remote items for `name` and upsert them by id.
  ///
  /// Skipped while offline or without a remote. A failed fetch is logged,
  /// queued for the next pass and reported on the bus.
  pub async fn reconcile(&self, name: &str) -> Result<Reconciled, SyncError> {
    if !self.has_store(name) {
      return Err(SyncError::UnknownStore(name.to_string()));
    }
    let Some(remote) = &self.remote else {
      return Ok(Reconciled::Skipped);
    };
    if !self.connectivity.is_online() {
      return Ok(Reconciled::Skipped);
    }

    let remote_items = match remote.fetch(name).await {
      Ok(items) => items,
      Err(e) => {
        warn!(store = name, error = %e, "reconciliation failed, queued for retry");
        self.queue_sync(name);
        self.publish(
          names::SYNC_FAILED,
          json!({ "store": name, "error": e.to_string() }),
        );
        return Err(e);
      }
    };

    let count = remote_items.len();
    let ((), version) = self.mutate(name, Origin::Remote, move |items| {
      merge_by_id(items, remote_items);
      Some(())
    })?;
    debug!(store = name, remote_items = count, version, "store reconciled");
    Ok(Reconciled::Merged { version })
  }

  /// Reconcile every registered store, one after another.
  pub async fn reconcile_all(&self) -> Vec<(String, Result<Reconciled, SyncError>)> {
    let mut results = Vec::new();
    for name in self.store_names() {
      let result = self.reconcile(&name).await;
      results.push((name, result));
    }
    results
  }

  /// Reconcile every registered store concurrently.
  pub async fn force_sync_all(&self) -> Vec<(String, Result<Reconciled, SyncError>)> {
    let names = self.store_names();
    let results = join_all(names.iter().map(|name| self.reconcile(name))).await;
    names.into_iter().zip(results).collect()
  }

  /// Schedule `name` for the next queue pass. A store is queued at most once.
  pub fn queue_sync(&self, name: &str) {
    let mut pending = self.pending();
    if pending.iter().any(|p| p.store == name) {
      return;
    }
    pending.push_back(PendingSync {
      store: name.to_string(),
      queued_at: self.clock.now(),
    });
  }

  /// Stores waiting for reconciliation, oldest first.
  pub fn pending_syncs(&self) -> Vec<String> {
    self.pending().iter().map(|p| p.store.clone()).collect()
  }

  /// Reconcile every queued store. Failures re-queue themselves.
  ///
  /// Returns the number of stores reconciled successfully.
  pub async fn process_sync_queue(&self) -> usize {
    if !self.connectivity.is_online() {
      return 0;
    }
    let queued: Vec<PendingSync> = self.pending().drain(..).collect();
    let mut reconciled = 0;
    for entry in queued {
      match self.reconcile(&entry.store).await {
        Ok(Reconciled::Merged { .. }) => reconciled += 1,
        Ok(Reconciled::Skipped) => self.queue_sync(&entry.store),
        Err(SyncError::Remote(_)) | Err(SyncError::UnexpectedPayload { .. }) => {}
        Err(e) => warn!(
          store = %entry.store,
          queued_at = %entry.queued_at,
          error = %e,
          "dropping queued sync"
        ),
      }
    }
    reconciled
  }

  /// Per-store last sync, version and item count.
  pub fn sync_status(&self) -> BTreeMap<String, StoreStatus> {
    self
      .stores()
      .iter()
      .map(|(name, record)| {
        (
          name.clone(),
          StoreStatus {
            last_sync: record.last_sync,
            version: record.version,
            item_count: record.items.len(),
          },
        )
      })
      .collect()
  }

  /// Apply `entity.created`, `entity.updated` and `entity.deleted` events from `bus`.
  pub fn attach_bus(self: &Arc<Self>, bus: &EventBus) -> Vec<HandlerId> {
    let created = {
      let manager = Arc::downgrade(self);
      bus.on(names::ENTITY_CREATED, move |payload| {
        with_manager(&manager, payload, |m, store| {
          let item = payload.get("item").cloned().unwrap_or(Value::Null);
          m.add_item(store, item).map(|_| ())
        });
      })
    };

    let updated = {
      let manager = Arc::downgrade(self);
      bus.on(names::ENTITY_UPDATED, move |payload| {
        with_manager(&manager, payload, |m, store| {
          let id = payload.get("id").cloned().unwrap_or(Value::Null);
          let changes = match payload.get("changes") {
            Some(Value::Object(fields)) => fields.clone(),
            _ => {
              return Err(SyncError::Validation(
                "entity.updated requires an object of changes".to_string(),
              ))
            }
          };
          m.update_item(store, &id, changes).map(|_| ())
        });
      })
    };

    let deleted = {
      let manager = Arc::downgrade(self);
      bus.on(names::ENTITY_DELETED, move |payload| {
        with_manager(&manager, payload, |m, store| {
          let id = payload.get("id").cloned().unwrap_or(Value::Null);
          m.remove_item(store, &id).map(|_| ())
        });
      })
    };

    vec![created, updated, deleted]
  }

  /// Background reconciliation.
  ///
  /// Every `every` while online, and whenever `foreground` turns true, all
  /// stores are reconciled. Each reconnect processes the sync queue.
  pub fn spawn_auto_sync(
    self: &Arc<Self>,
    every: Duration,
    mut foreground: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    let manager = Arc::clone(self);
    let mut online = self.connectivity.subscribe();
    tokio::spawn(async move {
      let start = tokio::time::Instant::now() + every;
      let mut ticker = tokio::time::interval_at(start, every);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      let mut foreground_open = true;

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if manager.connectivity.is_online() {
              debug!("periodic reconciliation");
              manager.reconcile_all().await;
            }
          }
          changed = foreground.changed(), if foreground_open => {
            if changed.is_err() {
              foreground_open = false;
              continue;
            }
            let visible = *foreground.borrow_and_update();
            if visible && manager.connectivity.is_online() {
              debug!("foreground reconciliation");
              manager.reconcile_all().await;
            }
          }
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
            if *online.borrow_and_update() {
              manager.process_sync_queue().await;
            }
          }
        }
      }
    })
  }

  fn publish(&self, name: &str, payload: Value) {
    if let Some(bus) = &self.bus {
      bus.emit(name, &payload);
    }
  }
}

enum MutateError {
  Unchanged,
  Failed(SyncError),
}

impl From<SyncError> for MutateError {
  fn from(e: SyncError) -> Self {
    MutateError::Failed(e)
  }
}

impl From<MutateError> for SyncError {
  fn from(e: MutateError) -> Self {
    match e {
      MutateError::Failed(e) => e,
      // Callers that can report "no change" match on it before converting
      MutateError::Unchanged => SyncError::Validation("no matching item".to_string()),
    }
  }
}

fn with_manager(
  manager: &Weak<SyncManager>,
  payload: &Value,
  apply: impl FnOnce(&SyncManager, &str) -> Result<(), SyncError>,
) {
  let Some(manager) = manager.upgrade() else {
    return;
  };
  let Some(store) = payload.get("store").and_then(Value::as_str) else {
    warn!(%payload, "entity event without a store name");
    return;
  };
  if let Err(e) = apply(&manager, store) {
    warn!(store, error = %e, "failed to apply entity event");
  }
}
