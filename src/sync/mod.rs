//! Versioned local stores.
//!
//! The [`SyncManager`] owns named collections of JSON entities. Every mutation
//! bumps the store version, persists a snapshot to a [`SharedStore`] visible to
//! other execution contexts, and notifies subscribers. Snapshots written by
//! other contexts are applied only when they carry a newer version. When a
//! [`RemoteSource`] is configured, stores are reconciled with it by upserting
//! remote items by `id`.

mod error;
mod manager;
mod remote;
mod shared;
mod storage;
mod store;

pub use error::SyncError;
pub use manager::{
  Reconciled, StoreStatus, StoreUpdate, Subscriber, SubscriptionId, SyncManager,
  DEFAULT_NAMESPACE, DEFAULT_STORES,
};
pub use remote::{GatewayRemote, RemoteSource};
pub use shared::{ExternalChange, MemorySharedStore, SharedStore};
pub use storage::SqliteSharedStore;
pub use store::{item_id, merge_by_id, merge_fields, Origin, Snapshot, StoreRecord};
