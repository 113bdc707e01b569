//! Synchronous publish/subscribe bus for cross-module coordination.
//!
//! Modules announce domain events by name (e.g. `entity.created`) and other
//! modules react to them without holding references to each other. Dispatch
//! happens on the caller's thread, in subscription order. A handler that panics
//! is logged and skipped; the remaining handlers still receive the event.

use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, trace};

/// Event names published by the core components.
pub mod names {
  pub const ENTITY_CREATED: &str = "entity.created";
  pub const ENTITY_UPDATED: &str = "entity.updated";
  pub const ENTITY_DELETED: &str = "entity.deleted";
  pub const STORE_UPDATED: &str = "store.updated";
  pub const SYNC_FAILED: &str = "sync.failed";
  pub const REQUEST_QUEUED: &str = "request.queued";
  pub const REQUEST_ABANDONED: &str = "request.abandoned";
  pub const QUEUE_DRAINED: &str = "queue.drained";
}

/// Callback invoked with the event payload.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`EventBus::on`]; pass it to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Outcome of a single `emit` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
  /// Handlers that returned normally
  pub delivered: usize,
  /// Handlers that panicked
  pub failed: usize,
}

#[derive(Default)]
struct BusInner {
  handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
  next_id: AtomicU64,
}

/// Named-event bus. Cloning shares the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
  inner: Arc<BusInner>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<(HandlerId, Handler)>>> {
    self
      .inner
      .handlers
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Subscribe `handler` to events named `name`.
  pub fn on<F>(&self, name: &str, handler: F) -> HandlerId
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .handlers()
      .entry(name.to_string())
      .or_default()
      .push((id, Arc::new(handler)));
    id
  }

  /// Remove a subscription. Returns false if it was not registered under `name`.
  pub fn off(&self, name: &str, id: HandlerId) -> bool {
    let mut handlers = self.handlers();
    let Some(list) = handlers.get_mut(name) else {
      return false;
    };
    let before = list.len();
    list.retain(|(hid, _)| *hid != id);
    let removed = list.len() != before;
    if list.is_empty() {
      handlers.remove(name);
    }
    removed
  }

  /// Deliver `payload` to every handler subscribed to `name`.
  ///
  /// The handler list is snapshotted before dispatch, so handlers may freely
  /// subscribe, unsubscribe or emit further events.
  pub fn emit(&self, name: &str, payload: &Value) -> Dispatch {
    let handlers: Vec<Handler> = match self.handlers().get(name) {
      Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
      None => return Dispatch::default(),
    };

    let mut dispatch = Dispatch::default();
    for handler in handlers {
      match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(()) => dispatch.delivered += 1,
        Err(panic) => {
          dispatch.failed += 1;
          error!(event = name, error = %panic_message(&*panic), "event handler panicked");
        }
      }
    }
    trace!(event = name, delivered = dispatch.delivered, "event dispatched");
    dispatch
  }

  /// Number of handlers currently subscribed to `name`.
  pub fn listener_count(&self, name: &str) -> usize {
    self.handlers().get(name).map_or(0, Vec::len)
  }

  /// Drop every subscription.
  pub fn clear(&self) {
    self.handlers().clear();
  }
}

impl std::fmt::Debug for EventBus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let handlers = self.handlers();
    f.debug_struct("EventBus")
      .field("events", &handlers.keys().collect::<Vec<_>>())
      .finish_non_exhaustive()
  }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_dispatch_in_subscription_order() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second", "third"] {
      let seen = seen.clone();
      bus.on("student.added", move |payload| {
        seen
          .lock()
          .unwrap()
          .push(format!("{}:{}", tag, payload["id"]));
      });
    }

    let dispatch = bus.emit("student.added", &json!({ "id": 7 }));
    assert_eq!(dispatch.delivered, 3);
    assert_eq!(
      *seen.lock().unwrap(),
      vec!["first:7", "second:7", "third:7"]
    );
  }

  #[test]
  fn test_panicking_handler_does_not_block_others() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicU64::new(0));

    let h = hits.clone();
    bus.on("fee.paid", move |_| {
      h.fetch_add(1, Ordering::SeqCst);
    });
    bus.on("fee.paid", |_| panic!("handler exploded"));
    let h = hits.clone();
    bus.on("fee.paid", move |_| {
      h.fetch_add(1, Ordering::SeqCst);
    });

    let dispatch = bus.emit("fee.paid", &Value::Null);
    assert_eq!(dispatch, Dispatch { delivered: 2, failed: 1 });
    assert_eq!(hits.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_off_removes_only_that_handler() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicU64::new(0));

    let h = hits.clone();
    let first = bus.on("message.sent", move |_| {
      h.fetch_add(1, Ordering::SeqCst);
    });
    let h = hits.clone();
    bus.on("message.sent", move |_| {
      h.fetch_add(10, Ordering::SeqCst);
    });

    assert!(bus.off("message.sent", first));
    assert!(!bus.off("message.sent", first));
    assert!(!bus.off("other", first));

    bus.emit("message.sent", &Value::Null);
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    assert_eq!(bus.listener_count("message.sent"), 1);
  }

  #[test]
  fn test_emit_without_listeners() {
    let bus = EventBus::new();
    assert_eq!(bus.emit("nobody.listens", &Value::Null), Dispatch::default());
  }

  #[test]
  fn test_handler_can_reenter_bus() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicU64::new(0));

    let inner_bus = bus.clone();
    bus.on("outer", move |payload| {
      inner_bus.emit("inner", payload);
    });
    let h = hits.clone();
    bus.on("inner", move |_| {
      h.fetch_add(1, Ordering::SeqCst);
    });

    bus.emit("outer", &json!("ping"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }
}
