//! Logs store and request lifecycle events as they cross the bus.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::bootstrap::LoadError;
use crate::event::{names, EventBus, HandlerId};

use super::{FeatureModule, ModuleContext};

pub const NAME: &str = "change-feed";

const WATCHED: [&str; 5] = [
  names::STORE_UPDATED,
  names::SYNC_FAILED,
  names::REQUEST_QUEUED,
  names::REQUEST_ABANDONED,
  names::QUEUE_DRAINED,
];

/// Most recent entries kept for [`ChangeFeed::recent`].
const HISTORY: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
  pub event: String,
  pub payload: Value,
}

#[derive(Default)]
pub struct ChangeFeed {
  history: Arc<Mutex<VecDeque<FeedEntry>>>,
  handlers: Mutex<Option<(EventBus, Vec<(&'static str, HandlerId)>)>>,
}

impl ChangeFeed {
  pub fn new() -> Self {
    Self::default()
  }

  /// Latest events, oldest first.
  pub fn recent(&self) -> Vec<FeedEntry> {
    self
      .history
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .iter()
      .cloned()
      .collect()
  }
}

fn log_event(event: &str, payload: &Value) {
  match event {
    names::SYNC_FAILED | names::REQUEST_ABANDONED => {
      warn!(event, %payload, "change feed")
    }
    _ => info!(event, %payload, "change feed"),
  }
}

impl FeatureModule for ChangeFeed {
  fn name(&self) -> &str {
    NAME
  }

  fn start(&self, ctx: &ModuleContext) -> Result<(), LoadError> {
    let mut handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
    if handlers.is_some() {
      return Ok(());
    }

    let ids = WATCHED
      .iter()
      .map(|&event| {
        let history = Arc::clone(&self.history);
        let id = ctx.bus.on(event, move |payload| {
          log_event(event, payload);
          let mut history = history.lock().unwrap_or_else(|p| p.into_inner());
          if history.len() == HISTORY {
            history.pop_front();
          }
          history.push_back(FeedEntry {
            event: event.to_string(),
            payload: payload.clone(),
          });
        });
        (event, id)
      })
      .collect();

    *handlers = Some((ctx.bus.clone(), ids));
    Ok(())
  }

  fn stop(&self) {
    let taken = self
      .handlers
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .take();
    if let Some((bus, ids)) = taken {
      for (event, id) in ids {
        bus.off(event, id);
      }
    }
  }
}
