//! Feature modules built on top of the core components.
//!
//! A feature module never holds a reference to another feature module; it
//! talks to the rest of the system through the [`ModuleContext`] handed to it
//! at start-up, mostly by publishing and subscribing on the event bus.

mod change_feed;

use std::sync::Arc;

use crate::bootstrap::LoadError;
use crate::event::EventBus;
use crate::gateway::RequestGateway;
use crate::sync::SyncManager;

pub use change_feed::{ChangeFeed, FeedEntry};

/// Core components available to feature modules.
#[derive(Clone)]
pub struct ModuleContext {
  pub bus: EventBus,
  pub gateway: Arc<RequestGateway>,
  pub sync: Arc<SyncManager>,
}

pub trait FeatureModule: Send + Sync {
  fn name(&self) -> &str;

  /// Wire the module up. Called once, after every requested module has loaded.
  fn start(&self, ctx: &ModuleContext) -> Result<(), LoadError>;

  /// Release subscriptions taken in `start`.
  fn stop(&self) {}
}

/// Feature modules compiled into the crate, by loader source.
pub fn builtin(source: &str) -> Option<Arc<dyn FeatureModule>> {
  match source {
    change_feed::NAME => Some(Arc::new(ChangeFeed::new())),
    _ => None,
  }
}
