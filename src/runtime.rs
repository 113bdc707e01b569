//! Process-wide wiring of the bus, gateway, sync manager and bootstrapper.
//!
//! One [`Runtime`] is built at startup and shut down on exit; nothing in the
//! crate is a global.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bootstrap::{
  BootstrapReport, Bootstrapper, LoadError, ModuleLoader, BUS, GATEWAY, SYNC,
};
use crate::config::Config;
use crate::event::EventBus;
use crate::gateway::{
  spawn_probe, Connectivity, CredentialSource, EnvCredentials, RequestGateway, ReqwestTransport,
  Transport,
};
use crate::modules::{self, FeatureModule, ModuleContext};
use crate::sync::{GatewayRemote, SharedStore, SqliteSharedStore, SyncManager};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns every core component and the background tasks they run.
pub struct Runtime {
  ctx: ModuleContext,
  foreground: watch::Sender<bool>,
  bootstrapper: Bootstrapper,
  loader: Arc<CoreLoader>,
  sqlite: Option<Arc<SqliteSharedStore>>,
  watching: AtomicBool,
  change_poll: Duration,
}

impl Runtime {
  /// Build the production runtime: HTTP transport, environment credentials
  /// and the SQLite shared store.
  pub fn new(config: Config) -> Result<Self> {
    let transport = Arc::new(ReqwestTransport::new(
      &config.api.base_url,
      config.api.timeout(),
    )?);

    let sqlite = Arc::new(match &config.sync.database {
      Some(path) => SqliteSharedStore::open(path)?,
      None => SqliteSharedStore::open_default()?,
    });

    let mut runtime = Self::from_parts(
      config,
      transport,
      Arc::new(EnvCredentials),
      sqlite.clone(),
    )?;
    runtime.sqlite = Some(sqlite);
    Ok(runtime)
  }

  /// Build a runtime around the given collaborators.
  pub fn from_parts(
    config: Config,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    shared: Arc<dyn SharedStore>,
  ) -> Result<Self> {
    let bus = EventBus::new();
    let connectivity = Connectivity::new(true);
    let (foreground, foreground_rx) = watch::channel(false);

    let gateway = Arc::new(
      RequestGateway::new(
        transport.clone(),
        credentials,
        connectivity.clone(),
        config.api.gateway_config(),
      )
      .with_bus(bus.clone()),
    );

    let remote =
      GatewayRemote::new(gateway.clone()).with_endpoints(config.sync.endpoints.clone());
    let sync = Arc::new(
      SyncManager::new(shared, connectivity)
        .with_remote(Arc::new(remote))
        .with_bus(bus.clone())
        .with_namespace(config.sync.namespace.clone()),
    );

    let ctx = ModuleContext { bus, gateway, sync };
    let change_poll = config.sync.change_poll();
    let registry = config.registry();
    let loader = Arc::new(CoreLoader {
      ctx: ctx.clone(),
      transport,
      config,
      foreground: foreground_rx,
      features: Mutex::new(HashMap::new()),
      tasks: Mutex::new(Vec::new()),
    });
    let bootstrapper = Bootstrapper::new(registry, loader.clone())
      .map_err(|e| eyre!("Invalid module registry: {}", e))?;

    Ok(Self {
      ctx,
      foreground,
      bootstrapper,
      loader,
      sqlite: None,
      watching: AtomicBool::new(false),
      change_poll,
    })
  }

  /// Bring up the modules configured for `context`. Calling it again only
  /// loads what the new context adds.
  pub async fn start(&self, context: &str) -> BootstrapReport {
    if let Some(sqlite) = &self.sqlite {
      if !self.watching.swap(true, Ordering::SeqCst) {
        self.loader.track(sqlite.spawn_watcher(self.change_poll));
      }
    }
    info!(context, "starting runtime");
    self.bootstrapper.initialize_context(context).await
  }

  pub fn bus(&self) -> &EventBus {
    &self.ctx.bus
  }

  pub fn gateway(&self) -> &Arc<RequestGateway> {
    &self.ctx.gateway
  }

  pub fn sync(&self) -> &Arc<SyncManager> {
    &self.ctx.sync
  }

  pub fn bootstrapper(&self) -> &Bootstrapper {
    &self.bootstrapper
  }

  /// Report the application moving to (or away from) the foreground.
  /// Coming to the foreground triggers reconciliation of every store.
  pub fn set_foreground(&self, visible: bool) {
    self.foreground.send_replace(visible);
  }

  /// Stop feature modules and background tasks.
  pub fn shutdown(self) {
    let features: Vec<Arc<dyn FeatureModule>> = self
      .loader
      .features
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .drain()
      .map(|(_, module)| module)
      .collect();
    for module in features {
      debug!(module = module.name(), "stopping module");
      module.stop();
    }

    let tasks: Vec<JoinHandle<()>> = self
      .loader
      .tasks
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .drain(..)
      .collect();
    for task in tasks {
      task.abort();
    }

    self.ctx.bus.clear();
    info!("runtime shut down");
  }
}

/// Loads the core components (already constructed) and built-in feature
/// modules, and starts their background work on initialization.
struct CoreLoader {
  ctx: ModuleContext,
  transport: Arc<dyn Transport>,
  config: Config,
  foreground: watch::Receiver<bool>,
  features: Mutex<HashMap<String, Arc<dyn FeatureModule>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreLoader {
  fn track(&self, task: JoinHandle<()>) {
    self
      .tasks
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .push(task);
  }

  fn feature(&self, name: &str) -> Option<Arc<dyn FeatureModule>> {
    self
      .features
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .get(name)
      .cloned()
  }
}

#[async_trait]
impl ModuleLoader for CoreLoader {
  async fn load(&self, name: &str, source: &str) -> Result<(), LoadError> {
    match name {
      BUS | GATEWAY | SYNC => Ok(()),
      _ => {
        let module =
          modules::builtin(source).ok_or_else(|| LoadError::UnknownSource(source.to_string()))?;
        self
          .features
          .lock()
          .unwrap_or_else(|p| p.into_inner())
          .insert(name.to_string(), module);
        Ok(())
      }
    }
  }

  async fn initialize(&self, name: &str) -> Result<(), LoadError> {
    match name {
      BUS => Ok(()),
      GATEWAY => {
        self.track(self.ctx.gateway.spawn_reconnect_drain());
        let api = &self.config.api;
        if api.probe_interval_secs > 0 {
          self.track(spawn_probe(
            self.transport.clone(),
            self.ctx.gateway.connectivity().clone(),
            api.health_endpoint.clone(),
            Duration::from_secs(api.probe_interval_secs),
            PROBE_TIMEOUT,
          ));
        }
        Ok(())
      }
      SYNC => {
        let sync = &self.ctx.sync;
        sync.initialize_stores(&self.config.sync.stores);
        sync.attach_bus(&self.ctx.bus);
        self.track(sync.spawn_change_listener());
        self.track(sync.spawn_auto_sync(self.config.sync.interval(), self.foreground.clone()));
        Ok(())
      }
      _ => {
        let module = self
          .feature(name)
          .ok_or_else(|| LoadError::UnknownSource(name.to_string()))?;
        module.start(&self.ctx)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bootstrap::ModuleState;
  use crate::event::names;
  use crate::gateway::testing::ScriptedTransport;
  use crate::gateway::StaticCredentials;
  use crate::sync::MemorySharedStore;
  use serde_json::json;

  fn config() -> Config {
    let mut config = Config::default();
    config.api.probe_interval_secs = 0;
    config.sync.stores = vec!["students".to_string(), "fees".to_string()];
    config
      .modules
      .dependencies
      .insert("change-feed".to_string(), vec![BUS.to_string(), SYNC.to_string()]);
    config
      .modules
      .dependencies
      .insert("grades".to_string(), vec![SYNC.to_string()]);
    config.modules.base = vec!["change-feed".to_string()];
    config.modules.contexts = vec![crate::bootstrap::ContextRule {
      matches: "student".to_string(),
      modules: vec!["grades".to_string()],
    }];
    config
  }

  fn runtime(shared: &MemorySharedStore) -> Runtime {
    Runtime::from_parts(
      config(),
      Arc::new(ScriptedTransport::new()),
      Arc::new(StaticCredentials::default()),
      Arc::new(shared.clone()),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_start_brings_up_core_then_features() {
    let shared = MemorySharedStore::new();
    let runtime = runtime(&shared);

    let report = runtime.start("/login").await;

    assert_eq!(report.loaded, vec!["bus", "gateway", "sync", "change-feed"]);
    assert_eq!(report.initialized, report.loaded);
    assert!(report.failed.is_empty());
    assert_eq!(runtime.sync().store_names(), vec!["fees", "students"]);

    // Entity events published by feature code land in the stores
    runtime.bus().emit(
      names::ENTITY_CREATED,
      &json!({ "store": "students", "item": { "id": "s1" } }),
    );
    assert_eq!(runtime.sync().get_data("students"), vec![json!({ "id": "s1" })]);
    assert_eq!(
      shared.read("campus_connect_students").unwrap().unwrap().version,
      2
    );

    runtime.bootstrapper().wait_for_module(SYNC).await.unwrap();
    runtime.shutdown();
  }

  #[tokio::test]
  async fn test_unknown_feature_module_does_not_stop_bootstrap() {
    let shared = MemorySharedStore::new();
    let runtime = runtime(&shared);

    let report = runtime.start("student-dashboard").await;

    assert_eq!(report.failed, vec!["grades"]);
    assert_eq!(runtime.bootstrapper().module_state("grades"), ModuleState::Loaded);
    assert!(!runtime.bootstrapper().is_functional("grades"));
    assert!(runtime.bootstrapper().is_functional("change-feed"));
    runtime.shutdown();
  }

  #[tokio::test]
  async fn test_shutdown_releases_bus_subscriptions() {
    let shared = MemorySharedStore::new();
    let runtime = runtime(&shared);
    runtime.start("/").await;
    let bus = runtime.bus().clone();
    assert!(bus.listener_count(names::ENTITY_CREATED) > 0);

    runtime.shutdown();

    assert_eq!(bus.listener_count(names::ENTITY_CREATED), 0);
    assert_eq!(bus.listener_count(names::STORE_UPDATED), 0);
  }

  #[tokio::test]
  async fn test_repeated_start_spawns_background_work_once() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = Arc::new(SqliteSharedStore::open(&dir.path().join("shared.db")).unwrap());
    let mut runtime = Runtime::from_parts(
      config(),
      Arc::new(ScriptedTransport::new()),
      Arc::new(StaticCredentials::default()),
      sqlite.clone(),
    )
    .unwrap();
    runtime.sqlite = Some(sqlite);
    let task_count = |runtime: &Runtime| runtime.loader.tasks.lock().unwrap().len();

    runtime.start("/").await;
    let after_first = task_count(&runtime);
    runtime.start("/").await;

    assert_eq!(task_count(&runtime), after_first);
    runtime.shutdown();
  }
}
