//! Dependency-ordered, single-flight module loading.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::error::{BootstrapError, LoadError};
use crate::event::panic_message;
use super::loader::ModuleLoader;
use super::registry::ModuleRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
  Unloaded,
  Loading,
  Loaded,
}

/// Snapshot of loader progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadingStatus {
  pub loaded: Vec<String>,
  pub loading: Vec<String>,
  /// Modules in the order they finished loading
  pub order: Vec<String>,
}

/// Outcome of [`Bootstrapper::initialize_modules`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
  /// Every module loaded so far, in load-finish order
  pub loaded: Vec<String>,
  /// Modules initialized by this call, in order
  pub initialized: Vec<String>,
  /// Modules that failed to load or initialize
  pub failed: Vec<String>,
}

#[derive(Default)]
struct Progress {
  states: HashMap<String, watch::Sender<ModuleState>>,
  functional: HashMap<String, bool>,
  order: Vec<String>,
  initialized: HashSet<String>,
}

impl Progress {
  fn slot(&mut self, name: &str) -> &watch::Sender<ModuleState> {
    self
      .states
      .entry(name.to_string())
      .or_insert_with(|| watch::channel(ModuleState::Unloaded).0)
  }

  fn state(&self, name: &str) -> ModuleState {
    self
      .states
      .get(name)
      .map_or(ModuleState::Unloaded, |tx| *tx.borrow())
  }
}

enum Claim {
  Loaded,
  InFlight(watch::Receiver<ModuleState>),
  Owner,
}

/// Held by the task that owns a module's load. If that task goes away before
/// finishing (its future dropped mid-load), the module is settled as loaded
/// and non-functional so nobody waits on it forever.
struct LoadGuard<'a> {
  bootstrapper: &'a Bootstrapper,
  name: &'a str,
  armed: bool,
}

impl LoadGuard<'_> {
  fn finish(mut self, functional: bool) {
    self.armed = false;
    self.bootstrapper.settle(self.name, functional);
  }
}

impl Drop for LoadGuard<'_> {
  fn drop(&mut self) {
    if self.armed {
      warn!(module = self.name, "module load abandoned before completing");
      self.bootstrapper.settle(self.name, false);
    }
  }
}

/// Loads modules depth-first through their dependencies, then initializes them
/// in the order they finished loading.
///
/// Concurrent requests for the same module collapse into one load. A module
/// that fails to load is still marked loaded (so dependents proceed) but is
/// flagged non-functional and skipped by the initialization pass.
pub struct Bootstrapper {
  registry: ModuleRegistry,
  loader: Arc<dyn ModuleLoader>,
  progress: Mutex<Progress>,
  /// Serializes initialization passes across concurrent callers
  init_pass: tokio::sync::Mutex<()>,
}

impl Bootstrapper {
  /// Fails if the registry's dependency graph has a cycle.
  pub fn new(registry: ModuleRegistry, loader: Arc<dyn ModuleLoader>) -> Result<Self, BootstrapError> {
    registry.validate()?;
    Ok(Self {
      registry,
      loader,
      progress: Mutex::new(Progress::default()),
      init_pass: tokio::sync::Mutex::new(()),
    })
  }

  pub fn registry(&self) -> &ModuleRegistry {
    &self.registry
  }

  fn progress(&self) -> MutexGuard<'_, Progress> {
    self.progress.lock().unwrap_or_else(|p| p.into_inner())
  }

  /// Load `required` (and their dependencies), then initialize everything
  /// loaded but not yet initialized.
  pub async fn initialize_modules<S: AsRef<str>>(&self, required: &[S]) -> BootstrapReport {
    let mut requested: Vec<&str> = Vec::new();
    for name in required {
      if !requested.contains(&name.as_ref()) {
        requested.push(name.as_ref());
      }
    }
    info!(modules = ?requested, "loading modules");

    for name in &requested {
      self.load_module(name).await;
    }

    let mut report = self.initialize_loaded().await;
    report.loaded = self.progress().order.clone();
    info!(order = ?report.loaded, failed = ?report.failed, "modules initialized");
    report
  }

  /// Initialize the modules configured for `context`.
  pub async fn initialize_context(&self, context: &str) -> BootstrapReport {
    let modules = self.registry.modules_for_context(context);
    self.initialize_modules(&modules).await
  }

  /// Load `name` after its dependencies. Resolves once `name` is loaded,
  /// whether by this call or a concurrent one.
  pub fn load_module<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ()> {
    async move {
      let claim = {
        let mut progress = self.progress();
        let slot = progress.slot(name);
        let state = *slot.borrow();
        match state {
          ModuleState::Loaded => Claim::Loaded,
          ModuleState::Loading => Claim::InFlight(slot.subscribe()),
          ModuleState::Unloaded => {
            slot.send_replace(ModuleState::Loading);
            Claim::Owner
          }
        }
      };

      match claim {
        Claim::Loaded => return,
        Claim::InFlight(mut rx) => {
          let _ = rx.wait_for(|s| *s == ModuleState::Loaded).await;
          return;
        }
        Claim::Owner => {}
      }

      let guard = LoadGuard {
        bootstrapper: self,
        name,
        armed: true,
      };

      for dep in self.registry.dependencies(name) {
        self.load_module(dep).await;
      }

      let source = self.registry.source(name);
      let outcome = AssertUnwindSafe(self.loader.load(name, &source))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
          error!(module = name, "module loader panicked");
          Err(LoadError::Load {
            module: name.to_string(),
            reason: panic_message(&*panic),
          })
        });
      let functional = match outcome {
        Ok(()) => true,
        Err(e) => {
          warn!(module = name, error = %e, "module failed to load, continuing without it");
          false
        }
      };

      guard.finish(functional);
      info!(module = name, functional, "module loaded");
    }
    .boxed()
  }

  /// Record the end of a module's load and release its waiters.
  fn settle(&self, name: &str, functional: bool) {
    let mut progress = self.progress();
    progress.functional.insert(name.to_string(), functional);
    progress.order.push(name.to_string());
    progress.slot(name).send_replace(ModuleState::Loaded);
  }

  /// Run the initialization pass over loaded modules in load-finish order.
  /// Each module is initialized at most once across calls.
  async fn initialize_loaded(&self) -> BootstrapReport {
    // A module's init may rely on every earlier module having finished its own
    let _pass = self.init_pass.lock().await;
    let mut report = BootstrapReport::default();
    let order = self.progress().order.clone();

    for name in order {
      let functional = {
        let mut progress = self.progress();
        if !progress.initialized.insert(name.clone()) {
          continue;
        }
        progress.functional.get(&name).copied().unwrap_or(false)
      };

      if !functional {
        report.failed.push(name);
        continue;
      }

      match self.loader.initialize(&name).await {
        Ok(()) => report.initialized.push(name),
        Err(e) => {
          warn!(module = %name, error = %e, "module failed to initialize");
          self.progress().functional.insert(name.clone(), false);
          report.failed.push(name);
        }
      }
    }
    report
  }

  /// Resolves once `name` has loaded; immediately if it already has.
  ///
  /// The returned future does not borrow the bootstrapper.
  pub fn wait_for_module(
    &self,
    name: &str,
  ) -> impl Future<Output = Result<(), BootstrapError>> + Send + 'static {
    let mut rx = self.progress().slot(name).subscribe();
    let name = name.to_string();
    async move {
      rx.wait_for(|s| *s == ModuleState::Loaded)
        .await
        .map(|_| ())
        .map_err(|_| BootstrapError::Closed(name))
    }
  }

  pub fn module_state(&self, name: &str) -> ModuleState {
    self.progress().state(name)
  }

  /// Whether `name` loaded successfully and has not failed initialization.
  pub fn is_functional(&self, name: &str) -> bool {
    self.progress().functional.get(name).copied().unwrap_or(false)
  }

  /// True if every module in `names` has loaded.
  pub fn are_modules_ready<S: AsRef<str>>(&self, names: &[S]) -> bool {
    let progress = self.progress();
    names
      .iter()
      .all(|name| progress.state(name.as_ref()) == ModuleState::Loaded)
  }

  pub fn loading_status(&self) -> LoadingStatus {
    let progress = self.progress();
    let mut loading: Vec<String> = progress
      .states
      .iter()
      .filter(|(_, tx)| *tx.borrow() == ModuleState::Loading)
      .map(|(name, _)| name.clone())
      .collect();
    loading.sort();
    LoadingStatus {
      loaded: progress.order.clone(),
      loading,
      order: progress.order.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::time::Duration;

  /// Loader that records every call and can be told to fail or stall.
  #[derive(Default)]
  struct RecordingLoader {
    calls: Mutex<Vec<String>>,
    broken: HashSet<String>,
    broken_init: HashSet<String>,
    panicking: HashSet<String>,
    delay: Option<Duration>,
    /// Modules whose init takes this long; their completion is recorded as `ready:<name>`
    slow_init: HashMap<String, Duration>,
  }

  impl RecordingLoader {
    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
      self.calls().iter().filter(|c| *c == call).count()
    }
  }

  #[async_trait]
  impl ModuleLoader for RecordingLoader {
    async fn load(&self, name: &str, source: &str) -> Result<(), LoadError> {
      self.calls.lock().unwrap().push(format!("load:{}", name));
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      if self.panicking.contains(name) {
        panic!("loader for {} blew up", name);
      }
      if self.broken.contains(name) {
        return Err(LoadError::UnknownSource(source.to_string()));
      }
      Ok(())
    }

    async fn initialize(&self, name: &str) -> Result<(), LoadError> {
      self.calls.lock().unwrap().push(format!("init:{}", name));
      if let Some(delay) = self.slow_init.get(name) {
        tokio::time::sleep(*delay).await;
        self.calls.lock().unwrap().push(format!("ready:{}", name));
      }
      if self.broken_init.contains(name) {
        return Err(LoadError::Init {
          module: name.to_string(),
          reason: "boom".to_string(),
        });
      }
      Ok(())
    }
  }

  fn registry(yaml: &str) -> ModuleRegistry {
    serde_yaml::from_str(yaml).unwrap()
  }

  fn bootstrapper(yaml: &str, loader: &Arc<RecordingLoader>) -> Bootstrapper {
    Bootstrapper::new(registry(yaml), loader.clone()).unwrap()
  }

  #[tokio::test]
  async fn test_dependencies_load_and_initialize_first() {
    let loader = Arc::new(RecordingLoader::default());
    let boot = bootstrapper("dependencies: { bus: [], sync: [bus] }", &loader);

    let report = boot.initialize_modules(&["sync"]).await;

    assert_eq!(
      loader.calls(),
      vec!["load:bus", "load:sync", "init:bus", "init:sync"]
    );
    assert_eq!(report.loaded, vec!["bus", "sync"]);
    assert_eq!(report.initialized, vec!["bus", "sync"]);
    assert!(report.failed.is_empty());
    assert!(boot.are_modules_ready(&["bus", "sync"]));
  }

  #[tokio::test]
  async fn test_every_dependency_finishes_before_its_dependents() {
    let loader = Arc::new(RecordingLoader::default());
    let yaml = r#"
dependencies:
  errors: []
  sync: [errors]
  api: [errors]
  config: [errors]
  main: [errors, config, sync, api]
  integration: [main, config, sync]
  assignments: [integration, config, sync]
  admin: [integration, assignments]
"#;
    let boot = bootstrapper(yaml, &loader);
    boot.initialize_modules(&["admin", "api", "sync"]).await;

    let order = boot.loading_status().order;
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();
    for (module, deps) in &boot.registry().dependencies {
      for dep in deps {
        assert!(
          position(dep) < position(module),
          "{} loaded before its dependency {}",
          module,
          dep
        );
      }
    }
    assert_eq!(order.len(), 8);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_requests_load_once() {
    let loader = Arc::new(RecordingLoader {
      delay: Some(Duration::from_millis(50)),
      ..Default::default()
    });
    let boot = bootstrapper("dependencies: { bus: [], sync: [bus], gateway: [bus] }", &loader);

    let (a, b) = tokio::join!(
      boot.initialize_modules(&["sync"]),
      boot.initialize_modules(&["sync", "gateway"]),
    );

    assert_eq!(loader.count("load:bus"), 1);
    assert_eq!(loader.count("load:sync"), 1);
    assert_eq!(loader.count("load:gateway"), 1);
    assert_eq!(loader.count("init:bus"), 1);
    assert_eq!(loader.count("init:sync"), 1);

    let mut initialized = [a.initialized, b.initialized].concat();
    initialized.sort();
    assert_eq!(initialized, vec!["bus", "gateway", "sync"]);
  }

  #[tokio::test]
  async fn test_load_failure_is_tolerated() {
    let loader = Arc::new(RecordingLoader {
      broken: HashSet::from(["gateway".to_string()]),
      broken_init: HashSet::from(["reports".to_string()]),
      ..Default::default()
    });
    let boot = bootstrapper(
      "dependencies: { bus: [], gateway: [bus], sync: [bus, gateway], reports: [sync] }",
      &loader,
    );

    let report = boot.initialize_modules(&["sync", "reports"]).await;

    assert_eq!(report.loaded, vec!["bus", "gateway", "sync", "reports"]);
    assert_eq!(report.initialized, vec!["bus", "sync"]);
    assert_eq!(report.failed, vec!["gateway", "reports"]);
    assert_eq!(loader.count("init:gateway"), 0);
    assert!(!boot.is_functional("gateway"));
    assert!(!boot.is_functional("reports"));
    assert!(boot.is_functional("sync"));
    assert_eq!(boot.module_state("gateway"), ModuleState::Loaded);
  }

  #[tokio::test]
  async fn test_initialization_runs_once_across_calls() {
    let loader = Arc::new(RecordingLoader::default());
    let boot = bootstrapper("dependencies: { bus: [], sync: [bus], feed: [sync] }", &loader);

    boot.initialize_modules(&["sync"]).await;
    let second = boot.initialize_modules(&["feed", "sync"]).await;

    assert_eq!(second.initialized, vec!["feed"]);
    assert_eq!(
      loader.calls(),
      vec!["load:bus", "load:sync", "init:bus", "init:sync", "load:feed", "init:feed"]
    );
  }

  #[test]
  fn test_cycle_is_fatal() {
    let loader: Arc<dyn ModuleLoader> = Arc::new(RecordingLoader::default());
    let err = Bootstrapper::new(registry("dependencies: { a: [b], b: [a] }"), loader)
      .err()
      .unwrap();
    assert!(matches!(err, BootstrapError::Cycle { .. }));
  }

  #[tokio::test]
  async fn test_wait_for_module_releases_all_waiters() {
    let loader = Arc::new(RecordingLoader::default());
    let boot = Arc::new(bootstrapper("dependencies: { bus: [], sync: [bus] }", &loader));

    let first = tokio::spawn(boot.wait_for_module("sync"));
    let second = tokio::spawn(boot.wait_for_module("sync"));
    tokio::task::yield_now().await;
    assert!(!first.is_finished());
    assert_eq!(boot.module_state("sync"), ModuleState::Unloaded);

    boot.initialize_modules(&["sync"]).await;

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Already loaded: resolves immediately
    boot.wait_for_module("bus").await.unwrap();
  }

  #[tokio::test]
  async fn test_initialize_context_uses_registry_mapping() {
    let loader = Arc::new(RecordingLoader::default());
    let yaml = r#"
dependencies: { bus: [], grades: [bus], reports: [bus] }
base: [bus]
contexts:
  - matches: student
    modules: [grades]
  - matches: admin
    modules: [reports]
"#;
    let boot = bootstrapper(yaml, &loader);

    let report = boot.initialize_context("student-dashboard").await;

    assert_eq!(report.loaded, vec!["bus", "grades"]);
    assert_eq!(boot.module_state("reports"), ModuleState::Unloaded);
    let status = boot.loading_status();
    assert_eq!(status.loaded, vec!["bus", "grades"]);
    assert!(status.loading.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_passes_initialize_in_order() {
    let loader = Arc::new(RecordingLoader {
      slow_init: HashMap::from([("bus".to_string(), Duration::from_millis(100))]),
      ..Default::default()
    });
    let boot = bootstrapper("dependencies: { bus: [], sync: [bus] }", &loader);

    tokio::join!(
      boot.initialize_modules(&["sync"]),
      boot.initialize_modules(&["sync"]),
    );

    let inits: Vec<String> = loader
      .calls()
      .into_iter()
      .filter(|c| !c.starts_with("load:"))
      .collect();
    assert_eq!(inits, vec!["init:bus", "ready:bus", "init:sync"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_load_does_not_block_later_callers() {
    let loader = Arc::new(RecordingLoader {
      delay: Some(Duration::from_secs(10)),
      ..Default::default()
    });
    let boot = bootstrapper("dependencies: { slow: [] }", &loader);

    let attempt =
      tokio::time::timeout(Duration::from_secs(1), boot.initialize_modules(&["slow"])).await;
    assert!(attempt.is_err());
    assert_eq!(boot.module_state("slow"), ModuleState::Loaded);
    assert!(!boot.is_functional("slow"));

    let retry =
      tokio::time::timeout(Duration::from_secs(1), boot.initialize_modules(&["slow"])).await;
    assert_eq!(retry.unwrap().failed, vec!["slow"]);
    boot.wait_for_module("slow").await.unwrap();
  }

  #[tokio::test]
  async fn test_panicking_loader_counts_as_load_failure() {
    let loader = Arc::new(RecordingLoader {
      panicking: HashSet::from(["gateway".to_string()]),
      ..Default::default()
    });
    let boot = bootstrapper("dependencies: { bus: [], gateway: [bus], sync: [gateway] }", &loader);

    let report = boot.initialize_modules(&["sync"]).await;

    assert_eq!(report.loaded, vec!["bus", "gateway", "sync"]);
    assert_eq!(report.initialized, vec!["bus", "sync"]);
    assert_eq!(report.failed, vec!["gateway"]);
    assert_eq!(boot.module_state("gateway"), ModuleState::Loaded);
  }
}
