use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bootstrap::ModuleRegistry;
use crate::gateway::{GatewayConfig, RetryPolicy, TtlTable};
use crate::sync::{DEFAULT_NAMESPACE, DEFAULT_STORES};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Module graph; the core modules are always added
  #[serde(default)]
  pub modules: ModuleRegistry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Per-request timeout
  pub timeout_ms: u64,
  /// Retries after the first attempt
  pub retry_attempts: u32,
  /// First backoff delay; doubles on every retry
  pub retry_delay_ms: u64,
  /// Endpoint prefix → cache TTL, on top of the built-in table
  pub cache_ttl_ms: BTreeMap<String, u64>,
  /// TTL for endpoints with no matching prefix
  pub default_ttl_ms: Option<u64>,
  pub health_endpoint: String,
  /// Connectivity probe period; 0 disables probing
  pub probe_interval_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080/api".to_string(),
      timeout_ms: 10_000,
      retry_attempts: 3,
      retry_delay_ms: 1_000,
      cache_ttl_ms: BTreeMap::new(),
      default_ttl_ms: None,
      health_endpoint: "/health".to_string(),
      probe_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Prefix of every shared-store key
  pub namespace: String,
  /// Background reconciliation period
  pub interval_secs: u64,
  /// Shared store location (default: data dir)
  pub database: Option<PathBuf>,
  pub stores: Vec<String>,
  /// Store name → remote endpoint; unmapped stores use `/<store>`
  pub endpoints: BTreeMap<String, String>,
  /// How often to look for writes from other processes
  pub change_poll_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      namespace: DEFAULT_NAMESPACE.to_string(),
      interval_secs: 300,
      database: None,
      stores: DEFAULT_STORES.iter().map(|s| s.to_string()).collect(),
      endpoints: BTreeMap::new(),
      change_poll_ms: 1_000,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub fn gateway_config(&self) -> GatewayConfig {
    let mut ttl = TtlTable::default();
    for (prefix, ms) in &self.cache_ttl_ms {
      ttl.set(prefix, chrono::Duration::milliseconds(*ms as i64));
    }
    if let Some(ms) = self.default_ttl_ms {
      ttl.set_fallback(chrono::Duration::milliseconds(ms as i64));
    }

    GatewayConfig {
      base_url: self.base_url.clone(),
      retry: RetryPolicy {
        max_retries: self.retry_attempts,
        base_delay: Duration::from_millis(self.retry_delay_ms),
      },
      ttl,
      health_endpoint: self.health_endpoint.clone(),
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn change_poll(&self) -> Duration {
    Duration::from_millis(self.change_poll_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./campus-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/campus-sync/config.yaml
  ///
  /// With no file found, built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("campus-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("campus-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let mut config: Config = serde_yaml::from_str(contents)?;
    config.modules = config.modules.with_core_modules();
    config
      .modules
      .validate()
      .map_err(|e| eyre!("Invalid module registry: {}", e))?;
    Ok(config)
  }

  /// Module registry with the core modules included.
  pub fn registry(&self) -> ModuleRegistry {
    self.modules.clone().with_core_modules()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.api.retry_attempts, 3);
    assert_eq!(config.sync.namespace, "campus_connect_");
    assert_eq!(config.sync.interval(), Duration::from_secs(300));
    assert_eq!(config.sync.stores.len(), 7);
    assert_eq!(config.registry().base, vec!["bus", "gateway", "sync"]);

    let gateway = config.api.gateway_config();
    assert_eq!(gateway.retry, RetryPolicy::default());
    assert_eq!(gateway.ttl.ttl_for("/fees"), chrono::Duration::minutes(10));
  }

  #[test]
  fn test_parse_overrides() {
    let yaml = r#"
api:
  base_url: https://campus.example.edu/api
  retry_attempts: 5
  retry_delay_ms: 250
  cache_ttl_ms:
    /timetable: 60000
  default_ttl_ms: 1000
sync:
  namespace: "tab_"
  stores: [students, fees]
  endpoints:
    fees: /finance/fees
modules:
  dependencies:
    change-feed: [sync]
  base: [change-feed]
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.api.base_url, "https://campus.example.edu/api");
    assert_eq!(config.api.timeout_ms, 10_000);
    let gateway = config.api.gateway_config();
    assert_eq!(gateway.retry.max_retries, 5);
    assert_eq!(gateway.retry.base_delay, Duration::from_millis(250));
    assert_eq!(gateway.ttl.ttl_for("/timetable/today"), chrono::Duration::seconds(60));
    assert_eq!(gateway.ttl.ttl_for("/unknown"), chrono::Duration::seconds(1));
    assert_eq!(gateway.ttl.ttl_for("/students"), chrono::Duration::minutes(5));

    assert_eq!(config.sync.namespace, "tab_");
    assert_eq!(config.sync.stores, vec!["students", "fees"]);
    assert_eq!(config.sync.endpoints["fees"], "/finance/fees");
    assert_eq!(config.sync.interval_secs, 300);

    assert_eq!(
      config.modules.modules_for_context("anything"),
      vec!["bus", "gateway", "sync", "change-feed"]
    );
  }

  #[test]
  fn test_cyclic_modules_are_rejected() {
    let yaml = r#"
modules:
  dependencies:
    a: [b]
    b: [a]
"#;
    let err = Config::parse(yaml).unwrap_err();
    assert!(err.to_string().contains("cycle"));
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "sync:\n  interval_secs: 60\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.sync.interval(), Duration::from_secs(60));
  }
}
