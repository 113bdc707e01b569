use async_trait::async_trait;

use super::error::LoadError;

/// Brings individual modules up. The bootstrapper decides order and
/// guarantees each method runs at most once per module.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
  /// Make `name` available. `source` comes from the registry.
  async fn load(&self, name: &str, source: &str) -> Result<(), LoadError>;

  /// Start `name` once every requested module has loaded.
  async fn initialize(&self, name: &str) -> Result<(), LoadError>;
}
