use thiserror::Error;

/// Fatal bootstrap configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BootstrapError {
  #[error("module dependency cycle: {}", path.join(" -> "))]
  Cycle { path: Vec<String> },

  #[error("bootstrapper shut down before module {0} loaded")]
  Closed(String),
}

/// Failure of a single module. Logged; the module is marked non-functional.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
  #[error("no module registered for source {0}")]
  UnknownSource(String),

  #[error("failed to load module {module}: {reason}")]
  Load { module: String, reason: String },

  #[error("failed to initialize module {module}: {reason}")]
  Init { module: String, reason: String },
}
