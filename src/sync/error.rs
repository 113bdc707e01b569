use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum SyncError {
  #[error("unknown store: {0}")]
  UnknownStore(String),

  #[error("invalid data: {0}")]
  Validation(String),

  #[error("shared storage error: {0}")]
  Storage(String),

  #[error("remote fetch failed: {0}")]
  Remote(#[from] GatewayError),

  #[error("remote payload for store {store} is not a list of items")]
  UnexpectedPayload { store: String },
}
