//! Remote authority for store contents.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::gateway::RequestGateway;

use super::error::SyncError;

/// Source of the authoritative item list for a store.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  async fn fetch(&self, store: &str) -> Result<Vec<Value>, SyncError>;
}

/// Fetches store contents through the request gateway.
///
/// Stores map to endpoints through `endpoints`; unmapped stores use `/<store>`.
pub struct GatewayRemote {
  gateway: Arc<RequestGateway>,
  endpoints: BTreeMap<String, String>,
}

impl GatewayRemote {
  pub fn new(gateway: Arc<RequestGateway>) -> Self {
    Self {
      gateway,
      endpoints: BTreeMap::new(),
    }
  }

  pub fn with_endpoints(mut self, endpoints: BTreeMap<String, String>) -> Self {
    self.endpoints = endpoints;
    self
  }

  pub fn endpoint_for(&self, store: &str) -> String {
    self
      .endpoints
      .get(store)
      .cloned()
      .unwrap_or_else(|| format!("/{}", store))
  }
}

#[async_trait]
impl RemoteSource for GatewayRemote {
  async fn fetch(&self, store: &str) -> Result<Vec<Value>, SyncError> {
    let endpoint = self.endpoint_for(store);
    let payload = self.gateway.get(&endpoint).await?;
    extract_items(store, payload)
  }
}

/// Accept a bare array, or an object wrapping one under `items` or `data`.
fn extract_items(store: &str, payload: Value) -> Result<Vec<Value>, SyncError> {
  match payload {
    Value::Array(items) => Ok(items),
    Value::Object(mut fields) => {
      for key in ["items", "data"] {
        if let Some(Value::Array(items)) = fields.remove(key) {
          return Ok(items);
        }
      }
      Err(SyncError::UnexpectedPayload {
        store: store.to_string(),
      })
    }
    _ => Err(SyncError::UnexpectedPayload {
      store: store.to_string(),
    }),
  }
}
