//! FIFO queue of requests parked while offline.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::client::RequestOptions;

/// A request waiting for connectivity.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRequest {
  pub id: String,
  pub endpoint: String,
  pub options: RequestOptions,
  pub enqueued_at: DateTime<Utc>,
  /// Retries consumed so far; never exceeds the gateway's retry ceiling
  pub retry_count: u32,
}

impl QueuedRequest {
  pub fn new(endpoint: &str, options: RequestOptions, now: DateTime<Utc>) -> Self {
    Self {
      id: new_request_id(now),
      endpoint: endpoint.to_string(),
      options,
      enqueued_at: now,
      retry_count: 0,
    }
  }
}

/// Unique request identifier, sent as `X-Request-ID`.
pub fn new_request_id(now: DateTime<Utc>) -> String {
  let suffix = uuid::Uuid::new_v4().simple().to_string();
  format!("req_{}_{}", now.timestamp_millis(), &suffix[..9])
}

#[derive(Debug, Default)]
pub struct RequestQueue {
  items: Mutex<VecDeque<QueuedRequest>>,
}

impl RequestQueue {
  fn items(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
    self
      .items
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn push(&self, request: QueuedRequest) {
    self.items().push_back(request);
  }

  /// Take everything currently queued, oldest first.
  pub fn take_all(&self) -> Vec<QueuedRequest> {
    self.items().drain(..).collect()
  }

  /// Put requests back at the head of the queue, preserving their order ahead
  /// of anything enqueued in the meantime.
  pub fn restore_front(&self, requests: Vec<QueuedRequest>) {
    let mut items = self.items();
    for request in requests.into_iter().rev() {
      items.push_front(request);
    }
  }

  pub fn len(&self) -> usize {
    self.items().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items().is_empty()
  }

  pub fn ids(&self) -> Vec<String> {
    self.items().iter().map(|r| r.id.clone()).collect()
  }
}
