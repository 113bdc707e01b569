//! Request gateway that wraps a [`Transport`] with retries, caching and offline queueing.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::event::{names, EventBus};

use super::cache::{ResponseCache, TtlTable};
use super::client::{HttpRequest, Method, RequestOptions, Transport};
use super::connectivity::Connectivity;
use super::credentials::CredentialSource;
use super::error::{FailureCause, GatewayError};
use super::queue::{QueuedRequest, RequestQueue};

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt; a request is tried at most `max_retries + 1` times
  pub max_retries: u32,
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
    }
  }
}

impl RetryPolicy {
  /// Delays slept before each retry, in order.
  pub fn schedule(&self) -> Vec<Duration> {
    (1..=self.max_retries)
      .map(|attempt| backoff_delay(self.base_delay, attempt))
      .collect()
  }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
  let exponent = attempt.saturating_sub(1).min(31);
  base.saturating_mul(1u32 << exponent)
}

/// Static gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
  pub base_url: String,
  pub retry: RetryPolicy,
  pub ttl: TtlTable,
  pub health_endpoint: String,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      base_url: String::new(),
      retry: RetryPolicy::default(),
      ttl: TtlTable::default(),
      health_endpoint: "/health".to_string(),
    }
  }
}

/// One request of a batch.
#[derive(Debug, Clone)]
pub struct BatchRequest {
  pub endpoint: String,
  pub options: RequestOptions,
}

/// Tagged result of one batch member.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
  pub endpoint: String,
  pub result: Result<Value, GatewayError>,
}

impl BatchOutcome {
  pub fn is_success(&self) -> bool {
    self.result.is_ok()
  }
}

/// A queued request that failed its replay and was dropped.
#[derive(Debug, Clone, Serialize)]
pub struct AbandonedRequest {
  pub id: String,
  pub endpoint: String,
  pub retry_count: u32,
  pub error: String,
}

/// Result of replaying the offline queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
  /// Ids of requests that completed
  pub succeeded: Vec<String>,
  pub abandoned: Vec<AbandonedRequest>,
  /// Requests put back because connectivity dropped mid-drain
  pub deferred: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
  pub online: bool,
  pub base_url: String,
  pub cache_size: usize,
  pub queued_requests: usize,
  pub retry_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
  Healthy,
  Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
  pub status: Health,
  pub timestamp: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

enum AttemptError {
  Retryable(FailureCause),
  Fatal(GatewayError),
}

/// Network request gateway.
///
/// Constructed once at startup and shared behind an `Arc`.
pub struct RequestGateway {
  transport: Arc<dyn Transport>,
  credentials: Arc<dyn CredentialSource>,
  connectivity: Connectivity,
  cache: ResponseCache,
  queue: RequestQueue,
  retry: Mutex<RetryPolicy>,
  base_url: String,
  health_endpoint: String,
  bus: Option<EventBus>,
  clock: Arc<dyn Clock>,
  drain_lock: tokio::sync::Mutex<()>,
}

impl RequestGateway {
  pub fn new(
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    connectivity: Connectivity,
    config: GatewayConfig,
  ) -> Self {
    Self {
      transport,
      credentials,
      connectivity,
      cache: ResponseCache::new(config.ttl),
      queue: RequestQueue::default(),
      retry: Mutex::new(config.retry),
      base_url: config.base_url,
      health_endpoint: config.health_endpoint,
      bus: None,
      clock: Arc::new(SystemClock),
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Publish queue events on `bus`.
  pub fn with_bus(mut self, bus: EventBus) -> Self {
    self.bus = Some(bus);
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    *self.retry.lock().unwrap_or_else(|p| p.into_inner())
  }

  pub fn set_retry_config(&self, max_retries: u32, base_delay: Duration) {
    *self.retry.lock().unwrap_or_else(|p| p.into_inner()) = RetryPolicy {
      max_retries,
      base_delay,
    };
  }

  /// Issue a request.
  ///
  /// Offline requests are queued and fail immediately with
  /// [`GatewayError::Offline`]. Online requests are retried with exponential
  /// backoff. Successful GET responses are cached; a successful write drops
  /// the cached responses of its resource class.
  pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<Value, GatewayError> {
    validate(endpoint, &options)?;
    let mut request = QueuedRequest::new(endpoint, options, self.clock.now());

    if !self.connectivity.is_online() {
      let request_id = request.id.clone();
      info!(request_id, endpoint, "offline, queueing request");
      self.publish(
        names::REQUEST_QUEUED,
        json!({ "id": request_id, "endpoint": endpoint }),
      );
      self.queue.push(request);
      return Err(GatewayError::Offline { request_id });
    }

    self.execute_with_retry(&mut request).await
  }

  /// Cache-first read.
  pub async fn get(&self, endpoint: &str) -> Result<Value, GatewayError> {
    if let Some(cached) = self.cache.lookup(endpoint, self.clock.now()) {
      return Ok(cached);
    }
    self.request(endpoint, RequestOptions::get()).await
  }

  /// Cache-first read with URL-encoded query parameters.
  pub async fn get_with_query(
    &self,
    endpoint: &str,
    params: &[(&str, &str)],
  ) -> Result<Value, GatewayError> {
    self.get(&with_query(endpoint, params)).await
  }

  /// POST `body` to `endpoint` and invalidate its resource class.
  pub async fn create(&self, endpoint: &str, body: Value) -> Result<Value, GatewayError> {
    self.request(endpoint, RequestOptions::post(body)).await
  }

  /// PUT `body` to `endpoint` and invalidate its resource class.
  pub async fn update(&self, endpoint: &str, body: Value) -> Result<Value, GatewayError> {
    self.request(endpoint, RequestOptions::put(body)).await
  }

  /// DELETE `endpoint` and invalidate its resource class.
  pub async fn delete(&self, endpoint: &str) -> Result<Value, GatewayError> {
    self.request(endpoint, RequestOptions::delete()).await
  }

  /// Drop cached responses under `prefix`, or all of them.
  pub fn invalidate_cache(&self, prefix: Option<&str>) -> usize {
    self.cache.invalidate(prefix)
  }

  pub fn clear_cache(&self) {
    self.cache.clear();
  }

  /// Run every request concurrently. A failure only affects its own outcome.
  pub async fn batch(&self, requests: Vec<BatchRequest>) -> Vec<BatchOutcome> {
    let pending = requests.into_iter().map(|req| async move {
      let result = self.request(&req.endpoint, req.options).await;
      BatchOutcome {
        endpoint: req.endpoint,
        result,
      }
    });
    join_all(pending).await
  }

  /// Replay the offline queue in FIFO order.
  ///
  /// Each request gets one pass through the retry ladder. Requests that still
  /// fail are abandoned and reported; they are not re-queued. If connectivity
  /// drops mid-drain the remaining requests go back to the head of the queue.
  pub async fn drain_queue(&self) -> DrainReport {
    let Ok(_guard) = self.drain_lock.try_lock() else {
      debug!("queue drain already in progress");
      return DrainReport::default();
    };

    let mut report = DrainReport::default();
    let mut pending: VecDeque<QueuedRequest> = self.queue.take_all().into();
    if pending.is_empty() {
      return report;
    }
    info!(count = pending.len(), "replaying queued requests");

    while let Some(mut request) = pending.pop_front() {
      if !self.connectivity.is_online() {
        pending.push_front(request);
        report.deferred = pending.len();
        warn!(deferred = report.deferred, "connectivity lost while draining queue");
        self.queue.restore_front(pending.into());
        break;
      }

      match self.execute_with_retry(&mut request).await {
        Ok(_) => report.succeeded.push(request.id),
        Err(e) => {
          error!(
            request_id = %request.id,
            endpoint = %request.endpoint,
            error = %e,
            "abandoning queued request"
          );
          self.publish(
            names::REQUEST_ABANDONED,
            json!({
              "id": request.id,
              "endpoint": request.endpoint,
              "error": e.to_string(),
            }),
          );
          report.abandoned.push(AbandonedRequest {
            id: request.id,
            endpoint: request.endpoint,
            retry_count: request.retry_count,
            error: e.to_string(),
          });
        }
      }
    }

    self.publish(
      names::QUEUE_DRAINED,
      json!({
        "succeeded": report.succeeded.len(),
        "abandoned": report.abandoned.len(),
        "deferred": report.deferred,
      }),
    );
    report
  }

  /// Drain the queue every time connectivity comes back.
  pub fn spawn_reconnect_drain(self: &Arc<Self>) -> JoinHandle<()> {
    let gateway = Arc::clone(self);
    let mut rx = self.connectivity.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online {
          gateway.drain_queue().await;
        }
      }
    })
  }

  /// Single-attempt probe of the health endpoint.
  pub async fn health_check(&self) -> HealthReport {
    let timestamp = self.clock.now();
    if !self.connectivity.is_online() {
      return HealthReport {
        status: Health::Unhealthy,
        timestamp,
        response: None,
        error: Some("network offline".to_string()),
      };
    }

    let options = RequestOptions::get().with_timeout(Duration::from_secs(5));
    let request = QueuedRequest::new(&self.health_endpoint, options, timestamp);
    match self.execute_once(&request).await {
      Ok(response) => HealthReport {
        status: Health::Healthy,
        timestamp,
        response: Some(response),
        error: None,
      },
      Err(AttemptError::Retryable(cause)) => HealthReport {
        status: Health::Unhealthy,
        timestamp,
        response: None,
        error: Some(cause.to_string()),
      },
      Err(AttemptError::Fatal(e)) => HealthReport {
        status: Health::Unhealthy,
        timestamp,
        response: None,
        error: Some(e.to_string()),
      },
    }
  }

  pub fn status(&self) -> GatewayStatus {
    GatewayStatus {
      online: self.connectivity.is_online(),
      base_url: self.base_url.clone(),
      cache_size: self.cache.len(),
      queued_requests: self.queue.len(),
      retry_attempts: self.retry_policy().max_retries,
    }
  }

  /// Ids of queued requests, oldest first.
  pub fn queued_requests(&self) -> Vec<String> {
    self.queue.ids()
  }

  async fn execute_with_retry(&self, request: &mut QueuedRequest) -> Result<Value, GatewayError> {
    let policy = self.retry_policy();
    loop {
      let cause = match self.execute_once(request).await {
        Ok(body) => return Ok(body),
        Err(AttemptError::Fatal(e)) => return Err(e),
        Err(AttemptError::Retryable(cause)) => cause,
      };

      if request.retry_count >= policy.max_retries {
        warn!(
          request_id = %request.id,
          endpoint = %request.endpoint,
          attempts = request.retry_count + 1,
          cause = %cause,
          "retry budget exhausted"
        );
        return Err(GatewayError::Exhausted {
          endpoint: request.endpoint.clone(),
          attempts: request.retry_count + 1,
          cause,
        });
      }

      request.retry_count += 1;
      let delay = backoff_delay(policy.base_delay, request.retry_count);
      debug!(
        request_id = %request.id,
        retry = request.retry_count,
        delay_ms = delay.as_millis() as u64,
        cause = %cause,
        "retrying request"
      );
      tokio::time::sleep(delay).await;
    }
  }

  async fn execute_once(&self, request: &QueuedRequest) -> Result<Value, AttemptError> {
    let http = self.build_request(request);
    let started = Instant::now();

    let response = self
      .transport
      .execute(&http)
      .await
      .map_err(|e| AttemptError::Retryable(e.into()))?;

    debug!(
      request_id = %request.id,
      endpoint = %request.endpoint,
      status = response.status,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "api response"
    );

    if !response.is_success() {
      return Err(AttemptError::Retryable(FailureCause::Status {
        status: response.status,
      }));
    }

    let body = response.decode().map_err(|e| {
      AttemptError::Fatal(GatewayError::Decode {
        endpoint: request.endpoint.clone(),
        reason: e.to_string(),
      })
    })?;

    if request.options.method.is_mutating() {
      // Also reached when replaying the offline queue
      self.cache.invalidate(Some(resource_root(&request.endpoint)));
    } else {
      self
        .cache
        .store(&request.endpoint, body.clone(), self.clock.now());
    }

    Ok(body)
  }

  fn build_request(&self, request: &QueuedRequest) -> HttpRequest {
    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert("X-Request-ID".to_string(), request.id.clone());
    headers.insert(
      "X-CSRF-Token".to_string(),
      self.credentials.csrf_token().unwrap_or_default(),
    );
    if let Some(token) = self.credentials.bearer_token() {
      headers.insert("Authorization".to_string(), format!("Bearer {}", token));
    }
    headers.extend(request.options.headers.clone());

    HttpRequest {
      method: request.options.method,
      path: request.endpoint.clone(),
      headers,
      body: request.options.body.clone(),
      timeout: request.options.timeout,
    }
  }

  fn publish(&self, name: &str, payload: Value) {
    if let Some(bus) = &self.bus {
      bus.emit(name, &payload);
    }
  }
}

fn validate(endpoint: &str, options: &RequestOptions) -> Result<(), GatewayError> {
  if !endpoint.starts_with('/') {
    return Err(GatewayError::Validation(format!(
      "endpoint must start with '/': {:?}",
      endpoint
    )));
  }
  if endpoint.chars().any(char::is_whitespace) {
    return Err(GatewayError::Validation(format!(
      "endpoint contains whitespace: {:?}",
      endpoint
    )));
  }
  if options.method == Method::Get && options.body.is_some() {
    return Err(GatewayError::Validation(
      "GET requests cannot carry a body".to_string(),
    ));
  }
  Ok(())
}

/// First path segment of an endpoint: `/students/7/fees` → `/students`.
fn resource_root(endpoint: &str) -> &str {
  let path = endpoint.split(['?', '#']).next().unwrap_or(endpoint);
  match path[1..].find('/') {
    Some(idx) => &path[..idx + 1],
    None => path,
  }
}

fn with_query(endpoint: &str, params: &[(&str, &str)]) -> String {
  if params.is_empty() {
    return endpoint.to_string();
  }
  let query = url::form_urlencoded::Serializer::new(String::new())
    .extend_pairs(params)
    .finish();
  let separator = if endpoint.contains('?') { '&' } else { '?' };
  format!("{}{}{}", endpoint, separator, query)
}
