use thiserror::Error;

/// Failure below HTTP: the request never produced a status code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("request timed out")]
  Timeout,
  #[error("network error: {0}")]
  Network(String),
  #[error("invalid url: {0}")]
  InvalidUrl(String),
}

/// Why the last attempt of a request failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailureCause {
  #[error("HTTP {status}")]
  Status { status: u16 },
  #[error(transparent)]
  Transport(#[from] TransportError),
}

/// Error surfaced by the request gateway.
///
/// Retryable conditions never escape as raw transport errors: they are retried
/// inside the gateway and reported as [`GatewayError::Exhausted`] once the retry
/// budget is spent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
  /// Connectivity is down; the request was queued and will be replayed on reconnect.
  #[error("network offline, request {request_id} queued for retry")]
  Offline { request_id: String },

  /// Every attempt failed with a retryable error.
  #[error("request to {endpoint} failed after {attempts} attempts: {cause}")]
  Exhausted {
    endpoint: String,
    attempts: u32,
    cause: FailureCause,
  },

  /// The caller supplied a malformed request.
  #[error("invalid request: {0}")]
  Validation(String),

  /// The server answered successfully but the body was not JSON.
  #[error("response from {endpoint} is not valid JSON: {reason}")]
  Decode { endpoint: String, reason: String },
}

impl GatewayError {
  /// True when the request was parked in the offline queue.
  pub fn is_queued(&self) -> bool {
    matches!(self, GatewayError::Offline { .. })
  }
}
