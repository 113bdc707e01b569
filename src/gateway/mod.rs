//! Network request gateway.
//!
//! Sits between the application and the backend API and provides:
//! - Exponential-backoff retries for transient failures
//! - A TTL cache for read responses, invalidated by mutations
//! - An offline queue, replayed in order when connectivity returns
//! - Concurrent batch submission with per-request outcomes

mod cache;
mod cached_client;
mod client;
mod connectivity;
mod credentials;
mod error;
mod queue;

pub use cache::{cache_key, CacheEntry, ResponseCache, TtlTable};
pub use cached_client::{
  backoff_delay, AbandonedRequest, BatchOutcome, BatchRequest, DrainReport, GatewayConfig,
  GatewayStatus, Health, HealthReport, RequestGateway, RetryPolicy,
};
pub use client::{HttpRequest, HttpResponse, Method, ReqwestTransport, RequestOptions, Transport};
pub use connectivity::{spawn_probe, Connectivity};
pub use credentials::{CredentialSource, EnvCredentials, StaticCredentials};
pub use error::{FailureCause, GatewayError, TransportError};
pub use queue::QueuedRequest;
