//! HTTP transport: the only piece of the gateway that touches the network.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::error::TransportError;

/// HTTP method of a gateway request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Whether a request with this method may change server state.
  pub fn is_mutating(&self) -> bool {
    !matches!(self, Method::Get)
  }
}

/// Caller-supplied request descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
  #[serde(default)]
  pub method: Method,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  /// Extra headers; they override the gateway's defaults
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  /// Maximum wait for this request, overriding the transport default
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout: Option<Duration>,
}

impl RequestOptions {
  pub fn get() -> Self {
    Self::default()
  }

  pub fn post(body: Value) -> Self {
    Self {
      method: Method::Post,
      body: Some(body),
      ..Self::default()
    }
  }

  pub fn put(body: Value) -> Self {
    Self {
      method: Method::Put,
      body: Some(body),
      ..Self::default()
    }
  }

  pub fn delete() -> Self {
    Self {
      method: Method::Delete,
      ..Self::default()
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Fully-resolved request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: Method,
  /// Path relative to the transport's base URL, e.g. `/students?year=2`
  pub path: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
  pub timeout: Option<Duration>,
}

/// Raw response from a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: String,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  pub fn json(status: u16, body: &Value) -> Self {
    Self::new(status, body.to_string())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Decode the body as JSON; an empty body decodes to `null`.
  pub fn decode(&self) -> std::result::Result<Value, serde_json::Error> {
    if self.body.trim().is_empty() {
      Ok(Value::Null)
    } else {
      serde_json::from_str(&self.body)
    }
  }
}

/// Executes a single HTTP exchange. Implementations report any status code as
/// `Ok`; only failures that produced no response are errors.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: &HttpRequest)
    -> std::result::Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  base_url: String,
}

impl ReqwestTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    url::Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url_for(&self, path: &str) -> std::result::Result<url::Url, TransportError> {
    let joined = format!("{}{}", self.base_url, path);
    url::Url::parse(&joined).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", joined, e)))
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn execute(
    &self,
    request: &HttpRequest,
  ) -> std::result::Result<HttpResponse, TransportError> {
    let url = self.url_for(&request.path)?;
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| TransportError::Network(e.to_string()))?;

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }
    if let Some(timeout) = request.timeout {
      builder = builder.timeout(timeout);
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(map_reqwest_error)?;

    Ok(HttpResponse { status, body })
  }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Network(e.to_string())
  }
}
