//! Credential sources for outgoing requests.

/// Supplies the bearer credential and anti-forgery token attached to requests.
pub trait CredentialSource: Send + Sync {
  fn bearer_token(&self) -> Option<String>;
  fn csrf_token(&self) -> Option<String>;
}

/// Fixed credentials, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
  pub bearer: Option<String>,
  pub csrf: Option<String>,
}

impl CredentialSource for StaticCredentials {
  fn bearer_token(&self) -> Option<String> {
    self.bearer.clone()
  }

  fn csrf_token(&self) -> Option<String> {
    self.csrf.clone()
  }
}

/// Reads credentials from the environment on every request, so a rotated
/// token is picked up without restarting.
///
/// Checks CAMPUS_SYNC_TOKEN for the bearer token and CAMPUS_SYNC_CSRF_TOKEN
/// for the anti-forgery token.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
  fn bearer_token(&self) -> Option<String> {
    non_empty_var("CAMPUS_SYNC_TOKEN")
  }

  fn csrf_token(&self) -> Option<String> {
    non_empty_var("CAMPUS_SYNC_CSRF_TOKEN")
  }
}

fn non_empty_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}
