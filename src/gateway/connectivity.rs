//! Online/offline signal shared by the gateway and the sync manager.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::client::{HttpRequest, Method, Transport};

/// Connectivity flag with change notification. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns true if this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  /// Receiver that observes every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Periodically probe `endpoint` and flip `connectivity` accordingly.
///
/// Any HTTP response counts as online (the server is reachable); only a
/// transport failure marks the client offline.
pub fn spawn_probe(
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  endpoint: String,
  every: Duration,
  timeout: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let request = HttpRequest {
        method: Method::Get,
        path: endpoint.clone(),
        headers: Default::default(),
        body: None,
        timeout: Some(timeout),
      };
      let reachable = match transport.execute(&request).await {
        Ok(_) => true,
        Err(e) => {
          debug!(error = %e, "connectivity probe failed");
          false
        }
      };
      connectivity.set_online(reachable);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_online_reports_transitions_only() {
    let connectivity = Connectivity::new(true);
    assert!(!connectivity.set_online(true));
    assert!(connectivity.set_online(false));
    assert!(!connectivity.is_online());
    assert!(connectivity.set_online(true));
  }

  #[tokio::test]
  async fn test_subscribers_see_transition() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }
}
