//! TTL cache for successful read responses.
//!
//! Entries are keyed by a normalized endpoint string and expire after a TTL
//! chosen per resource class. Expiry is lazy: nothing sweeps the cache, an
//! expired entry is dropped the next time someone looks it up.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Endpoint prefix → TTL table with a fallback for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlTable {
  rules: Vec<(String, Duration)>,
  fallback: Duration,
}

impl Default for TtlTable {
  fn default() -> Self {
    Self {
      rules: vec![
        ("/students".to_string(), Duration::minutes(5)),
        ("/assignments".to_string(), Duration::minutes(2)),
        ("/fees".to_string(), Duration::minutes(10)),
        ("/results".to_string(), Duration::minutes(15)),
        ("/announcements".to_string(), Duration::minutes(30)),
      ],
      fallback: Duration::minutes(5),
    }
  }
}

impl TtlTable {
  /// Table with no rules; every endpoint gets `fallback`.
  pub fn with_fallback(fallback: Duration) -> Self {
    Self {
      rules: Vec::new(),
      fallback,
    }
  }

  /// Add or replace the TTL for a resource prefix.
  pub fn set(&mut self, prefix: &str, ttl: Duration) {
    match self.rules.iter_mut().find(|(p, _)| p == prefix) {
      Some(rule) => rule.1 = ttl,
      None => self.rules.push((prefix.to_string(), ttl)),
    }
  }

  pub fn set_fallback(&mut self, fallback: Duration) {
    self.fallback = fallback;
  }

  /// TTL for `endpoint`. The query string is ignored and the longest prefix
  /// that ends on a path-segment boundary wins.
  pub fn ttl_for(&self, endpoint: &str) -> Duration {
    let path = strip_query(endpoint);
    self
      .rules
      .iter()
      .filter(|(prefix, _)| path_has_prefix(path, prefix))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, ttl)| *ttl)
      .unwrap_or(self.fallback)
  }
}

/// A cached response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub endpoint: String,
  pub payload: Value,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    now - self.stored_at < self.ttl
  }
}

/// In-memory response cache.
#[derive(Debug, Default)]
pub struct ResponseCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  ttl: TtlTable,
}

impl ResponseCache {
  pub fn new(ttl: TtlTable) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      ttl,
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self
      .entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Cache `payload` for `endpoint` as of `now`.
  pub fn store(&self, endpoint: &str, payload: Value, now: DateTime<Utc>) {
    let key = cache_key(endpoint);
    let entry = CacheEntry {
      key: key.clone(),
      endpoint: endpoint.to_string(),
      payload,
      stored_at: now,
      ttl: self.ttl.ttl_for(endpoint),
    };
    self.entries().insert(key, entry);
  }

  /// Return the cached payload for `endpoint` if it is still valid at `now`.
  /// An expired entry is evicted.
  pub fn lookup(&self, endpoint: &str, now: DateTime<Utc>) -> Option<Value> {
    let key = cache_key(endpoint);
    let mut entries = self.entries();
    let valid = entries.get(&key)?.is_valid(now);
    if valid {
      debug!(endpoint, "cache hit");
      entries.get(&key).map(|entry| entry.payload.clone())
    } else {
      debug!(endpoint, "cache entry expired");
      entries.remove(&key);
      None
    }
  }

  /// Drop entries whose endpoint starts with `prefix` (on a path-segment
  /// boundary), or everything when `prefix` is `None`. Returns how many went.
  pub fn invalidate(&self, prefix: Option<&str>) -> usize {
    let mut entries = self.entries();
    let before = entries.len();
    match prefix {
      Some(prefix) => entries.retain(|_, entry| !path_has_prefix(&entry.endpoint, prefix)),
      None => entries.clear(),
    }
    let removed = before - entries.len();
    if removed > 0 {
      debug!(prefix = prefix.unwrap_or("*"), removed, "cache invalidated");
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries().is_empty()
  }

  pub fn clear(&self) {
    self.entries().clear();
  }
}

/// Normalized cache key: the path without a trailing `/`, then the query
/// parameters in sorted order. Fragments are dropped.
pub fn cache_key(endpoint: &str) -> String {
  let endpoint = endpoint.split('#').next().unwrap_or(endpoint);
  let (path, query) = endpoint.split_once('?').unwrap_or((endpoint, ""));
  let path = match path.trim_end_matches('/') {
    "" => "/",
    trimmed => trimmed,
  };

  let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
  if params.is_empty() {
    return path.to_string();
  }
  params.sort_unstable();
  format!("{}?{}", path, params.join("&"))
}

fn strip_query(endpoint: &str) -> &str {
  endpoint.split(['?', '#']).next().unwrap_or(endpoint)
}

fn path_has_prefix(endpoint: &str, prefix: &str) -> bool {
  let prefix = prefix.trim_end_matches('/');
  if prefix.is_empty() {
    return true;
  }
  match endpoint.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
  }

  #[test]
  fn test_ttl_table_defaults() {
    let table = TtlTable::default();
    assert_eq!(table.ttl_for("/students"), Duration::minutes(5));
    assert_eq!(table.ttl_for("/assignments?due=today"), Duration::minutes(2));
    assert_eq!(table.ttl_for("/fees"), Duration::minutes(10));
    assert_eq!(table.ttl_for("/results/42"), Duration::minutes(15));
    assert_eq!(table.ttl_for("/announcements"), Duration::minutes(30));
    assert_eq!(table.ttl_for("/timetable"), Duration::minutes(5));
    // Not a segment boundary
    assert_eq!(table.ttl_for("/feesheet"), Duration::minutes(5));
  }

  #[test]
  fn test_ttl_table_longest_prefix_wins() {
    let mut table = TtlTable::with_fallback(Duration::seconds(30));
    table.set("/students", Duration::minutes(5));
    table.set("/students/archive", Duration::hours(1));

    assert_eq!(table.ttl_for("/students/7"), Duration::minutes(5));
    assert_eq!(table.ttl_for("/students/archive/2019"), Duration::hours(1));
    assert_eq!(table.ttl_for("/other"), Duration::seconds(30));

    table.set("/students", Duration::minutes(1));
    assert_eq!(table.ttl_for("/students"), Duration::minutes(1));
  }

  #[test]
  fn test_validity_boundary() {
    let entry = CacheEntry {
      key: "/fees".to_string(),
      endpoint: "/fees".to_string(),
      payload: Value::Null,
      stored_at: epoch(),
      ttl: Duration::milliseconds(1000),
    };
    assert!(entry.is_valid(epoch()));
    assert!(entry.is_valid(epoch() + Duration::milliseconds(999)));
    assert!(!entry.is_valid(epoch() + Duration::milliseconds(1000)));
  }

  #[test]
  fn test_fees_lookup_before_and_after_expiry() {
    let cache = ResponseCache::new(TtlTable::default());
    let payload = json!([{ "id": "f1", "amount": 1200 }]);
    cache.store("/fees", payload.clone(), epoch());

    let at_500s = epoch() + Duration::milliseconds(500_000);
    assert_eq!(cache.lookup("/fees", at_500s), Some(payload));
    assert_eq!(cache.len(), 1);

    let at_700s = epoch() + Duration::milliseconds(700_000);
    assert_eq!(cache.lookup("/fees", at_700s), None);
    assert!(cache.is_empty(), "expired entry should be evicted on lookup");
  }

  #[test]
  fn test_invalidate_by_prefix() {
    let cache = ResponseCache::new(TtlTable::default());
    cache.store("/students", json!([]), epoch());
    cache.store("/students/7", json!({}), epoch());
    cache.store("/students?year=2", json!([]), epoch());
    cache.store("/studentsarchive", json!([]), epoch());
    cache.store("/fees", json!([]), epoch());

    assert_eq!(cache.invalidate(Some("/students")), 3);
    assert_eq!(cache.lookup("/studentsarchive", epoch()), Some(json!([])));
    assert_eq!(cache.lookup("/fees", epoch()), Some(json!([])));

    assert_eq!(cache.invalidate(None), 2);
    assert!(cache.is_empty());
  }

  #[test]
  fn test_cache_key_normalization() {
    assert_eq!(cache_key("/students/"), "/students");
    assert_eq!(cache_key("/students?year=2&a=1#top"), "/students?a=1&year=2");
    assert_eq!(cache_key("/"), "/");
    assert_ne!(cache_key("/students/7"), cache_key("/students_7"));
    assert_ne!(cache_key("/students/7"), cache_key("/students?7"));
  }

  #[test]
  fn test_distinct_endpoints_do_not_share_entries() {
    let cache = ResponseCache::new(TtlTable::default());
    cache.store("/students/7", json!({ "who": "student 7" }), epoch());

    assert_eq!(cache.lookup("/students_7", epoch()), None);
    assert_eq!(cache.lookup("/students?7", epoch()), None);
    assert_eq!(
      cache.lookup("/students/7/", epoch()),
      Some(json!({ "who": "student 7" }))
    );

    cache.store("/results?term=1&year=2", json!([1]), epoch());
    assert_eq!(cache.lookup("/results?year=2&term=1", epoch()), Some(json!([1])));
  }
}
