//! Cache policy router: serves every outbound fetch according to the first
//! matching policy.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::fetch::{FetchError, FetchRequest, NetworkFetcher};

use super::policy::{cache_key, CachePolicy, PolicyTable, Strategy};
use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult};

/// Placeholder served for documents when neither network nor cache can answer.
pub const DEFAULT_OFFLINE_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body>
<h1>You're offline</h1>
<p>This page hasn't been saved for offline use yet.
Your accounts and transactions will sync when you reconnect.</p>
</body>
</html>
"#;

/// Router between the application, the cache store and the network.
///
/// Storage failures never fail a request: a broken cache degrades to plain
/// network behavior.
pub struct CacheRouter<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn NetworkFetcher>,
  policies: Arc<PolicyTable>,
  offline_page: Arc<Vec<u8>>,
  clock: fn() -> DateTime<Utc>,
}

impl<S: CacheStorage> CacheRouter<S> {
  pub fn new(storage: Arc<S>, fetcher: Arc<dyn NetworkFetcher>, policies: PolicyTable) -> Self {
    Self {
      storage,
      fetcher,
      policies: Arc::new(policies),
      offline_page: Arc::new(DEFAULT_OFFLINE_PAGE.as_bytes().to_vec()),
      clock: Utc::now,
    }
  }

  /// Replace the built-in offline placeholder page.
  pub fn with_offline_page(mut self, page: Vec<u8>) -> Self {
    self.offline_page = Arc::new(page);
    self
  }

  /// Replace the wall clock used for entry ages and timestamps.
  pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
    self.clock = clock;
    self
  }

  pub fn policies(&self) -> &PolicyTable {
    &self.policies
  }

  /// Serve a request through its policy.
  pub async fn handle(
    &self,
    request: &FetchRequest,
  ) -> Result<CacheResult<Vec<u8>>, FetchError> {
    let Some(policy) = self.policies.route(request) else {
      debug!(method = %request.method, url = %request.url, "Not cacheable, passing through");
      return self
        .fetcher
        .fetch(request)
        .await
        .map(CacheResult::from_network);
    };

    let key = cache_key(request);
    match policy.strategy {
      Strategy::CacheFirst => self.cache_first(policy, &key, request).await,
      Strategy::NetworkFirst => self.network_first(policy, &key, request).await,
    }
  }

  /// 1. Serve a non-expired entry without touching the network
  /// 2. Otherwise fetch, store and return the fresh result
  /// 3. On network failure, fall back to the expired entry if there is one
  async fn cache_first(
    &self,
    policy: &CachePolicy,
    key: &str,
    request: &FetchRequest,
  ) -> Result<CacheResult<Vec<u8>>, FetchError> {
    let cached = self.lookup(policy, key);

    if let Some(entry) = &cached {
      if !entry.is_expired(policy.max_age, (self.clock)()) {
        return Ok(CacheResult::from_cache(entry.payload.clone(), entry.stored_at));
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(data) => {
        self.store(policy, key, &data);
        Ok(CacheResult::from_network(data))
      }
      Err(e) => match cached {
        Some(entry) => {
          debug!(
            policy = %policy.name,
            url = %request.url,
            "Refresh failed, serving expired entry: {}",
            e
          );
          Ok(CacheResult::fallback(entry.payload, entry.stored_at))
        }
        None => Err(e),
      },
    }
  }

  /// 1. Fetch within the policy timeout, store and return
  /// 2. On failure or timeout, serve the last cached entry
  /// 3. Documents with nothing cached get the offline page
  async fn network_first(
    &self,
    policy: &CachePolicy,
    key: &str,
    request: &FetchRequest,
  ) -> Result<CacheResult<Vec<u8>>, FetchError> {
    let fetched = match policy.network_timeout {
      Some(limit) => tokio::time::timeout(limit, self.fetcher.fetch(request))
        .await
        .unwrap_or(Err(FetchError::Timeout)),
      None => self.fetcher.fetch(request).await,
    };

    let error = match fetched {
      Ok(data) => {
        self.store(policy, key, &data);
        return Ok(CacheResult::from_network(data));
      }
      Err(e) => e,
    };

    if let Some(entry) = self.lookup(policy, key) {
      debug!(
        policy = %policy.name,
        url = %request.url,
        "Network failed, serving cached entry: {}",
        error
      );
      return Ok(CacheResult::fallback(entry.payload, entry.stored_at));
    }

    if request.is_document() {
      debug!(url = %request.url, "Network failed with nothing cached, serving offline page");
      return Ok(CacheResult::offline_page(self.offline_page.as_ref().clone()));
    }

    Err(error)
  }

  fn lookup(&self, policy: &CachePolicy, key: &str) -> Option<CacheEntry> {
    match self.storage.get_entry(&policy.name, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(policy = %policy.name, "Cache read failed, treating as miss: {}", e);
        None
      }
    }
  }

  fn store(&self, policy: &CachePolicy, key: &str, data: &[u8]) {
    let mut entry = CacheEntry::new(policy.name.clone(), key, data.to_vec());
    entry.stored_at = (self.clock)();
    if let Err(e) = self.storage.put_entry(&entry, policy.max_entries) {
      warn!(policy = %policy.name, "Failed to cache response: {}", e);
    }
  }
}

impl<S: CacheStorage> Clone for CacheRouter<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      policies: Arc::clone(&self.policies),
      offline_page: Arc::clone(&self.offline_page),
      clock: self.clock,
    }
  }
}
