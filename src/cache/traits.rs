//! Core types for the caching system.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A stored response, owned by the cache router.
///
/// Entries are immutable: a refresh stores a new entry that replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
  pub policy_name: String,
}

impl CacheEntry {
  pub fn new(policy_name: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
    Self {
      key: key.into(),
      payload,
      stored_at: Utc::now(),
      policy_name: policy_name.into(),
    }
  }

  /// Whether the entry is older than `max_age` at `now`.
  pub fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
    // A negative age (clock moved backwards) counts as fresh
    match (now - self.stored_at).to_std() {
      Ok(age) => age > max_age,
      Err(_) => false,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      stored_at: None,
    }
  }

  /// Create a new cache result from an entry that is still fresh.
  pub fn from_cache(data: T, stored_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      stored_at: Some(stored_at),
    }
  }

  /// Create a result for a cached entry served because the network failed.
  pub fn fallback(data: T, stored_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      stored_at: Some(stored_at),
    }
  }

  /// Create a result carrying the offline placeholder page.
  pub fn offline_page(data: T) -> Self {
    Self {
      data,
      source: CacheSource::OfflinePage,
      stored_at: None,
    }
  }
}

/// Indicates where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, within its policy's max age
  CacheFresh,
  /// Network failed or timed out, serving the last cached entry
  Fallback,
  /// Network and cache both failed for a document, serving the placeholder page
  OfflinePage,
}
