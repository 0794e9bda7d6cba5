//! Cache storage trait and SQLite implementation.
//!
//! One store holds both the router's response entries and the per-resource
//! replica written by reconciliation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::remote::Record;

use super::traits::CacheEntry;

#[derive(Debug, Error)]
pub enum StorageError {
  /// Evicting the policy's own entries could not free enough space
  #[error("cache quota exceeded for policy {policy}: need {needed} bytes, quota is {quota}")]
  QuotaExceeded {
    policy: String,
    needed: u64,
    quota: u64,
  },
  #[error("cache backend error: {0}")]
  Backend(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}

impl From<serde_json::Error> for StorageError {
  fn from(e: serde_json::Error) -> Self {
    StorageError::Backend(format!("serialization: {}", e))
  }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Last successful reconciliation of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
  pub resource: String,
  pub synced_at: DateTime<Utc>,
  pub record_count: usize,
}

/// Trait for cache storage backends.
///
/// Every write is atomic with respect to readers: an entry is either the old
/// one or the new one, never half-written.
pub trait CacheStorage: Send + Sync {
  /// Get the entry stored under `key` in a policy's namespace.
  fn get_entry(&self, policy: &str, key: &str) -> StorageResult<Option<CacheEntry>>;

  /// Store an entry, replacing any entry with the same key, then evict the
  /// policy's oldest entries beyond `max_entries`. Returns the evicted count.
  fn put_entry(&self, entry: &CacheEntry, max_entries: usize) -> StorageResult<usize>;

  /// Number of entries in a policy's namespace.
  fn entry_count(&self, policy: &str) -> StorageResult<usize>;

  /// Keys of a policy's entries, oldest first.
  fn entry_keys(&self, policy: &str) -> StorageResult<Vec<String>>;

  /// Total bytes of cached payloads.
  fn usage_bytes(&self) -> StorageResult<u64>;

  /// Overwrite the local replica of a resource with the remote state.
  fn replace_records(
    &self,
    resource: &str,
    records: &[Record],
    synced_at: DateTime<Utc>,
  ) -> StorageResult<()>;

  /// Local replica of a resource, in remote order.
  fn records(&self, resource: &str) -> StorageResult<Vec<Record>>;

  /// When a resource was last reconciled.
  fn sync_state(&self, resource: &str) -> StorageResult<Option<SyncState>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Byte budget across all cached payloads
  quota: Option<u64>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::Backend(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Backend(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// In-memory database, nothing survives the process.
  pub fn open_in_memory() -> StorageResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StorageResult<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| StorageError::Backend(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
      quota: None,
    })
  }

  pub fn with_quota(mut self, quota: Option<u64>) -> Self {
    self.quota = quota;
    self
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Routed responses, namespaced per policy. seq is the insertion order.
CREATE TABLE IF NOT EXISTS cache_entries (
    policy TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (policy, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_seq
    ON cache_entries(policy, seq);

-- Local replica of remote resources
CREATE TABLE IF NOT EXISTS resource_records (
    resource TEXT NOT NULL,
    record_id TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT,
    position INTEGER NOT NULL,
    PRIMARY KEY (resource, record_id)
);

CREATE TABLE IF NOT EXISTS sync_state (
    resource TEXT PRIMARY KEY,
    synced_at TEXT NOT NULL,
    record_count INTEGER NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn get_entry(&self, policy: &str, key: &str) -> StorageResult<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT payload, stored_at FROM cache_entries WHERE policy = ?1 AND cache_key = ?2",
        params![policy, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((payload, stored_at)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        payload,
        stored_at: parse_datetime(&stored_at)?,
        policy_name: policy.to_string(),
      })),
      None => Ok(None),
    }
  }

  fn put_entry(&self, entry: &CacheEntry, max_entries: usize) -> StorageResult<usize> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let policy = entry.policy_name.as_str();
    let mut evicted = 0;

    if let Some(quota) = self.quota {
      let replaced: i64 = tx
        .query_row(
          "SELECT length(payload) FROM cache_entries WHERE policy = ?1 AND cache_key = ?2",
          params![policy, entry.key],
          |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
      let total: i64 = tx.query_row(
        "SELECT COALESCE(SUM(length(payload)), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      )?;

      let mut usage = (total - replaced).max(0) as u64;
      let needed = entry.payload.len() as u64;

      // Only the offending policy's entries are sacrificed
      while usage + needed > quota {
        let oldest: Option<(String, i64)> = tx
          .query_row(
            "SELECT cache_key, length(payload) FROM cache_entries
             WHERE policy = ?1 AND cache_key != ?2
             ORDER BY seq ASC LIMIT 1",
            params![policy, entry.key],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()?;

        let Some((key, len)) = oldest else {
          return Err(StorageError::QuotaExceeded {
            policy: policy.to_string(),
            needed,
            quota,
          });
        };

        tx.execute(
          "DELETE FROM cache_entries WHERE policy = ?1 AND cache_key = ?2",
          params![policy, key],
        )?;
        usage = usage.saturating_sub(len.max(0) as u64);
        evicted += 1;
      }
    }

    let seq: i64 = tx.query_row(
      "SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries",
      [],
      |row| row.get(0),
    )?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (policy, cache_key, payload, stored_at, seq)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![
        policy,
        entry.key,
        entry.payload,
        format_datetime(entry.stored_at),
        seq
      ],
    )?;

    evicted += tx.execute(
      "DELETE FROM cache_entries WHERE policy = ?1 AND seq NOT IN (
         SELECT seq FROM cache_entries WHERE policy = ?1 ORDER BY seq DESC LIMIT ?2
       )",
      params![policy, max_entries as i64],
    )?;

    tx.commit()?;

    if evicted > 0 {
      debug!(policy, evicted, "Evicted oldest cache entries");
    }
    Ok(evicted)
  }

  fn entry_count(&self, policy: &str) -> StorageResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE policy = ?1",
      params![policy],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  fn entry_keys(&self, policy: &str) -> StorageResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT cache_key FROM cache_entries WHERE policy = ?1 ORDER BY seq ASC")?;
    let keys = stmt
      .query_map(params![policy], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn usage_bytes(&self) -> StorageResult<u64> {
    let conn = self.lock()?;
    let total: i64 = conn.query_row(
      "SELECT COALESCE(SUM(length(payload)), 0) FROM cache_entries",
      [],
      |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
  }

  fn replace_records(
    &self,
    resource: &str,
    records: &[Record],
    synced_at: DateTime<Utc>,
  ) -> StorageResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    // Remote wins: rows missing remotely disappear locally
    tx.execute(
      "DELETE FROM resource_records WHERE resource = ?1",
      params![resource],
    )?;

    for (position, record) in records.iter().enumerate() {
      let data = serde_json::to_vec(&record.data)?;
      tx.execute(
        "INSERT OR REPLACE INTO resource_records (resource, record_id, data, updated_at, position)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![resource, record.id, data, record.updated_at, position as i64],
      )?;
    }

    tx.execute(
      "INSERT OR REPLACE INTO sync_state (resource, synced_at, record_count) VALUES (?1, ?2, ?3)",
      params![resource, format_datetime(synced_at), records.len() as i64],
    )?;

    tx.commit()?;
    Ok(())
  }

  fn records(&self, resource: &str) -> StorageResult<Vec<Record>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT record_id, data, updated_at FROM resource_records
       WHERE resource = ?1 ORDER BY position",
    )?;

    let rows = stmt
      .query_map(params![resource], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Vec<u8>>(1)?,
          row.get::<_, Option<String>>(2)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(id, data, updated_at)| -> StorageResult<Record> {
        Ok(Record {
          id,
          updated_at,
          data: serde_json::from_slice(&data)?,
        })
      })
      .collect()
  }

  fn sync_state(&self, resource: &str) -> StorageResult<Option<SyncState>> {
    let conn = self.lock()?;
    let row: Option<(String, i64)> = conn
      .query_row(
        "SELECT synced_at, record_count FROM sync_state WHERE resource = ?1",
        params![resource],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((synced_at, count)) => Ok(Some(SyncState {
        resource: resource.to_string(),
        synced_at: parse_datetime(&synced_at)?,
        record_count: count.max(0) as usize,
      })),
      None => Ok(None),
    }
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> StorageResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Backend(format!("Failed to parse datetime '{}': {}", s, e)))
}
