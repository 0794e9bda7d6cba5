//! Persistence grant: asks the host once per session for durable storage so
//! the cache survives eviction pressure.
//!
//! A denial only makes the cache less reliable; nothing else changes.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of the persistence request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatus {
  Unknown,
  Granted,
  Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceGrant {
  /// Whether `persist()` was called this session
  pub requested: bool,
  pub status: GrantStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
  pub usage: u64,
  pub quota: Option<u64>,
}

/// Host storage facilities
#[async_trait]
pub trait StoragePlatform: Send + Sync {
  async fn persisted(&self) -> Result<bool>;
  async fn persist(&self) -> Result<bool>;
  async fn estimate(&self) -> Result<StorageEstimate>;
}

/// Tracks the session's persistence grant and publishes it as a readable signal.
pub struct PersistenceGrantManager {
  tx: watch::Sender<PersistenceGrant>,
}

impl Default for PersistenceGrantManager {
  fn default() -> Self {
    Self::new()
  }
}

impl PersistenceGrantManager {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(PersistenceGrant {
      requested: false,
      status: GrantStatus::Unknown,
    });
    Self { tx }
  }

  pub fn grant(&self) -> PersistenceGrant {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<PersistenceGrant> {
    self.tx.subscribe()
  }

  /// Resolve the grant. Only the first call per session talks to the
  /// platform; later calls return the settled status.
  pub async fn activate(&self, platform: &dyn StoragePlatform) -> GrantStatus {
    let current = self.grant();
    if current.status != GrantStatus::Unknown {
      return current.status;
    }

    let grant = match platform.persisted().await {
      Ok(true) => PersistenceGrant {
        requested: false,
        status: GrantStatus::Granted,
      },
      Ok(false) => {
        let status = match platform.persist().await {
          Ok(true) => GrantStatus::Granted,
          Ok(false) => GrantStatus::Denied,
          Err(e) => {
            warn!("Persistence request failed: {}", e);
            GrantStatus::Denied
          }
        };
        PersistenceGrant {
          requested: true,
          status,
        }
      }
      Err(e) => {
        warn!("Could not query persistence state: {}", e);
        PersistenceGrant {
          requested: false,
          status: GrantStatus::Denied,
        }
      }
    };

    match grant.status {
      GrantStatus::Granted => info!("Durable storage granted"),
      _ => warn!("Durable storage denied, cached data may be evicted under pressure"),
    }
    self.tx.send_replace(grant);

    match platform.estimate().await {
      Ok(estimate) => debug!(usage = estimate.usage, quota = ?estimate.quota, "Storage estimate"),
      Err(e) => debug!("Storage estimate unavailable: {}", e),
    }

    grant.status
  }
}

/// Filesystem host: the grant is a marker file in the data directory.
pub struct FsStoragePlatform {
  dir: PathBuf,
  cache_path: PathBuf,
  quota: Option<u64>,
}

const PERSIST_MARKER: &str = ".persisted";

impl FsStoragePlatform {
  pub fn new(dir: PathBuf, cache_path: PathBuf, quota: Option<u64>) -> Self {
    Self {
      dir,
      cache_path,
      quota,
    }
  }
}

#[async_trait]
impl StoragePlatform for FsStoragePlatform {
  async fn persisted(&self) -> Result<bool> {
    Ok(tokio::fs::try_exists(self.dir.join(PERSIST_MARKER)).await?)
  }

  async fn persist(&self) -> Result<bool> {
    tokio::fs::create_dir_all(&self.dir)
      .await
      .map_err(|e| eyre!("Failed to create data directory {}: {}", self.dir.display(), e))?;
    tokio::fs::write(self.dir.join(PERSIST_MARKER), b"")
      .await
      .map_err(|e| eyre!("Failed to write persistence marker: {}", e))?;
    Ok(true)
  }

  async fn estimate(&self) -> Result<StorageEstimate> {
    let usage = match tokio::fs::metadata(&self.cache_path).await {
      Ok(meta) => meta.len(),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
      Err(e) => return Err(eyre!("Failed to stat {}: {}", self.cache_path.display(), e)),
    };
    Ok(StorageEstimate {
      usage,
      quota: self.quota,
    })
  }
}
