//! Remote authoritative store.
//!
//! The remote store is always the source of truth. This module defines the
//! seam the sync core talks to (`RemoteStore`), the record shape it pulls,
//! and the write gateway that turns successful writes into `LocalWrite` triggers.

mod http;

pub use http::HttpRemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{TriggerCause, TriggerSender};

/// A single row of a remote resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  pub updated_at: Option<String>,
  pub data: Value,
}

impl Record {
  /// Build a record from a raw JSON row.
  ///
  /// The row must carry an `id` (string or number); `updated_at` is optional.
  pub fn from_row(row: Value) -> Option<Self> {
    let id = match row.get("id")? {
      Value::String(s) => s.clone(),
      Value::Number(n) => n.to_string(),
      _ => return None,
    };
    let updated_at = row
      .get("updated_at")
      .and_then(Value::as_str)
      .map(String::from);

    Some(Self {
      id,
      updated_at,
      data: row,
    })
  }
}

/// Kind of change announced on a push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// Change notification received from a push channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
  pub resource: String,
  pub kind: ChangeKind,
  pub record_id: Option<String>,
}

/// Stream of change notices for one resource. The channel closing means the
/// push channel disconnected.
pub type ChangeFeed = mpsc::Receiver<ChangeNotice>;

/// Failure talking to the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// Network error or server-side failure; retrying may succeed
  #[error("transient remote failure: {0}")]
  Transient(String),
  /// The remote refused the request (auth, validation); retrying will not help
  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },
}

impl RemoteError {
  pub fn is_transient(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }

  /// Classify an HTTP status code returned by the remote
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      408 | 425 | 429 | 500..=599 => {
        RemoteError::Transient(format!("HTTP {}: {}", status, message))
      }
      _ => RemoteError::Rejected { status, message },
    }
  }
}

/// Seam over the remote authoritative store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Read the full authoritative state of a resource for the owning identity.
  async fn list(&self, resource: &str) -> Result<Vec<Record>, RemoteError>;

  /// Write (upsert) a record, returning the stored representation.
  async fn write(&self, resource: &str, record: &Record) -> Result<Record, RemoteError>;

  /// Open a push channel for a resource.
  async fn subscribe(&self, resource: &str) -> Result<ChangeFeed, RemoteError>;
}

/// Write gateway: every successful write emits a `LocalWrite` trigger so the
/// coordinator pulls the authoritative result back.
#[derive(Clone)]
pub struct RemoteWriter {
  remote: Arc<dyn RemoteStore>,
  triggers: TriggerSender,
}

impl RemoteWriter {
  pub fn new(remote: Arc<dyn RemoteStore>, triggers: TriggerSender) -> Self {
    Self { remote, triggers }
  }

  pub async fn write(&self, resource: &str, record: &Record) -> Result<Record, RemoteError> {
    let saved = self.remote.write(resource, record).await?;
    self.triggers.emit(resource, TriggerCause::LocalWrite).await;
    Ok(saved)
  }
}
