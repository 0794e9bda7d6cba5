//! Background sync: per-resource reconciliation jobs driven by triggers.

mod coordinator;
mod job;

pub use coordinator::{trigger_app_start, SyncCoordinator, SyncEvent, SyncSettings};
pub use job::{Backoff, Debounce, JobState, ReconciliationJob};

use thiserror::Error;

use crate::cache::StorageError;
use crate::remote::RemoteError;

/// Why a reconciliation attempt failed
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Remote(#[from] RemoteError),
  #[error("failed to write local replica: {0}")]
  Storage(#[from] StorageError),
}

impl SyncError {
  /// Storage failures are retried like network failures; only an explicit
  /// rejection from the remote stops the job.
  pub fn is_transient(&self) -> bool {
    match self {
      SyncError::Remote(e) => e.is_transient(),
      SyncError::Storage(_) => true,
    }
  }
}
