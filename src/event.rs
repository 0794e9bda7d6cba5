//! Sync triggers and the bounded channel that carries them to the coordinator.

use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resource name that fans out to every tracked resource.
pub const ALL_RESOURCES: &str = "*";

/// Why a reconciliation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerCause {
  /// Connectivity came back
  Reconnect,
  /// The remote store pushed a change notification
  RealtimePush,
  /// A write to the remote store succeeded locally
  LocalWrite,
  /// First reconciliation of a session
  AppStart,
}

impl fmt::Display for TriggerCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TriggerCause::Reconnect => write!(f, "reconnect"),
      TriggerCause::RealtimePush => write!(f, "realtime-push"),
      TriggerCause::LocalWrite => write!(f, "local-write"),
      TriggerCause::AppStart => write!(f, "app-start"),
    }
  }
}

/// A request to reconcile one resource (or all of them).
///
/// Triggers are ephemeral: the coordinator consumes them and never persists them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTrigger {
  pub resource: String,
  pub cause: TriggerCause,
  pub occurred_at: Instant,
}

impl SyncTrigger {
  pub fn new(resource: impl Into<String>, cause: TriggerCause) -> Self {
    Self {
      resource: resource.into(),
      cause,
      occurred_at: Instant::now(),
    }
  }

  /// Trigger that targets every tracked resource.
  pub fn all(cause: TriggerCause) -> Self {
    Self::new(ALL_RESOURCES, cause)
  }

  pub fn is_fan_out(&self) -> bool {
    self.resource == ALL_RESOURCES
  }
}

/// Sending half of the trigger channel. Cheap to clone; every trigger source holds one.
#[derive(Debug, Clone)]
pub struct TriggerSender {
  tx: mpsc::Sender<SyncTrigger>,
}

impl TriggerSender {
  /// Emit a trigger, waiting for channel capacity.
  ///
  /// Returns `false` once the coordinator has gone away.
  pub async fn emit(&self, resource: impl Into<String>, cause: TriggerCause) -> bool {
    self.send(SyncTrigger::new(resource, cause)).await
  }

  pub async fn send(&self, trigger: SyncTrigger) -> bool {
    debug!(resource = %trigger.resource, cause = %trigger.cause, "Emitting sync trigger");
    if self.tx.send(trigger).await.is_err() {
      warn!("Sync coordinator is gone, dropping trigger");
      return false;
    }
    true
  }
}

/// Receiving half, owned by the coordinator task loop
pub struct TriggerReceiver {
  rx: mpsc::Receiver<SyncTrigger>,
}

impl TriggerReceiver {
  /// Receive the next trigger. `None` once every sender is dropped.
  pub async fn next(&mut self) -> Option<SyncTrigger> {
    self.rx.recv().await
  }
}

/// Create a bounded trigger channel with the given capacity
pub fn trigger_channel(capacity: usize) -> (TriggerSender, TriggerReceiver) {
  let (tx, rx) = mpsc::channel(capacity.max(1));
  (TriggerSender { tx }, TriggerReceiver { rx })
}
