//! Realtime subscription manager.
//!
//! Owns one push channel per tracked resource for the lifetime of a session.
//! Change notices only signal the coordinator; the cache is never touched here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{TriggerCause, TriggerSender};
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
  Connecting,
  Active,
  Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
  pub resource: String,
  pub channel_id: u64,
  pub status: SubscriptionStatus,
}

struct Slot {
  handle: SubscriptionHandle,
  /// False once unsubscribed explicitly; only wanted channels are resubscribed
  wanted: bool,
  task: Option<JoinHandle<()>>,
}

struct Inner {
  remote: Arc<dyn RemoteStore>,
  triggers: TriggerSender,
  slots: Mutex<HashMap<String, Slot>>,
  next_channel: AtomicU64,
  torn_down: CancellationToken,
}

impl Inner {
  fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    // Slot updates never panic midway, so a poisoned map is still consistent
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Move a channel to `status` if it is still the resource's current,
  /// open channel. Returns whether the update applied.
  fn set_status(&self, resource: &str, channel_id: u64, status: SubscriptionStatus) -> bool {
    let mut slots = self.slots();
    match slots.get_mut(resource) {
      Some(slot)
        if slot.handle.channel_id == channel_id
          && slot.handle.status != SubscriptionStatus::Closed =>
      {
        slot.handle.status = status;
        true
      }
      _ => false,
    }
  }
}

/// Per-session owner of realtime subscriptions. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionManager {
  inner: Arc<Inner>,
}

impl SubscriptionManager {
  pub fn new(remote: Arc<dyn RemoteStore>, triggers: TriggerSender) -> Self {
    Self {
      inner: Arc::new(Inner {
        remote,
        triggers,
        slots: Mutex::new(HashMap::new()),
        next_channel: AtomicU64::new(1),
        torn_down: CancellationToken::new(),
      }),
    }
  }

  /// Open one subscription per tracked resource.
  pub fn start_session(&self, resources: &[String]) {
    for resource in resources {
      self.subscribe(resource);
    }
  }

  /// Open a push channel for `resource`. No-op while one is connecting or active.
  pub fn subscribe(&self, resource: &str) {
    if self.inner.torn_down.is_cancelled() {
      return;
    }

    let mut slots = self.inner.slots();
    if let Some(slot) = slots.get(resource) {
      if slot.handle.status != SubscriptionStatus::Closed {
        return;
      }
    }

    let channel_id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
    debug!(resource, channel_id, "Opening push channel");
    let task = tokio::spawn(run_channel(
      Arc::clone(&self.inner),
      resource.to_string(),
      channel_id,
    ));

    slots.insert(
      resource.to_string(),
      Slot {
        handle: SubscriptionHandle {
          resource: resource.to_string(),
          channel_id,
          status: SubscriptionStatus::Connecting,
        },
        wanted: true,
        task: Some(task),
      },
    );
  }

  /// Close the channel for `resource`. Safe to call repeatedly.
  pub fn unsubscribe(&self, resource: &str) {
    let mut slots = self.inner.slots();
    if let Some(slot) = slots.get_mut(resource) {
      close_slot(slot);
      debug!(resource, "Unsubscribed");
    }
  }

  /// Close every channel; nothing reopens after this.
  pub fn teardown(&self) {
    self.inner.torn_down.cancel();
    let mut slots = self.inner.slots();
    for slot in slots.values_mut() {
      close_slot(slot);
    }
    info!(channels = slots.len(), "Realtime subscriptions torn down");
  }

  /// Reopen every wanted channel that has closed.
  pub fn resubscribe_closed(&self) {
    let closed: Vec<String> = self
      .inner
      .slots()
      .values()
      .filter(|s| s.wanted && s.handle.status == SubscriptionStatus::Closed)
      .map(|s| s.handle.resource.clone())
      .collect();

    for resource in closed {
      info!(resource = %resource, "Resubscribing");
      self.subscribe(&resource);
    }
  }

  /// Resubscribe closed channels on every reconnect, and whenever
  /// connectivity is confirmed while already online, until teardown.
  pub async fn run_reconnects(
    self,
    mut reconnects: watch::Receiver<u64>,
    mut confirmations: watch::Receiver<u64>,
  ) {
    loop {
      let changed = tokio::select! {
        _ = self.inner.torn_down.cancelled() => break,
        changed = reconnects.changed() => changed,
        changed = confirmations.changed() => changed,
      };
      if changed.is_err() {
        break;
      }
      self.resubscribe_closed();
    }
  }

  pub fn status(&self, resource: &str) -> Option<SubscriptionStatus> {
    self.inner.slots().get(resource).map(|s| s.handle.status)
  }

  pub fn handles(&self) -> Vec<SubscriptionHandle> {
    let mut handles: Vec<_> = self
      .inner
      .slots()
      .values()
      .map(|s| s.handle.clone())
      .collect();
    handles.sort_by(|a, b| a.resource.cmp(&b.resource));
    handles
  }
}

fn close_slot(slot: &mut Slot) {
  slot.wanted = false;
  slot.handle.status = SubscriptionStatus::Closed;
  if let Some(task) = slot.task.take() {
    task.abort();
  }
}

async fn run_channel(inner: Arc<Inner>, resource: String, channel_id: u64) {
  let mut feed = match inner.remote.subscribe(&resource).await {
    Ok(feed) => feed,
    Err(e) => {
      warn!(resource = %resource, "Subscription failed, retrying on reconnect: {}", e);
      inner.set_status(&resource, channel_id, SubscriptionStatus::Closed);
      return;
    }
  };

  if !inner.set_status(&resource, channel_id, SubscriptionStatus::Active) {
    return;
  }
  info!(resource = %resource, channel_id, "Push channel active");

  while let Some(notice) = feed.recv().await {
    debug!(resource = %resource, kind = ?notice.kind, record = ?notice.record_id, "Remote change");
    if !inner
      .triggers
      .emit(resource.clone(), TriggerCause::RealtimePush)
      .await
    {
      break;
    }
  }

  if inner.set_status(&resource, channel_id, SubscriptionStatus::Closed) {
    warn!(resource = %resource, "Push channel disconnected");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::{trigger_channel, TriggerReceiver};
  use crate::remote::testing::FakeRemote;
  use crate::remote::ChangeKind;
  use std::time::Duration;

  fn setup() -> (SubscriptionManager, Arc<FakeRemote>, TriggerReceiver) {
    let remote = Arc::new(FakeRemote::default());
    let (tx, rx) = trigger_channel(16);
    (SubscriptionManager::new(remote.clone(), tx), remote, rx)
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
  }

  fn resources() -> Vec<String> {
    vec!["accounts".into(), "budgets".into()]
  }

  #[tokio::test]
  async fn test_session_opens_one_channel_per_resource() {
    let (manager, remote, _rx) = setup();

    manager.start_session(&resources());
    manager.subscribe("accounts");
    settle().await;

    assert_eq!(remote.subscribe_calls("accounts"), 1);
    assert_eq!(remote.subscribe_calls("budgets"), 1);
    assert_eq!(manager.status("accounts"), Some(SubscriptionStatus::Active));
    assert_eq!(manager.handles().len(), 2);
  }

  #[tokio::test]
  async fn test_push_emits_realtime_trigger() {
    let (manager, remote, mut rx) = setup();
    manager.subscribe("accounts");
    settle().await;

    remote.push("accounts", ChangeKind::Update).await;

    let trigger = rx.next().await.unwrap();
    assert_eq!(trigger.resource, "accounts");
    assert_eq!(trigger.cause, TriggerCause::RealtimePush);
  }

  #[tokio::test]
  async fn test_unsubscribe_is_repeatable() {
    let (manager, _remote, _rx) = setup();
    manager.subscribe("budgets");
    settle().await;

    manager.unsubscribe("budgets");
    manager.unsubscribe("budgets");
    manager.unsubscribe("never-subscribed");

    assert_eq!(manager.status("budgets"), Some(SubscriptionStatus::Closed));
  }

  #[tokio::test]
  async fn test_disconnect_resubscribes_on_reconnect() {
    let (manager, remote, _rx) = setup();
    let (reconnect_tx, reconnect_rx) = watch::channel(0u64);
    let (_confirm_tx, confirm_rx) = watch::channel(0u64);
    tokio::spawn(manager.clone().run_reconnects(reconnect_rx, confirm_rx));

    manager.subscribe("accounts");
    settle().await;
    remote.disconnect("accounts");
    settle().await;
    assert_eq!(manager.status("accounts"), Some(SubscriptionStatus::Closed));

    reconnect_tx.send_modify(|n| *n += 1);
    settle().await;

    assert_eq!(remote.subscribe_calls("accounts"), 2);
    assert_eq!(manager.status("accounts"), Some(SubscriptionStatus::Active));
  }

  #[tokio::test]
  async fn test_server_close_resubscribes_on_confirmed_connectivity() {
    let (manager, remote, _rx) = setup();
    let (_reconnect_tx, reconnect_rx) = watch::channel(0u64);
    let (confirm_tx, confirm_rx) = watch::channel(0u64);
    tokio::spawn(manager.clone().run_reconnects(reconnect_rx, confirm_rx));

    manager.subscribe("budgets");
    settle().await;
    remote.disconnect("budgets");
    settle().await;
    assert_eq!(manager.status("budgets"), Some(SubscriptionStatus::Closed));

    confirm_tx.send_modify(|n| *n += 1);
    settle().await;

    assert_eq!(remote.subscribe_calls("budgets"), 2);
    assert_eq!(manager.status("budgets"), Some(SubscriptionStatus::Active));
  }

  #[tokio::test]
  async fn test_failed_subscribe_waits_for_reconnect() {
    let (manager, remote, _rx) = setup();
    remote.fail_next_subscribes(1);

    manager.subscribe("transactions");
    settle().await;
    assert_eq!(manager.status("transactions"), Some(SubscriptionStatus::Closed));
    assert_eq!(remote.subscribe_calls("transactions"), 1);

    manager.resubscribe_closed();
    settle().await;
    assert_eq!(manager.status("transactions"), Some(SubscriptionStatus::Active));
  }

  #[tokio::test]
  async fn test_unsubscribed_channel_is_not_resubscribed() {
    let (manager, remote, _rx) = setup();
    manager.subscribe("budgets");
    settle().await;

    manager.unsubscribe("budgets");
    manager.resubscribe_closed();
    settle().await;

    assert_eq!(remote.subscribe_calls("budgets"), 1);
  }

  #[tokio::test]
  async fn test_teardown_closes_everything() {
    let (manager, remote, _rx) = setup();
    manager.start_session(&resources());
    settle().await;

    manager.teardown();
    manager.subscribe("accounts");
    manager.resubscribe_closed();
    settle().await;

    assert!(manager
      .handles()
      .iter()
      .all(|h| h.status == SubscriptionStatus::Closed));
    assert_eq!(remote.subscribe_calls("accounts"), 1);
  }
}
