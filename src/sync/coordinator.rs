//! Background sync coordinator.
//!
//! A single task owns every job and consumes triggers from one channel, so job
//! state needs no lock. Pulls run as separate tasks and report back through a
//! completion channel; at most one pull per resource is outstanding.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStorage;
use crate::config::SyncConfig;
use crate::event::{SyncTrigger, TriggerCause, TriggerReceiver, TriggerSender, ALL_RESOURCES};
use crate::network::ConnectivityState;
use crate::remote::RemoteStore;

use super::job::{Backoff, Debounce, JobState, ReconciliationJob};
use super::SyncError;

/// Notifications for UI collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// The local replica of a resource was overwritten; readers should re-fetch
  Invalidated { resource: String },
  /// The remote refused a pull; surfaced once, not retried
  Rejected { resource: String, message: String },
  /// A pull failed transiently and will be retried after `delay`
  Backoff {
    resource: String,
    attempt: u32,
    delay: Duration,
  },
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
  pub debounce: Debounce,
  pub backoff: Backoff,
}

impl From<&SyncConfig> for SyncSettings {
  fn from(config: &SyncConfig) -> Self {
    Self {
      debounce: Debounce {
        window: config.debounce(),
        max_wait: config.max_wait(),
      },
      backoff: Backoff {
        initial: Duration::from_millis(config.backoff_initial_ms),
        max: Duration::from_millis(config.backoff_max_ms),
      },
    }
  }
}

struct PullOutcome {
  resource: String,
  result: Result<usize, SyncError>,
}

enum Step {
  Trigger(SyncTrigger),
  Completed(PullOutcome),
  Tick,
  Shutdown,
}

pub struct SyncCoordinator<S: CacheStorage + 'static> {
  resources: Vec<String>,
  jobs: HashMap<String, ReconciliationJob>,
  remote: Arc<dyn RemoteStore>,
  storage: Arc<S>,
  settings: SyncSettings,
  events: broadcast::Sender<SyncEvent>,
  states: watch::Sender<HashMap<String, JobState>>,
  shutdown: CancellationToken,
  completions: mpsc::UnboundedSender<PullOutcome>,
  completions_rx: Option<mpsc::UnboundedReceiver<PullOutcome>>,
}

impl<S: CacheStorage + 'static> SyncCoordinator<S> {
  pub fn new(
    resources: Vec<String>,
    remote: Arc<dyn RemoteStore>,
    storage: Arc<S>,
    settings: SyncSettings,
    shutdown: CancellationToken,
  ) -> Self {
    let jobs: HashMap<_, _> = resources
      .iter()
      .map(|r| (r.clone(), ReconciliationJob::new(r.clone())))
      .collect();
    let (events, _) = broadcast::channel(64);
    let (states, _) = watch::channel(
      jobs
        .keys()
        .map(|r| (r.clone(), JobState::Idle))
        .collect(),
    );
    let (completions, completions_rx) = mpsc::unbounded_channel();

    Self {
      resources,
      jobs,
      remote,
      storage,
      settings,
      events,
      states,
      shutdown,
      completions,
      completions_rx: Some(completions_rx),
    }
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// Event sender, for handing out receivers after the coordinator is spawned
  pub fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
    self.events.clone()
  }

  pub fn job_states(&self) -> watch::Receiver<HashMap<String, JobState>> {
    self.states.subscribe()
  }

  /// Run the reconciliation loop until shutdown or until every trigger sender is gone.
  pub async fn run(mut self, mut triggers: TriggerReceiver) {
    let Some(mut completions) = self.completions_rx.take() else {
      return;
    };
    let shutdown = self.shutdown.clone();
    info!(resources = self.resources.len(), "Sync coordinator started");

    loop {
      self.advance(Instant::now());
      self.publish_states();

      let next = self.next_due();
      let deadline = next.unwrap_or_else(Instant::now);

      let step = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Step::Shutdown,
        Some(outcome) = completions.recv() => Step::Completed(outcome),
        trigger = triggers.next() => match trigger {
          Some(t) => Step::Trigger(t),
          None => Step::Shutdown,
        },
        _ = sleep_until(deadline), if next.is_some() => Step::Tick,
      };

      match step {
        Step::Trigger(trigger) => self.on_trigger(trigger),
        Step::Completed(outcome) => self.on_outcome(outcome),
        Step::Tick => {}
        Step::Shutdown => break,
      }
    }

    info!("Sync coordinator stopped");
  }

  fn on_trigger(&mut self, trigger: SyncTrigger) {
    let targets = if trigger.is_fan_out() {
      self.resources.clone()
    } else if self.jobs.contains_key(&trigger.resource) {
      vec![trigger.resource.clone()]
    } else {
      warn!(resource = %trigger.resource, "Trigger for untracked resource ignored");
      return;
    };

    let now = Instant::now();
    for resource in targets {
      if let Some(job) = self.jobs.get_mut(&resource) {
        if job.on_trigger(&trigger, now, &self.settings.debounce) {
          debug!(resource = %resource, cause = %trigger.cause, "Reconciliation scheduled");
        } else {
          debug!(
            resource = %resource,
            cause = %trigger.cause,
            state = ?job.state,
            "Trigger coalesced"
          );
        }
      }
    }
  }

  fn on_outcome(&mut self, outcome: PullOutcome) {
    let now = Instant::now();
    let Some(job) = self.jobs.get_mut(&outcome.resource) else {
      return;
    };
    let resource = outcome.resource;

    match outcome.result {
      Ok(count) => {
        job.on_success(now);
        info!(resource = %resource, records = count, "Reconciled");
        let _ = self.events.send(SyncEvent::Invalidated { resource });
      }
      Err(e) if e.is_transient() => {
        let delay = job.on_transient_failure(now, &self.settings.backoff);
        warn!(
          resource = %resource,
          attempt = job.attempt,
          delay_ms = delay.as_millis() as u64,
          "Reconciliation failed, backing off: {}", e
        );
        let _ = self.events.send(SyncEvent::Backoff {
          resource,
          attempt: job.attempt,
          delay,
        });
      }
      Err(e) => {
        job.on_rejected();
        error!(resource = %resource, "Reconciliation rejected by remote: {}", e);
        let _ = self.events.send(SyncEvent::Rejected {
          resource,
          message: e.to_string(),
        });
      }
    }
  }

  /// Wake elapsed backoffs and start every due pull.
  fn advance(&mut self, now: Instant) {
    let mut due = Vec::new();
    for job in self.jobs.values_mut() {
      job.wake(now);
      if job.start(now) {
        due.push(job.resource.clone());
      }
    }
    for resource in due {
      self.spawn_pull(resource);
    }
  }

  fn next_due(&self) -> Option<Instant> {
    self.jobs.values().filter_map(ReconciliationJob::next_due).min()
  }

  fn publish_states(&self) {
    let states = self
      .jobs
      .iter()
      .map(|(r, j)| (r.clone(), j.state))
      .collect();
    self.states.send_replace(states);
  }

  fn spawn_pull(&self, resource: String) {
    let remote = Arc::clone(&self.remote);
    let storage = Arc::clone(&self.storage);
    let done = self.completions.clone();
    let shutdown = self.shutdown.clone();

    debug!(resource = %resource, "Pulling remote state");
    tokio::spawn(async move {
      let result = match remote.list(&resource).await {
        Ok(records) => {
          // In-flight pulls are not aborted, but a finished session keeps its hands off the cache
          if shutdown.is_cancelled() {
            debug!(resource = %resource, "Session ended during pull, result discarded");
            return;
          }
          storage
            .replace_records(&resource, &records, Utc::now())
            .map(|_| records.len())
            .map_err(SyncError::from)
        }
        Err(e) => Err(SyncError::from(e)),
      };
      let _ = done.send(PullOutcome { resource, result });
    });
  }
}

/// Emit the session's full reconciliation once connectivity is confirmed.
pub async fn trigger_app_start(
  triggers: TriggerSender,
  mut connectivity: watch::Receiver<ConnectivityState>,
  shutdown: CancellationToken,
) {
  tokio::select! {
    _ = shutdown.cancelled() => {}
    online = async { connectivity.wait_for(|s| s.online).await.is_ok() } => {
      if online {
        triggers.emit(ALL_RESOURCES, TriggerCause::AppStart).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::event::trigger_channel;
  use crate::remote::testing::{record, FakeRemote};
  use crate::remote::RemoteError;

  struct Harness {
    triggers: TriggerSender,
    remote: Arc<FakeRemote>,
    storage: Arc<SqliteStorage>,
    events: broadcast::Receiver<SyncEvent>,
    states: watch::Receiver<HashMap<String, JobState>>,
    shutdown: CancellationToken,
  }

  impl Harness {
    async fn send(&self, resource: &str, cause: TriggerCause) {
      self.triggers.send(SyncTrigger::new(resource, cause)).await;
    }

    fn state(&self, resource: &str) -> JobState {
      self.states.borrow()[resource]
    }

    fn drain_events(&mut self) -> Vec<SyncEvent> {
      let mut events = Vec::new();
      while let Ok(event) = self.events.try_recv() {
        events.push(event);
      }
      events
    }
  }

  fn start(remote: FakeRemote, resources: &[&str]) -> Harness {
    let remote = Arc::new(remote);
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let shutdown = CancellationToken::new();
    let settings = SyncSettings {
      debounce: Debounce {
        window: Duration::from_millis(500),
        max_wait: Duration::from_secs(2),
      },
      backoff: Backoff {
        initial: Duration::from_millis(100),
        max: Duration::from_millis(250),
      },
    };
    let coordinator = SyncCoordinator::new(
      resources.iter().map(|r| r.to_string()).collect(),
      remote.clone(),
      storage.clone(),
      settings,
      shutdown.clone(),
    );
    let events = coordinator.subscribe_events();
    let states = coordinator.job_states();
    let (triggers, rx) = trigger_channel(16);
    tokio::spawn(coordinator.run(rx));

    Harness {
      triggers,
      remote,
      storage,
      events,
      states,
      shutdown,
    }
  }

  async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_fan_out_pulls_every_resource_into_cache() {
    let mut h = start(FakeRemote::default(), &["accounts", "budgets"]);
    h.remote.set_rows("accounts", vec![record("a1", 100), record("a2", 5)]);

    h.send(ALL_RESOURCES, TriggerCause::Reconnect).await;
    sleep_ms(10).await;

    assert_eq!(h.remote.list_calls("accounts"), 1);
    assert_eq!(h.remote.list_calls("budgets"), 1);
    assert_eq!(h.storage.records("accounts").unwrap().len(), 2);
    assert_eq!(h.state("accounts"), JobState::Idle);

    let mut invalidated: Vec<_> = h
      .drain_events()
      .into_iter()
      .filter_map(|e| match e {
        SyncEvent::Invalidated { resource } => Some(resource),
        _ => None,
      })
      .collect();
    invalidated.sort();
    assert_eq!(invalidated, vec!["accounts", "budgets"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_triggers_while_in_flight_coalesce_into_one_pull() {
    let h = start(FakeRemote::with_list_delay(Duration::from_millis(100)), &["accounts"]);

    h.send("accounts", TriggerCause::Reconnect).await;
    sleep_ms(10).await;
    assert_eq!(h.state("accounts"), JobState::InFlight);

    for _ in 0..3 {
      h.send("accounts", TriggerCause::RealtimePush).await;
      sleep_ms(5).await;
    }
    sleep_ms(500).await;

    assert_eq!(h.remote.list_calls("accounts"), 2);
    assert_eq!(h.state("accounts"), JobState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_triggers_while_pending_share_one_pull() {
    let h = start(FakeRemote::default(), &["transactions"]);

    h.send("transactions", TriggerCause::LocalWrite).await;
    h.send("transactions", TriggerCause::LocalWrite).await;
    h.send("transactions", TriggerCause::LocalWrite).await;
    sleep_ms(1_000).await;

    assert_eq!(h.remote.list_calls("transactions"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_local_writes_debounce_into_single_pull() {
    let h = start(FakeRemote::default(), &["transactions"]);

    h.send("transactions", TriggerCause::LocalWrite).await;
    sleep_ms(50).await;
    h.send("transactions", TriggerCause::LocalWrite).await;

    sleep_ms(400).await;
    assert_eq!(h.remote.list_calls("transactions"), 0);
    assert_eq!(h.state("transactions"), JobState::Pending);

    sleep_ms(200).await;
    assert_eq!(h.remote.list_calls("transactions"), 1);

    sleep_ms(1_000).await;
    assert_eq!(h.remote.list_calls("transactions"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sustained_local_writes_still_pull_within_max_wait() {
    let h = start(FakeRemote::default(), &["transactions"]);

    // About 10s of writes, each inside the previous debounce window
    for _ in 0..34 {
      h.send("transactions", TriggerCause::LocalWrite).await;
      sleep_ms(300).await;
    }
    assert!(h.remote.list_calls("transactions") >= 4);

    let during = h.remote.list_calls("transactions");
    sleep_ms(3_000).await;
    assert_eq!(h.remote.list_calls("transactions"), during + 1);
    assert_eq!(h.state("transactions"), JobState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeated_failures_back_off_with_growing_delay() {
    let remote = FakeRemote::default();
    let transient = || Err(RemoteError::Transient("connection reset".into()));
    remote.script("budgets", vec![transient(), transient(), transient()]);
    let mut h = start(remote, &["budgets"]);

    h.send("budgets", TriggerCause::AppStart).await;
    sleep_ms(1).await;
    assert_eq!(h.state("budgets"), JobState::Backoff);

    // First retry after 100ms, second after 200ms more
    sleep_ms(100).await;
    sleep_ms(200).await;
    assert_eq!(h.state("budgets"), JobState::Backoff);
    assert_eq!(h.remote.list_calls("budgets"), 3);

    let delays: Vec<Duration> = h
      .drain_events()
      .into_iter()
      .filter_map(|e| match e {
        SyncEvent::Backoff { delay, .. } => Some(delay),
        _ => None,
      })
      .collect();
    assert_eq!(
      delays,
      vec![
        Duration::from_millis(100),
        Duration::from_millis(200),
        Duration::from_millis(250)
      ]
    );

    // Fourth attempt succeeds once the capped delay elapses
    sleep_ms(300).await;
    assert_eq!(h.remote.list_calls("budgets"), 4);
    assert_eq!(h.state("budgets"), JobState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_trigger_during_backoff_does_not_reset_delay() {
    let remote = FakeRemote::default();
    remote.script("budgets", vec![Err(RemoteError::Transient("down".into()))]);
    let h = start(remote, &["budgets"]);

    h.send("budgets", TriggerCause::Reconnect).await;
    sleep_ms(50).await;
    h.send("budgets", TriggerCause::RealtimePush).await;
    sleep_ms(10).await;

    assert_eq!(h.remote.list_calls("budgets"), 1);
    sleep_ms(100).await;
    assert_eq!(h.remote.list_calls("budgets"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rejection_is_surfaced_once_and_not_retried() {
    let remote = FakeRemote::default();
    remote.script(
      "accounts",
      vec![Err(RemoteError::Rejected {
        status: 401,
        message: "JWT expired".into(),
      })],
    );
    let mut h = start(remote, &["accounts"]);

    h.send("accounts", TriggerCause::Reconnect).await;
    sleep_ms(5_000).await;

    assert_eq!(h.remote.list_calls("accounts"), 1);
    assert_eq!(h.state("accounts"), JobState::Idle);
    let rejected: Vec<_> = h
      .drain_events()
      .into_iter()
      .filter(|e| matches!(e, SyncEvent::Rejected { .. }))
      .collect();
    assert_eq!(rejected.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_untracked_resource_is_ignored() {
    let h = start(FakeRemote::default(), &["accounts"]);

    h.send("goals", TriggerCause::RealtimePush).await;
    sleep_ms(10).await;

    assert_eq!(h.remote.list_calls("goals"), 0);
    assert_eq!(h.remote.list_calls("accounts"), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_pull_finishing_after_shutdown_is_discarded() {
    let h = start(FakeRemote::with_list_delay(Duration::from_millis(100)), &["accounts"]);
    h.remote.set_rows("accounts", vec![record("a1", 1)]);

    h.send("accounts", TriggerCause::Reconnect).await;
    sleep_ms(10).await;
    h.shutdown.cancel();
    sleep_ms(200).await;

    assert_eq!(h.remote.list_calls("accounts"), 1);
    assert!(h.storage.records("accounts").unwrap().is_empty());
    assert!(h.storage.sync_state("accounts").unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_app_start_waits_for_online() {
    let (tx, mut rx) = trigger_channel(4);
    let (state_tx, state_rx) = watch::channel(ConnectivityState {
      online: false,
      last_transition_at: Utc::now(),
    });
    tokio::spawn(trigger_app_start(tx, state_rx, CancellationToken::new()));

    sleep_ms(100).await;
    state_tx.send_replace(ConnectivityState {
      online: true,
      last_transition_at: Utc::now(),
    });

    let trigger = rx.next().await.unwrap();
    assert_eq!(trigger.cause, TriggerCause::AppStart);
    assert!(trigger.is_fan_out());
    assert!(rx.next().await.is_none());
  }
}
