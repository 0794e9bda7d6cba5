//! An authenticated session: every component of the sync core, wired together.
//!
//! Startup order follows the control flow: persistence grant and cache router
//! first, then the network monitor, the coordinator and the push channels.
//! Sign-out tears all of it down.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{CacheRouter, CacheStorage, PolicyTable};
use crate::config::Config;
use crate::event::trigger_channel;
use crate::fetch::NetworkFetcher;
use crate::network::{ConnectivityProbe, NetworkMonitor};
use crate::persistence::{PersistenceGrant, PersistenceGrantManager, StoragePlatform};
use crate::realtime::SubscriptionManager;
use crate::remote::{RemoteStore, RemoteWriter};
use crate::sync::{trigger_app_start, JobState, SyncCoordinator, SyncEvent, SyncSettings};
use crate::update::{BundleWatcher, LifecycleMessage, UpdateCoordinator};

/// External collaborators a session talks to
pub struct Dependencies<S: CacheStorage> {
  pub storage: Arc<S>,
  pub remote: Arc<dyn RemoteStore>,
  pub fetcher: Arc<dyn NetworkFetcher>,
  pub platform: Arc<dyn StoragePlatform>,
}

pub struct Session<S: CacheStorage + 'static> {
  storage: Arc<S>,
  router: CacheRouter<S>,
  grant: Arc<PersistenceGrantManager>,
  monitor: NetworkMonitor,
  subscriptions: SubscriptionManager,
  writer: RemoteWriter,
  events: broadcast::Sender<SyncEvent>,
  jobs: watch::Receiver<HashMap<String, JobState>>,
  updates: UpdateCoordinator,
  shutdown: CancellationToken,
}

impl<S: CacheStorage + 'static> Session<S> {
  /// Start a session. `initially_online` is the platform's current
  /// connectivity, which the monitor starts from.
  pub async fn start(
    config: &Config,
    deps: Dependencies<S>,
    initially_online: bool,
  ) -> Result<Self> {
    let shutdown = CancellationToken::new();

    // The grant never blocks startup
    let grant = Arc::new(PersistenceGrantManager::new());
    {
      let grant = Arc::clone(&grant);
      let platform = Arc::clone(&deps.platform);
      tokio::spawn(async move {
        grant.activate(platform.as_ref()).await;
      });
    }

    let mut router = CacheRouter::new(
      Arc::clone(&deps.storage),
      deps.fetcher,
      PolicyTable::standard(&config.cache.api_prefixes),
    );
    if let Some(path) = &config.cache.offline_page {
      let page = tokio::fs::read(path)
        .await
        .map_err(|e| eyre!("Failed to read offline page {}: {}", path.display(), e))?;
      router = router.with_offline_page(page);
    }

    let (triggers, trigger_rx) = trigger_channel(config.sync.trigger_capacity);

    let monitor = NetworkMonitor::spawn(
      initially_online,
      Duration::from_millis(config.network.flap_window_ms),
      triggers.clone(),
      shutdown.clone(),
    );

    let coordinator = SyncCoordinator::new(
      config.resources.clone(),
      Arc::clone(&deps.remote),
      Arc::clone(&deps.storage),
      SyncSettings::from(&config.sync),
      shutdown.clone(),
    );
    let events = coordinator.event_sender();
    let jobs = coordinator.job_states();
    tokio::spawn(coordinator.run(trigger_rx));

    let subscriptions = SubscriptionManager::new(Arc::clone(&deps.remote), triggers.clone());
    subscriptions.start_session(&config.resources);
    tokio::spawn(
      subscriptions
        .clone()
        .run_reconnects(monitor.reconnects(), monitor.confirmations()),
    );

    tokio::spawn(trigger_app_start(
      triggers.clone(),
      monitor.subscribe(),
      shutdown.clone(),
    ));

    let writer = RemoteWriter::new(deps.remote, triggers);
    let updates = UpdateCoordinator::new(config.app.version.clone(), config.app.auto_activate);

    info!(
      resources = config.resources.len(),
      online = initially_online,
      "Session started"
    );

    Ok(Self {
      storage: deps.storage,
      router,
      grant,
      monitor,
      subscriptions,
      writer,
      events,
      jobs,
      updates,
      shutdown,
    })
  }

  pub fn router(&self) -> &CacheRouter<S> {
    &self.router
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn grant(&self) -> watch::Receiver<PersistenceGrant> {
    self.grant.subscribe()
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.monitor
  }

  pub fn subscriptions(&self) -> &SubscriptionManager {
    &self.subscriptions
  }

  /// Write gateway for this session
  pub fn writer(&self) -> RemoteWriter {
    self.writer.clone()
  }

  pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn job_states(&self) -> watch::Receiver<HashMap<String, JobState>> {
    self.jobs.clone()
  }

  pub fn updates(&self) -> &UpdateCoordinator {
    &self.updates
  }

  /// Apply a control message sent by the embedding application, either as
  /// JSON (`"activate-now"`) or the bare word. Returns whether it took effect.
  pub fn control(&self, line: &str) -> Result<bool> {
    let message: LifecycleMessage = line
      .parse()
      .map_err(|e| eyre!("Unknown control message {:?}: {}", line.trim(), e))?;
    Ok(self.updates.handle_message(message))
  }

  /// Feed probe results to the monitor until the session ends.
  pub fn spawn_probe(&self, probe: ConnectivityProbe) {
    tokio::spawn(probe.run(self.monitor.clone(), self.shutdown.clone()));
  }

  pub fn spawn_bundle_watcher(&self, watcher: BundleWatcher) {
    tokio::spawn(watcher.run(self.updates.clone(), self.shutdown.clone()));
  }

  pub fn is_active(&self) -> bool {
    !self.shutdown.is_cancelled()
  }

  /// Close every push channel and stop scheduling reconciliation. A pull
  /// already in flight finishes, but its result is discarded.
  pub fn sign_out(&self) {
    if !self.is_active() {
      return;
    }
    self.subscriptions.teardown();
    self.shutdown.cancel();
    info!("Session ended");
  }
}

impl<S: CacheStorage + 'static> Drop for Session<S> {
  fn drop(&mut self) {
    self.sign_out();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::fetch::{FetchError, FetchRequest};
  use crate::persistence::{GrantStatus, StorageEstimate};
  use crate::realtime::SubscriptionStatus;
  use crate::remote::testing::{record, FakeRemote};
  use crate::cache::CacheSource;
  use crate::remote::ChangeKind;
  use crate::update::{BundleState, LifecycleEvent};
  use async_trait::async_trait;

  struct OfflineFetcher;

  #[async_trait]
  impl NetworkFetcher for OfflineFetcher {
    async fn fetch(&self, _request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
      Err(FetchError::Network("offline".into()))
    }
  }

  struct GrantingPlatform;

  #[async_trait]
  impl StoragePlatform for GrantingPlatform {
    async fn persisted(&self) -> Result<bool> {
      Ok(false)
    }

    async fn persist(&self) -> Result<bool> {
      Ok(true)
    }

    async fn estimate(&self) -> Result<StorageEstimate> {
      Ok(StorageEstimate {
        usage: 0,
        quota: None,
      })
    }
  }

  fn config() -> Config {
    Config::parse(
      r#"
remote:
  url: https://db.example.com
  owner: 0b6e
resources: [accounts, budgets]
"#,
    )
    .unwrap()
  }

  async fn start(
    config: &Config,
    online: bool,
  ) -> Result<(Session<SqliteStorage>, Arc<FakeRemote>)> {
    let remote = Arc::new(FakeRemote::default());
    let deps = Dependencies {
      storage: Arc::new(SqliteStorage::open_in_memory()?),
      remote: remote.clone(),
      fetcher: Arc::new(OfflineFetcher),
      platform: Arc::new(GrantingPlatform),
    };
    let session = Session::start(config, deps, online).await?;
    Ok((session, remote))
  }

  async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_online_start_reconciles_everything_once() {
    let (session, remote) = start(&config(), true).await.unwrap();
    remote.set_rows("accounts", vec![record("a1", 10)]);
    sleep_ms(10).await;

    assert_eq!(remote.list_calls("accounts"), 1);
    assert_eq!(remote.list_calls("budgets"), 1);
    assert_eq!(session.storage().records("accounts").unwrap().len(), 1);
    assert_eq!(
      session.subscriptions().status("budgets"),
      Some(SubscriptionStatus::Active)
    );
    assert_eq!(session.grant().borrow().status, GrantStatus::Granted);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_start_waits_for_connectivity() {
    let (session, remote) = start(&config(), false).await.unwrap();
    sleep_ms(1_000).await;
    assert_eq!(remote.list_calls("accounts"), 0);

    session.monitor().report(true).await;
    sleep_ms(10).await;

    assert_eq!(remote.list_calls("accounts"), 1);
    assert_eq!(remote.list_calls("budgets"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_local_write_pulls_back_after_debounce() {
    let (session, remote) = start(&config(), true).await.unwrap();
    sleep_ms(10).await;

    session.writer().write("accounts", &record("a2", 3)).await.unwrap();
    sleep_ms(600).await;

    assert_eq!(remote.list_calls("accounts"), 2);
    assert_eq!(remote.list_calls("budgets"), 1);
    assert_eq!(session.storage().records("accounts").unwrap().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_push_invalidates_resource() {
    let (session, remote) = start(&config(), true).await.unwrap();
    sleep_ms(10).await;
    let mut events = session.events();

    remote.push("budgets", ChangeKind::Insert).await;
    sleep_ms(10).await;

    assert_eq!(remote.list_calls("budgets"), 2);
    assert_eq!(
      events.try_recv().unwrap(),
      SyncEvent::Invalidated {
        resource: "budgets".into()
      }
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_sign_out_closes_channels_and_stops_sync() {
    let (session, remote) = start(&config(), true).await.unwrap();
    sleep_ms(10).await;

    session.sign_out();
    session.sign_out();
    remote.push("accounts", ChangeKind::Update).await;
    session.monitor().report(false).await;
    session.monitor().report(true).await;
    sleep_ms(1_000).await;

    assert!(!session.is_active());
    assert!(session
      .subscriptions()
      .handles()
      .iter()
      .all(|h| h.status == SubscriptionStatus::Closed));
    assert_eq!(remote.list_calls("accounts"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_closed_push_channel_reopens_when_online_is_confirmed() {
    let (session, remote) = start(&config(), true).await.unwrap();
    sleep_ms(10).await;

    remote.disconnect("accounts");
    sleep_ms(10).await;
    assert_eq!(
      session.subscriptions().status("accounts"),
      Some(SubscriptionStatus::Closed)
    );

    session.monitor().report(true).await;
    sleep_ms(10).await;

    assert_eq!(remote.subscribe_calls("accounts"), 2);
    assert_eq!(
      session.subscriptions().status("accounts"),
      Some(SubscriptionStatus::Active)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_installed_bundle_waits_for_running_instance() {
    let (session, _remote) = start(&config(), true).await.unwrap();
    let mut instance = session.updates().register_instance();
    let dir = std::env::temp_dir().join(format!("ledgersync-session-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("VERSION"), "0.2.0").unwrap();

    let watcher = BundleWatcher::new(dir.clone(), Duration::from_secs(30));
    assert!(watcher.poll(session.updates()).await);
    assert!(matches!(
      session.updates().state(),
      BundleState::Waiting { .. }
    ));
    assert!(instance.events.try_recv().is_err());

    assert!(session.control("\"activate-now\"").unwrap());
    assert!(!session.control("activate-now").unwrap());
    assert!(session.control("reload").is_err());

    assert_eq!(
      instance.events.try_recv().unwrap(),
      LifecycleEvent::VersionChanged {
        from: "0.1.0".into(),
        to: "0.2.0".into()
      }
    );
    assert_eq!(session.updates().state().active_version(), "0.2.0");
    let _ = std::fs::remove_dir_all(dir);
  }

  #[tokio::test]
  async fn test_router_serves_offline_page_for_navigation() {
    let page = std::env::temp_dir().join(format!("ledgersync-offline-{}.html", std::process::id()));
    std::fs::write(&page, "<h1>offline</h1>").unwrap();
    let mut config = config();
    config.cache.offline_page = Some(page.clone());
    let (session, _remote) = start(&config, false).await.unwrap();

    let request = FetchRequest::document("https://app.example.com/budgets".parse().unwrap());
    let result = session.router().handle(&request).await.unwrap();

    assert_eq!(result.source, CacheSource::OfflinePage);
    assert_eq!(result.data, b"<h1>offline</h1>".to_vec());
    let _ = std::fs::remove_file(page);
  }

  #[tokio::test]
  async fn test_missing_offline_page_fails_start() {
    let mut config = config();
    config.cache.offline_page = Some("/nonexistent/ledgersync/offline.html".into());

    assert!(start(&config, true).await.is_err());
  }
}
