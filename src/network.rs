//! Network status monitor.
//!
//! Turns platform online/offline edges into a debounced `ConnectivityState`
//! for observers and one `Reconnect` trigger per online edge. An online report
//! while already online counts as a confirmation.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::event::{TriggerCause, TriggerSender, ALL_RESOURCES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
  pub online: bool,
  pub last_transition_at: DateTime<Utc>,
}

/// Handle to the monitor task. Cheap to clone.
#[derive(Clone)]
pub struct NetworkMonitor {
  edges: mpsc::Sender<bool>,
  state: watch::Receiver<ConnectivityState>,
  reconnects: watch::Receiver<u64>,
  confirmations: watch::Receiver<u64>,
}

impl NetworkMonitor {
  /// Start the monitor from the platform's current reported state.
  pub fn spawn(
    initially_online: bool,
    flap_window: Duration,
    triggers: TriggerSender,
    shutdown: CancellationToken,
  ) -> Self {
    let (edges_tx, edges_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(ConnectivityState {
      online: initially_online,
      last_transition_at: Utc::now(),
    });
    let (reconnect_tx, reconnect_rx) = watch::channel(0u64);
    let (confirm_tx, confirm_rx) = watch::channel(0u64);

    let task = MonitorTask {
      online: initially_online,
      came_online_at: None,
      pending_offline: None,
      flap_window,
      triggers,
      state: state_tx,
      reconnects: reconnect_tx,
      confirmations: confirm_tx,
    };
    tokio::spawn(task.run(edges_rx, shutdown));

    info!(online = initially_online, "Network monitor started");
    Self {
      edges: edges_tx,
      state: state_rx,
      reconnects: reconnect_rx,
      confirmations: confirm_rx,
    }
  }

  /// Feed a platform connectivity signal.
  pub async fn report(&self, online: bool) {
    let _ = self.edges.send(online).await;
  }

  pub fn state(&self) -> ConnectivityState {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state.borrow().online
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.state.clone()
  }

  /// Counter bumped on every online edge
  pub fn reconnects(&self) -> watch::Receiver<u64> {
    self.reconnects.clone()
  }

  /// Counter bumped when an online report arrives while already online
  pub fn confirmations(&self) -> watch::Receiver<u64> {
    self.confirmations.clone()
  }
}

struct MonitorTask {
  /// Latest raw platform state
  online: bool,
  came_online_at: Option<Instant>,
  /// Offline edge held back until the flap window closes
  pending_offline: Option<Instant>,
  flap_window: Duration,
  triggers: TriggerSender,
  state: watch::Sender<ConnectivityState>,
  reconnects: watch::Sender<u64>,
  confirmations: watch::Sender<u64>,
}

impl MonitorTask {
  async fn run(mut self, mut edges: mpsc::Receiver<bool>, shutdown: CancellationToken) {
    loop {
      let deadline = self
        .pending_offline
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

      tokio::select! {
        _ = shutdown.cancelled() => break,
        edge = edges.recv() => match edge {
          Some(online) => self.on_edge(online).await,
          None => break,
        },
        _ = sleep_until(deadline), if self.pending_offline.is_some() => {
          self.pending_offline = None;
          self.publish(false);
        }
      }
    }
    debug!("Network monitor stopped");
  }

  async fn on_edge(&mut self, online: bool) {
    if online == self.online {
      if online {
        self.confirmations.send_modify(|n| *n += 1);
      }
      return;
    }
    self.online = online;
    let now = Instant::now();

    if online {
      self.came_online_at = Some(now);
      if self.pending_offline.take().is_some() {
        debug!("Connectivity flapped, offline notification suppressed");
      } else {
        self.publish(true);
      }
      self.reconnects.send_modify(|n| *n += 1);
      self.triggers.emit(ALL_RESOURCES, TriggerCause::Reconnect).await;
    } else {
      match self.came_online_at {
        Some(at) if now.duration_since(at) < self.flap_window => {
          self.pending_offline = Some(at + self.flap_window);
        }
        _ => self.publish(false),
      }
    }
  }

  fn publish(&self, online: bool) {
    info!(online, "Connectivity changed");
    self.state.send_replace(ConnectivityState {
      online,
      last_transition_at: Utc::now(),
    });
  }
}

/// Connectivity source for hosts without online/offline events: probes a URL
/// on an interval and reports the result to the monitor.
pub struct ConnectivityProbe {
  client: reqwest::Client,
  url: Url,
  interval: Duration,
}

impl ConnectivityProbe {
  pub fn new(url: Url, interval: Duration) -> Self {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(5))
      .build()
      .unwrap_or_default();
    Self {
      client,
      url,
      interval,
    }
  }

  /// Any HTTP response means the network is reachable.
  pub async fn check(&self) -> bool {
    self.client.head(self.url.clone()).send().await.is_ok()
  }

  pub async fn run(self, monitor: NetworkMonitor, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = ticker.tick() => {
          let online = self.check().await;
          monitor.report(online).await;
        }
      }
    }
  }
}
