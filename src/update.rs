//! Update coordinator for the cached asset bundle.
//!
//! A new bundle goes `Installing → Waiting → Active`. Activation claims every
//! registered instance and tells each one which version it now runs; reloading
//! is left to the instance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleState {
  /// The platform is writing a new bundle next to the active one
  Installing { active: String, incoming: String },
  /// The new bundle is complete and waits for activation
  Waiting { active: String, incoming: String },
  Active { version: String },
}

impl BundleState {
  pub fn active_version(&self) -> &str {
    match self {
      BundleState::Installing { active, .. } | BundleState::Waiting { active, .. } => active,
      BundleState::Active { version } => version,
    }
  }
}

/// Control messages accepted from instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleMessage {
  /// Skip waiting and activate the installed bundle now
  ActivateNow,
}

/// Parses the JSON form (`"activate-now"`) or the bare word.
impl FromStr for LifecycleMessage {
  type Err = serde_json::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.starts_with('"') {
      serde_json::from_str(s)
    } else {
      serde_json::from_value(serde_json::Value::String(s.to_string()))
    }
  }
}

/// Notifications broadcast to instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LifecycleEvent {
  VersionChanged { from: String, to: String },
}

/// A registered application instance and its notification feed.
pub struct Instance {
  pub id: u64,
  pub events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

struct Registered {
  tx: mpsc::UnboundedSender<LifecycleEvent>,
  /// Bundle version that controls this instance
  version: String,
}

struct Registry {
  state: BundleState,
  instances: HashMap<u64, Registered>,
  next_id: u64,
}

struct Inner {
  registry: Mutex<Registry>,
  published: watch::Sender<BundleState>,
  auto_activate: bool,
}

/// Cheap to clone.
#[derive(Clone)]
pub struct UpdateCoordinator {
  inner: Arc<Inner>,
}

impl UpdateCoordinator {
  pub fn new(version: impl Into<String>, auto_activate: bool) -> Self {
    let state = BundleState::Active {
      version: version.into(),
    };
    let (published, _) = watch::channel(state.clone());
    Self {
      inner: Arc::new(Inner {
        registry: Mutex::new(Registry {
          state,
          instances: HashMap::new(),
          next_id: 1,
        }),
        published,
        auto_activate,
      }),
    }
  }

  fn registry(&self) -> MutexGuard<'_, Registry> {
    self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> BundleState {
    self.registry().state.clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<BundleState> {
    self.inner.published.subscribe()
  }

  /// Register an instance running the active bundle.
  pub fn register_instance(&self) -> Instance {
    let mut reg = self.registry();
    let id = reg.next_id;
    reg.next_id += 1;
    let (tx, events) = mpsc::unbounded_channel();
    let version = reg.state.active_version().to_string();
    reg.instances.insert(id, Registered { tx, version });
    debug!(instance = id, "Instance registered");
    Instance { id, events }
  }

  pub fn unregister(&self, id: u64) {
    if self.registry().instances.remove(&id).is_some() {
      debug!(instance = id, "Instance unregistered");
    }
  }

  /// Version controlling a registered instance
  pub fn instance_version(&self, id: u64) -> Option<String> {
    self.registry().instances.get(&id).map(|i| i.version.clone())
  }

  /// The platform started installing `version`. Returns false if that version
  /// is already installing, waiting or active.
  pub fn begin_install(&self, version: &str) -> bool {
    let mut reg = self.registry();
    let active = match &reg.state {
      BundleState::Active { version: v } if v == version => return false,
      BundleState::Installing { incoming, .. } | BundleState::Waiting { incoming, .. }
        if incoming == version =>
      {
        return false
      }
      other if other.active_version() == version => return false,
      other => other.active_version().to_string(),
    };

    info!(active = %active, incoming = version, "Installing asset bundle");
    reg.state = BundleState::Installing {
      active,
      incoming: version.to_string(),
    };
    self.publish(&reg);
    true
  }

  /// The platform finished installing `version`. The bundle then waits,
  /// unless nothing runs the old one or auto-activation is on.
  pub fn installed(&self, version: &str) -> bool {
    let mut reg = self.registry();
    let (active, incoming) = match &reg.state {
      BundleState::Installing { active, incoming } => (active.clone(), incoming.clone()),
      _ => {
        debug!(version, "Install completion ignored, no install in progress");
        return false;
      }
    };
    if incoming != version {
      warn!(
        version,
        expected = %incoming,
        "Install completion for unexpected version ignored"
      );
      return false;
    }

    reg.state = BundleState::Waiting { active, incoming };
    info!(version, instances = reg.instances.len(), "Asset bundle waiting to activate");

    if reg.instances.is_empty() || self.inner.auto_activate {
      activate(&mut reg);
    }
    self.publish(&reg);
    true
  }

  /// Handle a control message. Returns whether the bundle state changed.
  pub fn handle_message(&self, message: LifecycleMessage) -> bool {
    match message {
      LifecycleMessage::ActivateNow => {
        let mut reg = self.registry();
        if !activate(&mut reg) {
          debug!("Activate-now ignored, no bundle waiting");
          return false;
        }
        self.publish(&reg);
        true
      }
    }
  }

  fn publish(&self, reg: &Registry) {
    self.inner.published.send_replace(reg.state.clone());
  }
}

/// Promote a waiting bundle, claim every instance and notify it.
fn activate(reg: &mut Registry) -> bool {
  let BundleState::Waiting { active, incoming } = &reg.state else {
    return false;
  };
  let (from, to) = (active.clone(), incoming.clone());
  reg.state = BundleState::Active { version: to.clone() };

  reg.instances.retain(|id, instance| {
    instance.version = to.clone();
    let event = LifecycleEvent::VersionChanged {
      from: from.clone(),
      to: to.clone(),
    };
    if instance.tx.send(event).is_err() {
      debug!(instance = id, "Dropping closed instance");
      return false;
    }
    true
  });

  info!(from = %from, to = %to, instances = reg.instances.len(), "Asset bundle activated");
  true
}

/// Watches the platform's bundle directory for a newly installed version.
///
/// The platform writes `VERSION` last, so its presence means the install is complete.
pub struct BundleWatcher {
  dir: PathBuf,
  interval: Duration,
}

const VERSION_FILE: &str = "VERSION";

impl BundleWatcher {
  pub fn new(dir: PathBuf, interval: Duration) -> Self {
    Self { dir, interval }
  }

  async fn read_version(&self) -> Option<String> {
    let path = self.dir.join(VERSION_FILE);
    match tokio::fs::read_to_string(&path).await {
      Ok(contents) => {
        let version = contents.trim();
        (!version.is_empty()).then(|| version.to_string())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
      Err(e) => {
        warn!("Failed to read {}: {}", path.display(), e);
        None
      }
    }
  }

  /// Check once. Returns true if a new bundle was picked up.
  pub async fn poll(&self, updates: &UpdateCoordinator) -> bool {
    let Some(version) = self.read_version().await else {
      return false;
    };
    if !updates.begin_install(&version) {
      return false;
    }
    updates.installed(&version)
  }

  pub async fn run(self, updates: UpdateCoordinator, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = ticker.tick() => {
          self.poll(&updates).await;
        }
      }
    }
  }
}
