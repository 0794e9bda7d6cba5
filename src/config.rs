use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Resources kept in the local replica and subscribed to for push changes
  #[serde(default = "default_resources")]
  pub resources: Vec<String>,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub app: AppConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: Url,
  /// Identity that scopes rows and push channels
  pub owner: String,
}

fn default_resources() -> Vec<String> {
  ["accounts", "transactions", "budgets", "categories"]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Window in which local writes to one resource collapse into one pull
  pub local_write_debounce_ms: u64,
  /// Longest a burst of local writes can hold off its pull
  pub local_write_max_wait_ms: u64,
  pub backoff_initial_ms: u64,
  pub backoff_max_ms: u64,
  /// Capacity of the trigger channel feeding the coordinator
  pub trigger_capacity: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      local_write_debounce_ms: 500,
      local_write_max_wait_ms: 2_000,
      backoff_initial_ms: 1_000,
      backoff_max_ms: 60_000,
      trigger_capacity: 64,
    }
  }
}

impl SyncConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.local_write_debounce_ms)
  }

  pub fn max_wait(&self) -> Duration {
    Duration::from_millis(self.local_write_max_wait_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// URL probed for connectivity (defaults to the remote url)
  pub probe_url: Option<Url>,
  pub probe_interval_secs: u64,
  /// An offline edge this soon after coming online is held back from observers
  pub flap_window_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
      flap_window_ms: 2_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// SQLite cache database (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// Byte budget for cached responses
  pub quota_bytes: Option<u64>,
  /// HTML served for documents when both network and cache fail
  pub offline_page: Option<PathBuf>,
  /// Path prefixes routed to the API policy
  pub api_prefixes: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      quota_bytes: None,
      offline_page: None,
      api_prefixes: vec!["/rest/".into(), "/api/".into(), "/realtime/".into()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// Version of the asset bundle this instance runs
  pub version: String,
  /// Directory the platform installs new asset bundles into
  pub bundle_dir: Option<PathBuf>,
  /// Activate a waiting bundle as soon as it is detected
  pub auto_activate: bool,
  pub bundle_poll_secs: u64,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      version: env!("CARGO_PKG_VERSION").to_string(),
      bundle_dir: None,
      auto_activate: false,
      bundle_poll_secs: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ledgersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ledgersync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ledgersync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ledgersync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ledgersync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.resources.is_empty() {
      return Err(eyre!("At least one resource must be tracked"));
    }
    Ok(config)
  }

  /// Get the remote API key from the environment.
  pub fn get_api_key() -> Result<String> {
    std::env::var("LEDGERSYNC_API_KEY").map_err(|_| {
      eyre!("Remote API key not found. Set the LEDGERSYNC_API_KEY environment variable.")
    })
  }

  /// Directory for the cache database, logs and the persistence marker.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ledgersync"))
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  pub fn probe_url(&self) -> Url {
    self
      .network
      .probe_url
      .clone()
      .unwrap_or_else(|| self.remote.url.clone())
  }
}
