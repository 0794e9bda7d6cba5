use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use url::Url;

use ledgersync::cache::{CacheRouter, CacheStorage, PolicyTable, SqliteStorage};
use ledgersync::config::Config;
use ledgersync::fetch::{Destination, FetchRequest, HttpFetcher};
use ledgersync::logging;
use ledgersync::network::ConnectivityProbe;
use ledgersync::persistence::{FsStoragePlatform, GrantStatus, StoragePlatform};
use ledgersync::remote::{HttpRemoteStore, Record};
use ledgersync::session::{Dependencies, Session};
use ledgersync::sync::{JobState, SyncEvent};
use ledgersync::update::{BundleState, BundleWatcher};

#[derive(Parser, Debug)]
#[command(name = "ledgersync")]
#[command(about = "Offline-first cache and sync core for a personal finance tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ledgersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Start a session and keep the local replica in sync until Ctrl-C.
  /// Reads control messages (`activate-now`) from stdin, one per line.
  Run,
  /// Fetch one URL through the offline cache
  Fetch {
    url: Url,
    /// What the response is used for (`document` is a page navigation)
    #[arg(long = "as", value_enum, default_value = "other")]
    destination: Destination,
  },
  /// Show persistence, cache and sync state
  Status {
    /// Also list the replica records of each resource
    #[arg(long)]
    records: bool,
  },
  /// Write a record to the remote store and pull the result back
  Write {
    resource: String,
    /// Record as a JSON object with an `id` field
    json: String,
  },
}

const WRITE_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&Config::data_dir()?.join("logs"), args.verbose)?;

  match args.command {
    Command::Run => run(&config).await,
    Command::Fetch { url, destination } => fetch(&config, url, destination).await,
    Command::Status { records } => status(&config, records).await,
    Command::Write { resource, json } => write(&config, &resource, &json).await,
  }
}

fn open_storage(config: &Config) -> Result<Arc<SqliteStorage>> {
  let storage = SqliteStorage::open(&config.cache_path()?)?;
  Ok(Arc::new(storage.with_quota(config.cache.quota_bytes)))
}

fn platform(config: &Config) -> Result<FsStoragePlatform> {
  Ok(FsStoragePlatform::new(
    Config::data_dir()?,
    config.cache_path()?,
    config.cache.quota_bytes,
  ))
}

fn probe(config: &Config) -> ConnectivityProbe {
  ConnectivityProbe::new(
    config.probe_url(),
    Duration::from_secs(config.network.probe_interval_secs),
  )
}

async fn start_session(config: &Config) -> Result<(Session<SqliteStorage>, ConnectivityProbe)> {
  let deps = Dependencies {
    storage: open_storage(config)?,
    remote: Arc::new(HttpRemoteStore::new(&config.remote, Config::get_api_key()?)?),
    fetcher: Arc::new(HttpFetcher::new()?),
    platform: Arc::new(platform(config)?),
  };

  let probe = probe(config);
  let online = probe.check().await;
  let session = Session::start(config, deps, online).await?;
  Ok((session, probe))
}

async fn run(config: &Config) -> Result<()> {
  let (session, probe) = start_session(config).await?;
  session.spawn_probe(probe);
  if let Some(dir) = &config.app.bundle_dir {
    session.spawn_bundle_watcher(BundleWatcher::new(
      dir.clone(),
      Duration::from_secs(config.app.bundle_poll_secs),
    ));
  }

  // This process runs the active bundle until told otherwise
  let mut instance = session.updates().register_instance();
  let mut bundle = session.updates().subscribe();
  let mut grant = session.grant();
  let mut events = session.events();
  let mut control = BufReader::new(tokio::io::stdin()).lines();
  let mut control_open = true;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) => print_event(&event),
        Err(RecvError::Lagged(n)) => info!(skipped = n, "Event listener lagged"),
        Err(RecvError::Closed) => break,
      },
      Some(event) = instance.events.recv() => {
        println!("{}", serde_json::to_string(&event)?);
      }
      Ok(()) = bundle.changed() => {
        let state = bundle.borrow_and_update().clone();
        if let BundleState::Waiting { active, incoming } = state {
          println!("update      {} -> {} waiting for activate-now", active, incoming);
        }
      }
      Ok(()) = grant.changed() => {
        let current = *grant.borrow_and_update();
        if current.requested {
          let granted = current.status == GrantStatus::Granted;
          println!("storage     {}", if granted { "durable" } else { "best effort" });
        }
      }
      line = control.next_line(), if control_open => match line {
        Ok(Some(line)) if line.trim().is_empty() => {}
        Ok(Some(line)) => match session.control(&line) {
          Ok(true) => {}
          Ok(false) => println!("ignored     {}", line.trim()),
          Err(e) => warn!("{}", e),
        },
        Ok(None) => control_open = false,
        Err(e) => {
          warn!("Control input closed: {}", e);
          control_open = false;
        }
      },
    }
  }

  session.updates().unregister(instance.id);
  session.sign_out();
  Ok(())
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::Invalidated { resource } => println!("synced      {}", resource),
    SyncEvent::Rejected { resource, message } => {
      println!("rejected    {}: {}", resource, message)
    }
    SyncEvent::Backoff {
      resource,
      attempt,
      delay,
    } => println!(
      "retrying    {} (attempt {}, in {}ms)",
      resource,
      attempt,
      delay.as_millis()
    ),
  }
}

async fn fetch(config: &Config, url: Url, destination: Destination) -> Result<()> {
  let router = CacheRouter::new(
    open_storage(config)?,
    Arc::new(HttpFetcher::new()?),
    PolicyTable::standard(&config.cache.api_prefixes),
  );
  let request = FetchRequest::get(url).with_destination(destination);

  let policy = router
    .policies()
    .route(&request)
    .map(|p| p.name.clone())
    .unwrap_or_else(|| "none".to_string());

  let result = router
    .handle(&request)
    .await
    .map_err(|e| eyre!("Fetch failed: {}", e))?;

  println!("policy:    {}", policy);
  println!("source:    {:?}", result.source);
  if let Some(stored_at) = result.stored_at {
    println!("stored at: {}", stored_at.to_rfc3339());
  }
  println!("bytes:     {}", result.data.len());
  Ok(())
}

async fn status(config: &Config, list_records: bool) -> Result<()> {
  let storage = open_storage(config)?;
  let platform = platform(config)?;

  let persisted = platform.persisted().await.unwrap_or(false);
  println!("durable storage: {}", if persisted { "granted" } else { "not granted" });
  let estimate = platform.estimate().await?;
  match estimate.quota {
    Some(quota) => println!("cache usage:     {} / {} bytes", estimate.usage, quota),
    None => println!("cache usage:     {} bytes", estimate.usage),
  }
  println!("cached payloads: {} bytes", storage.usage_bytes()?);

  println!();
  println!("{:<16} {:>8} {:>8}", "POLICY", "ENTRIES", "MAX");
  for policy in PolicyTable::standard(&config.cache.api_prefixes).policies() {
    println!(
      "{:<16} {:>8} {:>8}",
      policy.name,
      storage.entry_count(&policy.name)?,
      policy.max_entries
    );
  }

  println!();
  println!("{:<16} {:>8}  {}", "RESOURCE", "RECORDS", "SYNCED AT");
  for resource in &config.resources {
    match storage.sync_state(resource)? {
      Some(state) => println!(
        "{:<16} {:>8}  {}",
        resource,
        state.record_count,
        state.synced_at.to_rfc3339()
      ),
      None => println!("{:<16} {:>8}  never", resource, "-"),
    }
  }

  if list_records {
    for resource in &config.resources {
      println!();
      println!("{}:", resource);
      for record in storage.records(resource)? {
        println!("  {:<24} {}", record.id, record.data);
      }
    }
  }
  Ok(())
}

async fn write(config: &Config, resource: &str, json: &str) -> Result<()> {
  let row: serde_json::Value =
    serde_json::from_str(json).map_err(|e| eyre!("Invalid record JSON: {}", e))?;
  let record = Record::from_row(row).ok_or_else(|| eyre!("Record must have an `id` field"))?;

  let (session, _probe) = start_session(config).await?;
  let mut events = session.events();

  let saved = session
    .writer()
    .write(resource, &record)
    .await
    .map_err(|e| eyre!("Write failed: {}", e))?;
  let written_at = Utc::now();
  println!("written     {}/{}", resource, saved.id);

  // Wait for the pull that follows the write; an earlier pull may still land first
  let jobs = session.job_states();
  let storage = Arc::clone(session.storage());
  let settled = tokio::time::timeout(WRITE_SETTLE_TIMEOUT, async {
    loop {
      match events.recv().await {
        Ok(SyncEvent::Invalidated { resource: r }) if r == resource => {
          let idle = jobs.borrow().get(resource) == Some(&JobState::Idle);
          let fresh = storage
            .sync_state(resource)?
            .is_some_and(|s| s.synced_at >= written_at);
          if idle && fresh {
            return Ok::<_, color_eyre::Report>(());
          }
        }
        Ok(SyncEvent::Rejected { resource: r, message }) if r == resource => {
          return Err(eyre!("Pull after write rejected: {}", message))
        }
        Ok(_) | Err(RecvError::Lagged(_)) => continue,
        Err(RecvError::Closed) => return Err(eyre!("Session ended before the write settled")),
      }
    }
  })
  .await
  .map_err(|_| eyre!("Timed out waiting for {} to sync", resource))?;

  session.sign_out();
  settled?;
  println!("synced      {}", resource);
  Ok(())
}
