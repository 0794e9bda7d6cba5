//! HTTP adapter for the remote store: REST rows plus a server-sent event push channel.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::config::RemoteConfig;

use super::{ChangeFeed, ChangeKind, ChangeNotice, Record, RemoteError, RemoteStore};

/// Column that scopes every row to its owning identity
const OWNER_COLUMN: &str = "user_id";

/// Remote store client speaking the REST/realtime dialect of the hosted backend.
#[derive(Clone)]
pub struct HttpRemoteStore {
  client: reqwest::Client,
  base: Url,
  owner: String,
  api_key: String,
}

impl HttpRemoteStore {
  pub fn new(config: &RemoteConfig, api_key: String) -> Result<Self> {
    let mut base = config.url.clone();
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      owner: config.owner.clone(),
      api_key,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
    let mut url = self
      .base
      .join(path)
      .map_err(|e| RemoteError::Transient(format!("invalid endpoint {}: {}", path, e)))?;
    url
      .query_pairs_mut()
      .append_pair(OWNER_COLUMN, &format!("eq.{}", self.owner));
    Ok(url)
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    request
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
  }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn list(&self, resource: &str) -> Result<Vec<Record>, RemoteError> {
    let mut url = self.endpoint(&format!("rest/v1/{}", resource))?;
    url.query_pairs_mut().append_pair("select", "*");

    let response = self
      .authorize(self.client.get(url))
      .send()
      .await
      .map_err(transport)?;
    let rows: Vec<Value> = check(response).await?.json().await.map_err(transport)?;

    let total = rows.len();
    let records: Vec<Record> = rows.into_iter().filter_map(Record::from_row).collect();
    if records.len() != total {
      warn!(resource, skipped = total - records.len(), "Skipped rows without an id");
    }
    Ok(records)
  }

  async fn write(&self, resource: &str, record: &Record) -> Result<Record, RemoteError> {
    let mut url = self.endpoint(&format!("rest/v1/{}", resource))?;
    url.query_pairs_mut().append_pair("on_conflict", "id");

    let mut body = record.data.clone();
    if let Value::Object(map) = &mut body {
      map.insert("id".into(), Value::String(record.id.clone()));
      map.insert(OWNER_COLUMN.into(), Value::String(self.owner.clone()));
    }

    let response = self
      .authorize(self.client.post(url))
      .header("Prefer", "return=representation,resolution=merge-duplicates")
      .json(&body)
      .send()
      .await
      .map_err(transport)?;
    let rows: Vec<Value> = check(response).await?.json().await.map_err(transport)?;

    rows
      .into_iter()
      .next()
      .and_then(Record::from_row)
      .ok_or_else(|| RemoteError::Transient(format!("empty write response for {}", resource)))
  }

  async fn subscribe(&self, resource: &str) -> Result<ChangeFeed, RemoteError> {
    let url = self.endpoint(&format!("realtime/v1/{}", resource))?;

    let response = self
      .authorize(self.client.get(url))
      .header("Accept", "text/event-stream")
      .send()
      .await
      .map_err(transport)?;
    let response = check(response).await?;

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(pump_events(resource.to_string(), response, tx));
    Ok(rx)
  }
}

fn transport(e: reqwest::Error) -> RemoteError {
  RemoteError::Transient(e.to_string())
}

async fn check(response: Response) -> Result<Response, RemoteError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let message = response.text().await.unwrap_or_default();
  Err(RemoteError::from_status(status.as_u16(), message))
}

/// Forward server-sent events into the feed until either side closes.
async fn pump_events(resource: String, response: Response, tx: mpsc::Sender<ChangeNotice>) {
  let mut stream = response.bytes_stream();
  let mut buffer: Vec<u8> = Vec::new();

  loop {
    let chunk = tokio::select! {
      _ = tx.closed() => break,
      chunk = stream.next() => chunk,
    };

    match chunk {
      Some(Ok(bytes)) => {
        buffer.extend_from_slice(&bytes);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
          let line: Vec<u8> = buffer.drain(..=pos).collect();
          let line = String::from_utf8_lossy(&line);
          if let Some(notice) = parse_event_line(&resource, line.trim_end()) {
            if tx.send(notice).await.is_err() {
              return;
            }
          }
        }
      }
      Some(Err(e)) => {
        warn!(resource = %resource, "Push channel error: {}", e);
        break;
      }
      None => break,
    }
  }

  debug!(resource = %resource, "Push channel closed");
}

#[derive(Deserialize)]
struct EventPayload {
  #[serde(rename = "type")]
  kind: ChangeKind,
  record: Option<Value>,
  old_record: Option<Value>,
}

/// Parse one `data:` line of the event stream. Comments, keep-alives and
/// unknown payloads yield `None`.
fn parse_event_line(resource: &str, line: &str) -> Option<ChangeNotice> {
  let payload = line.strip_prefix("data:")?.trim();
  let event: EventPayload = serde_json::from_str(payload).ok()?;
  let record_id = event
    .record
    .or(event.old_record)
    .and_then(Record::from_row)
    .map(|r| r.id);

  Some(ChangeNotice {
    resource: resource.to_string(),
    kind: event.kind,
    record_id,
  })
}
