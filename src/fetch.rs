//! Outbound fetches: the request identity the cache router keys on, and the
//! network seam it falls through to.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use thiserror::Error;
use url::Url;

/// What the fetched response is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Destination {
  /// Page navigation
  Document,
  Script,
  Style,
  Image,
  Font,
  /// Anything else (API calls, data)
  Other,
}

/// An outbound request as seen by the cache router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
}

impl FetchRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Other,
    }
  }

  pub fn document(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Document,
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn is_document(&self) -> bool {
    self.destination == Destination::Document
  }

  /// Lowercased file extension of the last path segment, if any
  pub fn extension(&self) -> Option<String> {
    let segment = self.url.path_segments()?.last()?;
    let (_, ext) = segment.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),
  #[error("network request timed out")]
  Timeout,
  #[error("HTTP status {0}")]
  Status(u16),
}

/// Seam over the network stack.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
  async fn fetch(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
  async fn fetch(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status(status.as_u16()));
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;
    Ok(body.to_vec())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_extension() {
    let req = FetchRequest::get(Url::parse("https://app.example.com/assets/Logo.PNG?v=2").unwrap());
    assert_eq!(req.extension().as_deref(), Some("png"));

    let req = FetchRequest::get(Url::parse("https://app.example.com/budgets").unwrap());
    assert_eq!(req.extension(), None);
  }

  #[test]
  fn test_document_request() {
    let req = FetchRequest::document(Url::parse("https://app.example.com/").unwrap());
    assert!(req.is_document());
    assert_eq!(req.method, Method::GET);
  }
}
