//! Named caching policies and request classification.

use reqwest::Method;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::fetch::{Destination, FetchRequest};

const STATIC_ASSET_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "woff", "woff2", "ttf", "otf", "eot",
];

const BUNDLE_EXTENSIONS: &[&str] = &["js", "mjs", "css"];

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How a policy balances cache and network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Serve a valid entry without touching the network
  CacheFirst,
  /// Prefer the network within a timeout, cache is the fallback
  NetworkFirst,
}

/// Which requests a policy governs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMatcher {
  /// Images and fonts
  StaticAssets,
  /// Built JS/CSS bundles
  Bundles,
  /// API calls, by path prefix
  Api { prefixes: Vec<String> },
  /// Everything else, including page documents
  Any,
}

impl RequestMatcher {
  pub fn matches(&self, request: &FetchRequest) -> bool {
    let ext = request.extension();
    let ext_in = |list: &[&str]| ext.as_deref().is_some_and(|e| list.contains(&e));

    match self {
      RequestMatcher::StaticAssets => {
        matches!(request.destination, Destination::Image | Destination::Font)
          || ext_in(STATIC_ASSET_EXTENSIONS)
      }
      RequestMatcher::Bundles => {
        matches!(request.destination, Destination::Script | Destination::Style)
          || ext_in(BUNDLE_EXTENSIONS)
      }
      RequestMatcher::Api { prefixes } => {
        let path = request.url.path();
        prefixes.iter().any(|p| path.starts_with(p.as_str()))
      }
      RequestMatcher::Any => true,
    }
  }
}

/// A named caching policy. Static for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  pub name: String,
  pub matcher: RequestMatcher,
  pub strategy: Strategy,
  pub max_entries: usize,
  pub max_age: Duration,
  pub network_timeout: Option<Duration>,
}

/// Policies in priority order; the first match wins.
#[derive(Debug, Clone)]
pub struct PolicyTable {
  policies: Vec<CachePolicy>,
}

impl PolicyTable {
  pub fn new(policies: Vec<CachePolicy>) -> Self {
    Self { policies }
  }

  /// The application's policy table.
  pub fn standard(api_prefixes: &[String]) -> Self {
    Self::new(vec![
      CachePolicy {
        name: "static-assets".into(),
        matcher: RequestMatcher::StaticAssets,
        strategy: Strategy::CacheFirst,
        max_entries: 100,
        max_age: DAY * 30,
        network_timeout: None,
      },
      CachePolicy {
        name: "bundles".into(),
        matcher: RequestMatcher::Bundles,
        strategy: Strategy::CacheFirst,
        max_entries: 100,
        max_age: DAY,
        network_timeout: None,
      },
      CachePolicy {
        name: "api".into(),
        matcher: RequestMatcher::Api {
          prefixes: api_prefixes.to_vec(),
        },
        strategy: Strategy::NetworkFirst,
        max_entries: 50,
        max_age: Duration::from_secs(5 * 60),
        network_timeout: Some(Duration::from_secs(10)),
      },
      CachePolicy {
        name: "pages".into(),
        matcher: RequestMatcher::Any,
        strategy: Strategy::NetworkFirst,
        max_entries: 50,
        max_age: DAY,
        network_timeout: Some(Duration::from_secs(10)),
      },
    ])
  }

  /// Policy governing a request. Only GET requests are cacheable.
  pub fn route(&self, request: &FetchRequest) -> Option<&CachePolicy> {
    if request.method != Method::GET {
      return None;
    }
    self.policies.iter().find(|p| p.matcher.matches(request))
  }

  pub fn policies(&self) -> &[CachePolicy] {
    &self.policies
  }
}

/// Cache key for a request: SHA-256 of method and URL (fragment stripped).
pub fn cache_key(request: &FetchRequest) -> String {
  let mut url = request.url.clone();
  url.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}
