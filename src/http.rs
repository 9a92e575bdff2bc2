//! Request/response model and the network seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::FetchError;

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Image,
  Script,
  Style,
  Font,
  Document,
  #[default]
  #[serde(other)]
  Empty,
}

/// An intercepted outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  pub url: String,
  #[serde(default = "default_method")]
  pub method: String,
  #[serde(default, rename = "destinationHint", alias = "destination")]
  pub destination: Destination,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Vec<u8>>,
}

fn default_method() -> String {
  "GET".to_string()
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: default_method(),
      destination: Destination::Empty,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_method(mut self, method: impl Into<String>) -> Self {
    self.method = method.into();
    self
  }

  /// Methods are compared case-insensitively.
  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Resolve the request URL against `origin` when it is relative.
  pub fn resolve(&self, origin: &Url) -> Result<Url, url::ParseError> {
    match Url::parse(&self.url) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => origin.join(&self.url),
      Err(e) => Err(e),
    }
  }
}

/// A response, either fresh from the network or replayed from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// 2xx statuses. Only these are ever written to a partition.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// The structured body returned when neither network nor cache can answer
  /// a data request. Callers branch on `error == "offline"`.
  pub fn offline(message: &str) -> Self {
    let body = serde_json::json!({ "error": "offline", "message": message });
    Self::new(503, body.to_string()).with_header("content-type", "application/json")
  }

  /// Stand-in for an image that is neither cached nor reachable.
  pub fn image_placeholder() -> Self {
    Self::new(200, PLACEHOLDER_SVG)
      .with_header("content-type", "image/svg+xml")
      .with_header("cache-control", "no-store")
  }

  /// True for bodies produced by [`Response::offline`].
  pub fn is_offline_error(&self) -> bool {
    self.status == 503
      && serde_json::from_slice::<serde_json::Value>(&self.body)
        .map(|v| v.get("error").and_then(|e| e.as_str()) == Some("offline"))
        .unwrap_or(false)
  }
}

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#e5e7eb"/><text x="100" y="105" font-family="sans-serif" font-size="14" fill="#6b7280" text-anchor="middle">Offline</text></svg>"##;

/// Anything that can put a request on the wire.
///
/// Implementations resolve with a `Response` for every answer the server
/// gives, whatever its status, and reject only when no answer arrived.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// `Fetcher` backed by reqwest. This is the host adapter for running the
/// engine standalone, so connection timeouts are configured here and never in
/// the strategies.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
  token: Option<String>,
}

impl HttpFetcher {
  pub fn new(
    origin: Url,
    token: Option<String>,
    connect_timeout: Option<Duration>,
  ) -> color_eyre::Result<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = connect_timeout {
      builder = builder.connect_timeout(timeout);
    }
    let client = builder.build()?;

    Ok(Self {
      client,
      origin,
      token,
    })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request
      .resolve(&self.origin)
      .map_err(|e| FetchError::Network(format!("invalid url {}: {}", request.url, e)))?;
    let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| FetchError::Network(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    debug!(%url, method = %request.method, "fetching");
    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
