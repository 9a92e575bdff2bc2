//! What a strategy hands back to the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::FetchError;
use crate::http::Response;

/// Result of serving one request, including metadata about the source.
#[derive(Debug)]
pub struct Served {
  /// The response to hand back to the page
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
  /// Detached network refresh started alongside a cache hit
  pub background: Option<Refresh>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      stored_at: None,
      background: None,
    }
  }

  pub fn from_cache(response: Response, stored_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      stored_at: Some(stored_at),
      background: None,
    }
  }

  /// Cached response served because the network failed.
  pub fn offline(response: Response, stored_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
      stored_at: Some(stored_at),
      background: None,
    }
  }

  /// Response generated locally (offline error body, image placeholder).
  pub fn synthesized(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Synthesized,
      stored_at: None,
      background: None,
    }
  }

  pub fn with_background(mut self, refresh: Refresh) -> Self {
    self.background = Some(refresh);
    self
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache hit, returned without waiting for the network
  Cache,
  /// Network failed, serving a previously cached entry
  Offline,
  /// Nothing to serve, response built locally
  Synthesized,
}

/// Handle on a detached fetch-and-store task.
///
/// The task only ever writes to the partition store. Dropping the handle
/// leaves it running to completion.
#[derive(Debug)]
pub struct Refresh {
  handle: JoinHandle<Result<Response, FetchError>>,
}

impl Refresh {
  pub(crate) fn new(handle: JoinHandle<Result<Response, FetchError>>) -> Self {
    Self { handle }
  }

  /// Wait for the refresh to finish and return its network outcome.
  pub async fn wait(self) -> Result<Response, FetchError> {
    match self.handle.await {
      Ok(result) => result,
      Err(e) => Err(FetchError::Network(format!("refresh task failed: {}", e))),
    }
  }
}
