//! Typed errors for the engine's components.
//!
//! Network and server failures are kept apart because they drive different
//! control flow: a network error falls back to cache or queues a write, a
//! server rejection is handed back to the caller untouched.

use thiserror::Error;

/// Failure of a single network exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Connectivity lost, DNS failure, connection reset. Recoverable.
  #[error("network unavailable: {0}")]
  Network(String),
  /// The server answered, but refused the operation. Terminal.
  #[error("server rejected request with status {status}")]
  Rejected { status: u16, body: String },
}

impl FetchError {
  pub fn is_network(&self) -> bool {
    matches!(self, FetchError::Network(_))
  }
}

/// Failure of the local persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("serialization: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("lock poisoned: {0}")]
  LockPoisoned(String),
  #[error("storage quota exceeded ({used} of {quota} bytes)")]
  QuotaExceeded { used: u64, quota: u64 },
  #[error("invalid record: {0}")]
  InvalidRecord(String),
}

/// Reasons a generation's installation is aborted.
#[derive(Debug, Error)]
pub enum InstallError {
  #[error("generation {requested} is not newer than active generation {active}")]
  Stale { requested: u32, active: u32 },
  #[error("generation {0} is already being installed")]
  InProgress(u32),
  #[error("failed to fetch precache asset {url}: {source}")]
  Asset {
    url: String,
    #[source]
    source: FetchError,
  },
  #[error("precache asset {url} answered with status {status}")]
  AssetStatus { url: String, status: u16 },
  #[error("failed to store precache asset: {0}")]
  Store(#[from] StoreError),
}

/// Outcome of handing a mutation to the write queue that was not a success.
#[derive(Debug, Error)]
pub enum SubmitError {
  /// The server refused the operation; it was not queued.
  #[error(transparent)]
  Rejected(FetchError),
  /// The operation could not be persisted for later replay.
  #[error("failed to queue operation: {0}")]
  Store(#[from] StoreError),
}
