//! Test doubles for the network and storage seams.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::cache::{CachedResponse, PartitionStore, RequestKey};
use crate::error::{FetchError, StoreError};
use crate::http::{Fetcher, Request, Response};
use crate::queue::{PendingOperation, Replayer};

#[derive(Clone)]
enum Reply {
  Respond(Response),
  Fail,
  Hang,
  Gated(Arc<Notify>, Response),
}

/// Fetcher answering from a table keyed by `request.url`. Unknown URLs fail
/// as if the network were down.
#[derive(Default)]
pub struct StubFetcher {
  replies: Mutex<HashMap<String, Reply>>,
  requests: Mutex<Vec<Request>>,
}

impl StubFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.set(url, Reply::Respond(response));
  }

  pub fn fail(&self, url: &str) {
    self.set(url, Reply::Fail);
  }

  /// Requests for `url` never resolve.
  pub fn hang(&self, url: &str) {
    self.set(url, Reply::Hang);
  }

  /// Requests for `url` answer with `response` once the returned gate is
  /// notified.
  pub fn gate(&self, url: &str, response: Response) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self.set(url, Reply::Gated(Arc::clone(&gate), response));
    gate
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  fn set(&self, url: &str, reply: Reply) {
    self.replies.lock().unwrap().insert(url.to_string(), reply);
  }
}

#[async_trait]
impl Fetcher for StubFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.requests.lock().unwrap().push(request.clone());
    let reply = self.replies.lock().unwrap().get(&request.url).cloned();
    match reply {
      Some(Reply::Respond(response)) => Ok(response),
      Some(Reply::Hang) => std::future::pending().await,
      Some(Reply::Gated(gate, response)) => {
        gate.notified().await;
        Ok(response)
      }
      Some(Reply::Fail) | None => Err(FetchError::Network(format!("no route to {}", request.url))),
    }
  }
}

/// One scripted replay outcome.
#[derive(Debug, Clone, Copy)]
pub enum ReplayStep {
  Ok,
  Offline,
  Reject(u16),
}

/// Replayer following a per-id script; ids without a script (or with an
/// exhausted one) succeed.
#[derive(Default)]
pub struct StubReplayer {
  scripts: Mutex<HashMap<String, VecDeque<ReplayStep>>>,
  calls: Mutex<Vec<String>>,
}

impl StubReplayer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn script(&self, id: &str, steps: impl IntoIterator<Item = ReplayStep>) {
    self
      .scripts
      .lock()
      .unwrap()
      .insert(id.to_string(), steps.into_iter().collect());
  }

  /// Ids replayed so far, in call order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Replayer for StubReplayer {
  async fn replay(&self, op: &PendingOperation) -> Result<(), FetchError> {
    self.calls.lock().unwrap().push(op.id.clone());
    let step = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(&op.id)
      .and_then(VecDeque::pop_front)
      .unwrap_or(ReplayStep::Ok);
    match step {
      ReplayStep::Ok => Ok(()),
      ReplayStep::Offline => Err(FetchError::Network("offline".to_string())),
      ReplayStep::Reject(status) => Err(FetchError::Rejected {
        status,
        body: String::new(),
      }),
    }
  }
}

/// Partition store whose every call fails.
pub struct FailingStore {
  error: Box<dyn Fn() -> StoreError + Send + Sync>,
}

impl FailingStore {
  pub fn new(error: impl Fn() -> StoreError + Send + Sync + 'static) -> Self {
    Self {
      error: Box::new(error),
    }
  }
}

impl PartitionStore for FailingStore {
  fn get(&self, _partition: &str, _key: &RequestKey) -> Result<Option<CachedResponse>, StoreError> {
    Err((self.error)())
  }

  fn put(&self, _partition: &str, _key: &RequestKey, _response: &Response) -> Result<(), StoreError> {
    Err((self.error)())
  }

  fn delete(&self, _partition: &str, _key: &RequestKey) -> Result<bool, StoreError> {
    Err((self.error)())
  }

  fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
    Err((self.error)())
  }

  fn delete_partition(&self, _partition: &str) -> Result<bool, StoreError> {
    Err((self.error)())
  }
}
