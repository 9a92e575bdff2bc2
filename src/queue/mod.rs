//! Durable write queue for mutations that failed while offline.
//!
//! - Records are keyed by a caller-supplied idempotency id
//! - A drain replays same-kind records in creation order, kinds in parallel
//! - A record is removed only after the server confirms it
//! - Terminal failures are dead-lettered and announced, never dropped

mod replay;
mod storage;

pub use replay::{HttpReplayer, Replayer};
pub use storage::{OperationState, PendingOperation, QueueStore};

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FetchError, StoreError, SubmitError};
use crate::notify::{NotificationIntent, Notifier};

/// A replay that did not succeed during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOperation {
  pub id: String,
  pub kind: String,
  pub attempts: u32,
  pub error: String,
  /// Dead-lettered: will not be retried by later drains
  pub terminal: bool,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub succeeded: Vec<String>,
  pub failed: Vec<FailedOperation>,
  /// Left untouched because an earlier same-kind record could not be sent
  pub deferred: Vec<String>,
}

impl DrainReport {
  fn merge(&mut self, other: DrainReport) {
    self.succeeded.extend(other.succeeded);
    self.failed.extend(other.failed);
    self.deferred.extend(other.deferred);
  }

  pub fn is_empty(&self) -> bool {
    self.succeeded.is_empty() && self.failed.is_empty() && self.deferred.is_empty()
  }
}

/// Result of [`WriteQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Submission {
  /// The server confirmed it on the first try
  Sent,
  /// Connectivity failed; stored for replay
  Queued,
}

pub struct WriteQueue {
  store: QueueStore,
  replayer: Arc<dyn Replayer>,
  notifier: Arc<dyn Notifier>,
  /// `None` retries forever
  max_attempts: Option<u32>,
  /// Serializes drains so two reconnect signals don't replay the same record
  drain_lock: Mutex<()>,
}

impl WriteQueue {
  pub fn new(store: QueueStore, replayer: Arc<dyn Replayer>, notifier: Arc<dyn Notifier>) -> Self {
    Self {
      store,
      replayer,
      notifier,
      max_attempts: None,
      drain_lock: Mutex::new(()),
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
    self.max_attempts = max_attempts.filter(|n| *n > 0);
    self
  }

  /// Persist an operation for later replay. Never touches the network.
  ///
  /// Returns false if a record with this id is already queued.
  pub fn enqueue(&self, op: PendingOperation) -> Result<bool, StoreError> {
    let inserted = self.store.insert(&op)?;
    if inserted {
      info!(id = %op.id, kind = %op.kind, "queued operation for replay");
    } else {
      debug!(id = %op.id, "operation already queued");
    }
    Ok(inserted)
  }

  /// Send a mutation now, queueing it if connectivity fails.
  ///
  /// Server rejections are returned to the caller and never queued.
  pub async fn submit(&self, op: PendingOperation) -> Result<Submission, SubmitError> {
    match self.replayer.replay(&op).await {
      Ok(()) => Ok(Submission::Sent),
      Err(FetchError::Network(reason)) => {
        debug!(id = %op.id, %reason, "submit failed on network, queueing");
        self.enqueue(op)?;
        Ok(Submission::Queued)
      }
      Err(rejected) => Err(SubmitError::Rejected(rejected)),
    }
  }

  /// Number of records waiting for replay.
  pub fn size(&self) -> Result<usize, StoreError> {
    self.store.count(OperationState::Pending)
  }

  pub fn pending(&self) -> Result<Vec<PendingOperation>, StoreError> {
    self.store.list(OperationState::Pending, None)
  }

  pub fn dead_letters(&self) -> Result<Vec<PendingOperation>, StoreError> {
    self.store.list(OperationState::Dead, None)
  }

  /// Put a dead-lettered record back in line for the next drain.
  pub fn retry_dead(&self, id: &str) -> Result<bool, StoreError> {
    let revived = self.store.revive(id)?;
    if revived {
      info!(%id, "dead-lettered operation re-queued");
    }
    Ok(revived)
  }

  /// Replay pending records, optionally only those of `kinds`.
  pub async fn drain(&self, kinds: Option<&[String]>) -> Result<DrainReport, StoreError> {
    let _guard = self.drain_lock.lock().await;

    let ops = self.store.list(OperationState::Pending, kinds)?;
    if ops.is_empty() {
      return Ok(DrainReport::default());
    }

    let mut lanes: BTreeMap<String, Vec<PendingOperation>> = BTreeMap::new();
    for op in ops {
      lanes.entry(op.kind.clone()).or_default().push(op);
    }
    debug!(kinds = lanes.len(), "draining write queue");

    let results = join_all(lanes.into_values().map(|ops| self.drain_lane(ops))).await;

    let mut report = DrainReport::default();
    for result in results {
      report.merge(result?);
    }
    info!(
      succeeded = report.succeeded.len(),
      failed = report.failed.len(),
      deferred = report.deferred.len(),
      "drain finished"
    );
    Ok(report)
  }

  /// Replay one kind's records strictly in order. A network failure stops
  /// the lane so later records never overtake earlier ones.
  async fn drain_lane(&self, ops: Vec<PendingOperation>) -> Result<DrainReport, StoreError> {
    let mut report = DrainReport::default();
    let mut ops = ops.into_iter();

    while let Some(op) = ops.next() {
      let Some(attempts) = self.store.record_attempt(&op.id)? else {
        // Removed or dead-lettered since the drain listed it
        continue;
      };

      match self.replayer.replay(&op).await {
        Ok(()) => {
          if self.store.remove(&op.id)? {
            self
              .notifier
              .show(NotificationIntent::sync_succeeded(&op.kind, &op.id));
          }
          info!(id = %op.id, kind = %op.kind, attempts, "replayed queued operation");
          report.succeeded.push(op.id);
        }
        Err(FetchError::Network(reason)) => {
          let terminal = self.max_attempts.is_some_and(|max| attempts >= max);
          if terminal {
            let error = format!("gave up after {} attempts: {}", attempts, reason);
            self.dead_letter(&op, &error)?;
            report.failed.push(failed(&op, attempts, error, true));
          } else {
            self.store.set_error(&op.id, &reason)?;
            debug!(id = %op.id, attempts, %reason, "replay failed, keeping for next drain");
            report.failed.push(failed(&op, attempts, reason, false));
          }
          report.deferred.extend(ops.by_ref().map(|rest| rest.id));
          break;
        }
        Err(rejected) => {
          let error = rejected.to_string();
          self.dead_letter(&op, &error)?;
          report.failed.push(failed(&op, attempts, error, true));
        }
      }
    }

    Ok(report)
  }

  fn dead_letter(&self, op: &PendingOperation, error: &str) -> Result<(), StoreError> {
    if self.store.mark_dead(&op.id, error)? {
      warn!(id = %op.id, kind = %op.kind, %error, "operation dead-lettered");
      self
        .notifier
        .show(NotificationIntent::sync_failed(&op.kind, &op.id, error));
    }
    Ok(())
  }

  /// Drain everything on a fixed schedule until the task is aborted.
  pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if let Err(e) = self.drain(None).await {
          warn!(error = %e, "periodic drain failed");
        }
      }
    })
  }
}

fn failed(op: &PendingOperation, attempts: u32, error: String, terminal: bool) -> FailedOperation {
  FailedOperation {
    id: op.id.clone(),
    kind: op.kind.clone(),
    attempts,
    error,
    terminal,
  }
}
