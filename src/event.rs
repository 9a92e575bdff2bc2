use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheSource, Served};
use crate::engine::{ActivationReport, CacheEngine, InstallReport};
use crate::http::Request;
use crate::lifecycle::LifecycleState;
use crate::notify::{ClickOutcome, NotificationIntent};
use crate::queue::{DrainReport, Submission};

/// Engine events, as delivered by the host platform
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
  /// Deploy a new generation (defaults to the configured one)
  Install {
    #[serde(default)]
    generation: Option<u32>,
  },
  /// Previous engine instances have stopped handling requests
  Activate,
  /// Outbound request from the application
  Intercept { request: Request },
  /// Mutation from the data layer, queued if the network is down
  Submit {
    id: String,
    kind: String,
    #[serde(default)]
    payload: Value,
  },
  /// Reconnect signal for one queue partition
  Sync { tag: String },
  /// Scheduled drain of every queue partition
  PeriodicSync,
  /// Inbound push message
  Push { payload: String },
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
    intent: NotificationIntent,
  },
  /// Control channel message from the application
  Message { message: ControlMessage },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  AdoptNow,
  GetVersion,
  QueueStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageReply {
  Adopted {
    activation: Option<ActivationReport>,
  },
  Version {
    generation: u32,
    state: Option<LifecycleState>,
    waiting: Option<u32>,
  },
  QueueStatus {
    pending: usize,
    dead: usize,
  },
}

/// What handling an event produced
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventOutcome {
  Response {
    status: u16,
    headers: BTreeMap<String, String>,
    /// Body decoded lossily as UTF-8
    body: String,
    source: CacheSource,
  },
  Installed(InstallReport),
  Activated(Option<ActivationReport>),
  Submitted { submission: Submission },
  Drained(DrainReport),
  Notified(NotificationIntent),
  Clicked(ClickOutcome),
  Reply(MessageReply),
}

impl EventOutcome {
  /// Flatten a served response. Any background refresh keeps running.
  pub fn response(served: Served) -> Self {
    EventOutcome::Response {
      status: served.response.status,
      body: String::from_utf8_lossy(&served.response.body).into_owned(),
      headers: served.response.headers,
      source: served.source,
    }
  }
}

struct Envelope {
  event: EngineEvent,
  reply: Option<oneshot::Sender<Result<EventOutcome>>>,
}

/// Channel into the engine. Each event is handled on its own task, so slow
/// network calls in one never hold up another.
#[derive(Clone)]
pub struct EventBus {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EventBus {
  /// Start routing events to `engine`. The returned task ends once every
  /// bus handle has been dropped.
  pub fn start(engine: Arc<CacheEngine>) -> (Self, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    let handle = tokio::spawn(async move {
      while let Some(envelope) = rx.recv().await {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
          let outcome = engine.dispatch(envelope.event).await;
          if let Some(reply) = envelope.reply {
            // Ignore send errors - the sender may have stopped waiting
            let _ = reply.send(outcome);
          } else if let Err(e) = outcome {
            debug!(error = %e, "posted event failed");
          }
        });
      }
    });

    (Self { tx }, handle)
  }

  /// Deliver an event and wait for its outcome.
  pub async fn send(&self, event: EngineEvent) -> Result<EventOutcome> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope {
        event,
        reply: Some(reply),
      })
      .map_err(|_| eyre!("Engine event loop has stopped"))?;
    rx.await
      .map_err(|_| eyre!("Engine dropped the event without replying"))?
  }

  /// Deliver an event without waiting for it.
  pub fn post(&self, event: EngineEvent) -> Result<()> {
    self
      .tx
      .send(Envelope { event, reply: None })
      .map_err(|_| eyre!("Engine event loop has stopped"))
  }
}
