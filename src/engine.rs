//! The engine: one explicit object owning every component, constructed once
//! at startup and shared by reference with the host bridge.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheLayer, NoopStore, PartitionKind, PartitionName, PartitionStore, RequestKey, Served,
  SqliteStore,
};
use crate::classify::Classifier;
use crate::config::Config;
use crate::db::Database;
use crate::error::{FetchError, InstallError, StoreError, SubmitError};
use crate::event::{ControlMessage, EngineEvent, EventOutcome, MessageReply};
use crate::http::{Destination, Fetcher, Request};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::notify::{
  ClickOutcome, ClientWindows, NotificationIntent, Notifier, PushDefaults, PushDispatcher,
};
use crate::queue::{
  DrainReport, HttpReplayer, PendingOperation, QueueStore, Replayer, Submission, WriteQueue,
};

const ACTIVE_GENERATION_KEY: &str = "active_generation";

/// Platform-provided collaborators the engine talks through.
pub struct Collaborators {
  pub fetcher: Arc<dyn Fetcher>,
  /// Defaults to an [`HttpReplayer`] over `fetcher`
  pub replayer: Option<Arc<dyn Replayer>>,
  pub notifier: Arc<dyn Notifier>,
  pub windows: Arc<dyn ClientWindows>,
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub generation: u32,
  pub assets: usize,
  /// Present when the generation was activated right after installing
  pub activation: Option<ActivationReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
  pub generation: u32,
  pub superseded: Option<u32>,
  /// Partitions reclaimed from older generations
  pub deleted: Vec<String>,
}

pub struct CacheEngine {
  config: Config,
  origin: Url,
  db: Database,
  classifier: Classifier,
  layer: CacheLayer,
  queue: Arc<WriteQueue>,
  push: PushDispatcher,
  lifecycle: Arc<LifecycleController>,
}

impl CacheEngine {
  pub fn new(config: Config, db: Database, parts: Collaborators) -> Result<Self> {
    let origin = config.origin_url()?;

    let store: Arc<dyn PartitionStore> = if config.cache.enabled {
      Arc::new(SqliteStore::new(db.clone()).with_quota(config.cache.quota_bytes))
    } else {
      Arc::new(NoopStore)
    };

    let replayer: Arc<dyn Replayer> = match parts.replayer {
      Some(replayer) => replayer,
      None => Arc::new(HttpReplayer::new(
        Arc::clone(&parts.fetcher),
        config.sync.endpoints.clone(),
        config.api_prefix.clone(),
      )),
    };
    let queue = WriteQueue::new(QueueStore::new(db.clone()), replayer, Arc::clone(&parts.notifier))
      .with_max_attempts(config.sync.max_attempts);

    let push = PushDispatcher::new(
      PushDefaults {
        title: config.push.default_title.clone(),
        icon: config.push.default_icon.clone(),
      },
      origin.clone(),
      config.app_root.clone(),
      parts.notifier,
      parts.windows,
    );

    let lifecycle = Arc::new(match db.get_meta(ACTIVE_GENERATION_KEY)? {
      Some(value) => {
        let generation = value
          .parse()
          .map_err(|e| eyre!("Corrupt active generation '{}': {}", value, e))?;
        debug!(generation, "resuming active generation");
        LifecycleController::resume(generation)
      }
      None => LifecycleController::new(),
    });

    Ok(Self {
      classifier: Classifier::new(origin.clone(), config.api_prefix.clone()),
      layer: CacheLayer::new(store, parts.fetcher).with_lifecycle(Arc::clone(&lifecycle)),
      queue: Arc::new(queue),
      origin,
      push,
      lifecycle,
      config,
      db,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn queue(&self) -> &Arc<WriteQueue> {
    &self.queue
  }

  pub fn push(&self) -> &PushDispatcher {
    &self.push
  }

  pub fn lifecycle(&self) -> &LifecycleController {
    &self.lifecycle
  }

  /// Generation whose partitions serve requests.
  pub fn generation(&self) -> u32 {
    self.lifecycle.active().unwrap_or(self.config.generation)
  }

  fn partition(&self, kind: PartitionKind, generation: u32) -> String {
    PartitionName::new(kind, generation).to_string()
  }

  pub fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
    self.layer.store().list_partitions()
  }

  /// Route one event to the component that handles it.
  pub async fn dispatch(&self, event: EngineEvent) -> Result<EventOutcome> {
    let outcome = match event {
      EngineEvent::Install { generation } => {
        let report = self.install(generation.unwrap_or(self.config.generation)).await?;
        EventOutcome::Installed(report)
      }
      EngineEvent::Activate => EventOutcome::Activated(self.previous_released()?),
      EngineEvent::Intercept { request } => {
        let served = self.intercept(&request).await?;
        EventOutcome::response(served)
      }
      EngineEvent::Submit { id, kind, payload } => {
        let submission = self
          .submit(PendingOperation::new(id, kind, payload))
          .await?;
        EventOutcome::Submitted { submission }
      }
      EngineEvent::Sync { tag } => EventOutcome::Drained(self.sync(&tag).await?),
      EngineEvent::PeriodicSync => EventOutcome::Drained(self.queue.drain(None).await?),
      EngineEvent::Push { payload } => EventOutcome::Notified(self.receive_push(payload.as_bytes())),
      EngineEvent::NotificationClick { action, intent } => {
        EventOutcome::Clicked(self.notification_click(action.as_deref(), &intent))
      }
      EngineEvent::Message { message } => EventOutcome::Reply(self.message(message)?),
    };
    Ok(outcome)
  }

  /// Serve an intercepted request.
  ///
  /// Non-GET requests go straight to the network; queueing them on failure
  /// is the caller's decision (see [`CacheEngine::submit`]).
  pub async fn intercept(&self, request: &Request) -> Result<Served, FetchError> {
    let Some(class) = self.classifier.classify(request) else {
      debug!(url = %request.url, method = %request.method, "passing through");
      return self.layer.fetcher().fetch(request).await.map(Served::from_network);
    };

    let key = match RequestKey::for_request(request, &self.origin) {
      Ok(key) => key,
      Err(e) => {
        warn!(url = %request.url, error = %e, "uncacheable url, passing through");
        return self.layer.fetcher().fetch(request).await.map(Served::from_network);
      }
    };
    let partition = self.partition(class.partition, self.generation());

    self
      .layer
      .serve(class.strategy, request, &key, &partition, class.resource)
      .await
  }

  /// Send a mutation, queueing it if the network is unreachable.
  pub async fn submit(&self, op: PendingOperation) -> Result<Submission, SubmitError> {
    self.queue.submit(op).await
  }

  /// Drain the queue partition named by a reconnect signal tag.
  pub async fn sync(&self, tag: &str) -> Result<DrainReport, StoreError> {
    match self.config.kind_for_tag(tag) {
      Some(kind) => self.queue.drain(Some(&[kind.to_string()])).await,
      None => {
        warn!(%tag, "unknown sync tag, nothing drained");
        Ok(DrainReport::default())
      }
    }
  }

  pub fn receive_push(&self, raw: &[u8]) -> NotificationIntent {
    self.push.receive(raw)
  }

  pub fn notification_click(&self, action: Option<&str>, intent: &NotificationIntent) -> ClickOutcome {
    self.push.click(action, intent)
  }

  /// Install `generation`: seed its static partition from the precache
  /// manifest, all or nothing, then activate it if nothing stands in the way.
  pub async fn install(&self, generation: u32) -> Result<InstallReport, InstallError> {
    self.lifecycle.begin_install(generation)?;

    let assets = match self.seed(generation).await {
      Ok(assets) => assets,
      Err(e) => {
        warn!(generation, error = %e, "install aborted");
        let partial = self.partition(PartitionKind::Static, generation);
        if let Err(cleanup) = self.layer.store().delete_partition(&partial) {
          warn!(partition = %partial, error = %cleanup, "failed to discard partial install");
        }
        self.lifecycle.abort_install(generation);
        return Err(e);
      }
    };
    self.lifecycle.finish_install(generation);

    let activation = if self.lifecycle.may_activate(false) {
      self.activate(generation)?
    } else {
      None
    };

    Ok(InstallReport {
      generation,
      assets,
      activation,
    })
  }

  async fn seed(&self, generation: u32) -> Result<usize, InstallError> {
    let fetcher = self.layer.fetcher();
    let fetches = self.config.precache.iter().map(|url| async move {
      let request = Request::get(url.clone()).with_destination(Destination::Document);
      let response = fetcher
        .fetch(&request)
        .await
        .map_err(|source| InstallError::Asset {
          url: url.clone(),
          source,
        })?;
      if !response.is_success() {
        return Err(InstallError::AssetStatus {
          url: url.clone(),
          status: response.status,
        });
      }
      Ok((request, response))
    });
    let fetched = try_join_all(fetches).await?;

    let partition = self.partition(PartitionKind::Static, generation);
    let store = self.layer.store();
    for (request, response) in &fetched {
      let key = RequestKey::for_request(request, &self.origin).map_err(|e| {
        InstallError::Store(StoreError::InvalidRecord(format!("{}: {}", request.url, e)))
      })?;
      store.put(&partition, &key, response)?;
    }

    info!(generation, assets = fetched.len(), "precache seeded");
    Ok(fetched.len())
  }

  /// Activate a waiting generation and reclaim every managed partition
  /// tagged with another version, including non-canonical names such as
  /// `static-v01`. Unmanaged partitions are left alone.
  ///
  /// Returns `None` if `generation` has not finished installing.
  pub fn activate(&self, generation: u32) -> Result<Option<ActivationReport>, StoreError> {
    let Some(superseded) = self.lifecycle.activate(generation) else {
      return Ok(None);
    };
    self
      .db
      .set_meta(ACTIVE_GENERATION_KEY, &generation.to_string())?;

    let mut deleted = Vec::new();
    let store = self.layer.store();
    for name in store.list_partitions()? {
      let stale = PartitionName::is_managed(&name)
        && PartitionName::parse(&name).map_or(true, |p| p.generation != generation);
      if stale && store.delete_partition(&name)? {
        deleted.push(name);
      }
    }
    info!(generation, ?deleted, "old partitions reclaimed");

    Ok(Some(ActivationReport {
      generation,
      superseded,
      deleted,
    }))
  }

  /// Host signal: all previous engine instances stopped handling requests.
  pub fn previous_released(&self) -> Result<Option<ActivationReport>, StoreError> {
    match self.lifecycle.waiting() {
      Some(generation) if self.lifecycle.may_activate(true) => self.activate(generation),
      _ => Ok(None),
    }
  }

  /// Answer a control message from the application.
  pub fn message(&self, message: ControlMessage) -> Result<MessageReply, StoreError> {
    match message {
      ControlMessage::AdoptNow => {
        let activation = match self.lifecycle.request_adoption() {
          Some(generation) => self.activate(generation)?,
          None => None,
        };
        Ok(MessageReply::Adopted { activation })
      }
      ControlMessage::GetVersion => {
        let generation = self.generation();
        Ok(MessageReply::Version {
          generation,
          state: self.lifecycle.state(generation),
          waiting: self.lifecycle.waiting(),
        })
      }
      ControlMessage::QueueStatus => Ok(MessageReply::QueueStatus {
        pending: self.queue.size()?,
        dead: self.queue.dead_letters()?.len(),
      }),
    }
  }

  pub fn state(&self) -> Option<LifecycleState> {
    self.lifecycle.state(self.generation())
  }
}
