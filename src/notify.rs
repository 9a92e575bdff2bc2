//! Push notification normalization, display and click routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

/// Action id that closes a notification without navigating.
pub const DISMISS_ACTION: &str = "dismiss";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// Displayable form of a push payload or a locally generated alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationIntent {
  pub title: String,
  pub body: String,
  #[serde(default)]
  pub icon: Option<String>,
  /// Notifications sharing a tag replace each other
  #[serde(default)]
  pub tag: Option<String>,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  #[serde(default)]
  pub target_url: Option<String>,
  #[serde(default)]
  pub payload: Value,
}

impl NotificationIntent {
  pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      body: body.into(),
      icon: None,
      tag: None,
      actions: Vec::new(),
      target_url: None,
      payload: Value::Null,
    }
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = Some(tag.into());
    self
  }

  /// Alert raised once a queued operation has been replayed.
  pub fn sync_succeeded(kind: &str, id: &str) -> Self {
    let mut intent = Self::new(
      format!("{} synced", capitalize(kind)),
      format!("Your {} {} was sent now that you are back online.", kind, id),
    )
    .with_tag(format!("{}-sync-{}", kind, id));
    intent.payload = serde_json::json!({ "id": id, "kind": kind, "status": "synced" });
    intent
  }

  /// Alert raised when a queued operation will not be replayed again.
  pub fn sync_failed(kind: &str, id: &str, reason: &str) -> Self {
    let mut intent = Self::new(
      format!("{} could not be sent", capitalize(kind)),
      format!("Your {} {} failed to sync: {}", kind, id, reason),
    )
    .with_tag(format!("{}-sync-failed-{}", kind, id));
    intent.payload = serde_json::json!({ "id": id, "kind": kind, "status": "failed", "reason": reason });
    intent
  }
}

fn capitalize(s: &str) -> String {
  let mut chars = s.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().chain(chars).collect(),
    None => String::new(),
  }
}

/// Values used when a push payload omits them.
#[derive(Debug, Clone)]
pub struct PushDefaults {
  pub title: String,
  pub icon: Option<String>,
}

/// Wire shape of a structured push payload. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawPush {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  tag: Option<String>,
  actions: Vec<NotificationAction>,
  url: Option<String>,
  target_url: Option<String>,
  data: Value,
}

/// Turn a raw push blob into an intent. Never fails: anything that is not a
/// JSON object becomes a plain-text body under the default title.
pub fn normalize(raw: &[u8], defaults: &PushDefaults) -> NotificationIntent {
  let parsed = serde_json::from_slice::<Value>(raw)
    .ok()
    .filter(Value::is_object)
    .and_then(|v| serde_json::from_value::<RawPush>(v).ok());

  let Some(push) = parsed else {
    let text = match serde_json::from_slice::<Value>(raw) {
      Ok(Value::String(s)) => s,
      _ => String::from_utf8_lossy(raw).trim().to_string(),
    };
    debug!("push payload is not structured, using plain text");
    let mut intent = NotificationIntent::new(defaults.title.clone(), text);
    intent.icon = defaults.icon.clone();
    return intent;
  };

  let target_url = push
    .target_url
    .or(push.url)
    .or_else(|| push.data.get("url").and_then(Value::as_str).map(String::from));

  NotificationIntent {
    title: push.title.unwrap_or_else(|| defaults.title.clone()),
    body: push.body.unwrap_or_default(),
    icon: push.icon.or_else(|| defaults.icon.clone()),
    tag: push.tag,
    actions: push.actions,
    target_url,
    payload: push.data,
  }
}

/// Where a notification interaction leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "url", rename_all = "snake_case")]
pub enum Route {
  /// Explicit dismissal: no navigation
  NoOp,
  Navigate(String),
}

/// Resolve the navigation target for a click on `intent`.
pub fn route(action: Option<&str>, intent: &NotificationIntent, app_root: &str) -> Route {
  if action == Some(DISMISS_ACTION) {
    return Route::NoOp;
  }
  Route::Navigate(
    intent
      .target_url
      .clone()
      .unwrap_or_else(|| app_root.to_string()),
  )
}

/// Platform surface that displays notifications.
pub trait Notifier: Send + Sync {
  /// Show an intent, replacing any displayed notification with the same tag.
  fn show(&self, intent: NotificationIntent);

  /// Close the notification with `tag`. Returns whether one was shown.
  fn close(&self, tag: &str) -> bool;

  /// Currently displayed notifications, oldest first.
  fn displayed(&self) -> Vec<NotificationIntent>;
}

/// In-process notification tray.
#[derive(Default)]
pub struct NotificationCenter {
  shown: Mutex<Vec<NotificationIntent>>,
}

impl NotificationCenter {
  pub fn new() -> Self {
    Self::default()
  }

  fn shown(&self) -> MutexGuard<'_, Vec<NotificationIntent>> {
    // A panic mid-update leaves a Vec that is still valid to read
    self.shown.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl Notifier for NotificationCenter {
  fn show(&self, intent: NotificationIntent) {
    let mut shown = self.shown();
    if let Some(tag) = &intent.tag {
      shown.retain(|n| n.tag.as_ref() != Some(tag));
    }
    info!(title = %intent.title, tag = ?intent.tag, "showing notification");
    shown.push(intent);
  }

  fn close(&self, tag: &str) -> bool {
    let mut shown = self.shown();
    let before = shown.len();
    shown.retain(|n| n.tag.as_deref() != Some(tag));
    shown.len() != before
  }

  fn displayed(&self) -> Vec<NotificationIntent> {
    self.shown().clone()
  }
}

/// An open application view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
  pub id: u64,
  pub url: String,
}

/// Platform surface for the application's open views.
pub trait ClientWindows: Send + Sync {
  fn list(&self) -> Vec<WindowInfo>;
  fn focus(&self, id: u64) -> bool;
  /// Open a new view at `url`. Returns its id if the platform allowed it.
  fn open(&self, url: &str) -> Option<u64>;
}

/// In-process registry of open views.
#[derive(Default)]
pub struct WindowRegistry {
  windows: Mutex<Vec<WindowInfo>>,
  focused: Mutex<Option<u64>>,
  next_id: AtomicU64,
}

impl WindowRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn focused(&self) -> Option<u64> {
    *self.focused.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl ClientWindows for WindowRegistry {
  fn list(&self) -> Vec<WindowInfo> {
    self.windows.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn focus(&self, id: u64) -> bool {
    let exists = self.list().iter().any(|w| w.id == id);
    if exists {
      *self.focused.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }
    exists
  }

  fn open(&self, url: &str) -> Option<u64> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    self
      .windows
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(WindowInfo {
        id,
        url: url.to_string(),
      });
    *self.focused.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    Some(id)
  }
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClickOutcome {
  Ignored,
  Focused { id: u64, url: String },
  Opened { id: Option<u64>, url: String },
}

/// Normalizes, displays and routes notifications.
#[derive(Clone)]
pub struct PushDispatcher {
  defaults: PushDefaults,
  origin: Url,
  app_root: String,
  notifier: Arc<dyn Notifier>,
  windows: Arc<dyn ClientWindows>,
}

impl PushDispatcher {
  pub fn new(
    defaults: PushDefaults,
    origin: Url,
    app_root: impl Into<String>,
    notifier: Arc<dyn Notifier>,
    windows: Arc<dyn ClientWindows>,
  ) -> Self {
    Self {
      defaults,
      origin,
      app_root: app_root.into(),
      notifier,
      windows,
    }
  }

  pub fn notifier(&self) -> &Arc<dyn Notifier> {
    &self.notifier
  }

  pub fn normalize(&self, raw: &[u8]) -> NotificationIntent {
    normalize(raw, &self.defaults)
  }

  pub fn display(&self, intent: NotificationIntent) {
    self.notifier.show(intent);
  }

  /// Normalize and display an inbound push message.
  pub fn receive(&self, raw: &[u8]) -> NotificationIntent {
    let intent = self.normalize(raw);
    self.display(intent.clone());
    intent
  }

  pub fn route(&self, action: Option<&str>, intent: &NotificationIntent) -> Route {
    route(action, intent, &self.app_root)
  }

  /// Handle a click: close the notification, then focus a view already at
  /// the target or open a new one.
  pub fn click(&self, action: Option<&str>, intent: &NotificationIntent) -> ClickOutcome {
    if let Some(tag) = &intent.tag {
      self.notifier.close(tag);
    }

    let target = match self.route(action, intent) {
      Route::NoOp => return ClickOutcome::Ignored,
      Route::Navigate(target) => target,
    };
    let resolved = self.absolute(&target);

    let existing = self
      .windows
      .list()
      .into_iter()
      .find(|w| resolved.is_some() && self.absolute(&w.url) == resolved);
    if let Some(window) = existing {
      if self.windows.focus(window.id) {
        debug!(id = window.id, url = %window.url, "focused existing view");
        return ClickOutcome::Focused {
          id: window.id,
          url: window.url,
        };
      }
    }

    let url = resolved.map(String::from).unwrap_or(target);
    let id = self.windows.open(&url);
    if id.is_none() {
      warn!(%url, "platform refused to open a view");
    }
    ClickOutcome::Opened { id, url }
  }

  fn absolute(&self, url: &str) -> Option<Url> {
    self.origin.join(url).ok()
  }
}
