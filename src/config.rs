use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin that relative request URLs resolve against
  pub origin: String,
  /// Cache generation this build ships with
  pub generation: u32,
  /// Path prefix of data API requests (network-first)
  pub api_prefix: String,
  /// Navigation target when a notification carries no URL
  pub app_root: String,
  /// Assets seeded into the static partition on install
  pub precache: Vec<String>,
  /// SQLite file (default: $XDG_DATA_HOME/offline-engine/engine.db)
  pub database: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub push: PushConfig,
  pub network: NetworkConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      generation: 1,
      api_prefix: "/api/".to_string(),
      app_root: "/".to_string(),
      precache: vec!["/".to_string(), "/manifest.json".to_string()],
      database: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
      network: NetworkConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, every lookup misses and nothing is stored
  pub enabled: bool,
  /// Upper bound on stored body bytes across all partitions
  pub quota_bytes: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      quota_bytes: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Reconnect signal tag → operation kind it drains
  pub tags: BTreeMap<String, String>,
  /// Operation kind → replay endpoint
  pub endpoints: BTreeMap<String, String>,
  /// Dead-letter after this many attempts (unset: retry forever)
  pub max_attempts: Option<u32>,
  /// Drain everything on this interval while running
  pub periodic_secs: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tags: BTreeMap::from([
        ("sync-orders".to_string(), "order".to_string()),
        ("sync-payments".to_string(), "payment".to_string()),
      ]),
      endpoints: BTreeMap::new(),
      max_attempts: None,
      periodic_secs: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub default_title: String,
  pub default_icon: Option<String>,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      default_title: "Notification".to_string(),
      default_icon: Some("/icons/icon-192x192.png".to_string()),
    }
  }
}

/// Settings for the bundled reqwest fetcher only. Strategies impose no
/// timeouts; a host supplying its own `Fetcher` ignores this section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Give up connecting after this many seconds (unset: no limit)
  pub connect_timeout_secs: Option<u64>,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      connect_timeout_secs: Some(10),
    }
  }
}

impl NetworkConfig {
  pub fn connect_timeout(&self) -> Option<Duration> {
    self.connect_timeout_secs.map(Duration::from_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./offline-engine.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-engine/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-engine.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-engine").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Kind drained by a reconnect signal tag.
  pub fn kind_for_tag(&self, tag: &str) -> Option<&str> {
    self.sync.tags.get(tag).map(String::as_str)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks OFFLINE_ENGINE_API_TOKEN. Optional: requests go out
  /// unauthenticated without it.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFLINE_ENGINE_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
