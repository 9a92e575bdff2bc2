//! Cache layer that orchestrates the caching strategies with network fetching.

use std::sync::Arc;
use tracing::{debug, warn};

use super::key::{PartitionName, RequestKey};
use super::served::{Refresh, Served};
use super::storage::{CachedResponse, PartitionStore};
use crate::classify::{ResourceClass, Strategy};
use crate::error::FetchError;
use crate::http::{Fetcher, Request, Response};
use crate::lifecycle::LifecycleController;

/// Message carried by the offline error body.
const OFFLINE_MESSAGE: &str = "You are offline and this data has not been cached yet.";

/// Cache layer that applies a strategy to a single request.
///
/// The layer never imposes timeouts: strategies only define the order in
/// which cache and network are consulted. Storage failures are logged and
/// treated as a miss or a skipped write.
pub struct CacheLayer {
  store: Arc<dyn PartitionStore>,
  fetcher: Arc<dyn Fetcher>,
  /// When set, writes to a managed partition of a non-active generation are
  /// dropped
  lifecycle: Option<Arc<LifecycleController>>,
}

impl CacheLayer {
  pub fn new(store: Arc<dyn PartitionStore>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      store,
      fetcher,
      lifecycle: None,
    }
  }

  pub fn with_lifecycle(mut self, lifecycle: Arc<LifecycleController>) -> Self {
    self.lifecycle = Some(lifecycle);
    self
  }

  pub fn store(&self) -> &Arc<dyn PartitionStore> {
    &self.store
  }

  pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
    &self.fetcher
  }

  /// Serve `request` from `partition` using `strategy`.
  ///
  /// Only CacheFirst on a non-image miss can fail; every other path resolves
  /// to a response.
  pub async fn serve(
    &self,
    strategy: Strategy,
    request: &Request,
    key: &RequestKey,
    partition: &str,
    resource: ResourceClass,
  ) -> Result<Served, FetchError> {
    match strategy {
      Strategy::CacheFirst => self.cache_first(request, key, partition, resource).await,
      Strategy::NetworkFirst => Ok(self.network_first(request, key, partition).await),
      Strategy::StaleWhileRevalidate => Ok(self.stale_while_revalidate(request, key, partition).await),
    }
  }

  /// Cache-first with refresh-ahead.
  ///
  /// 1. Hit: return immediately, refresh the entry in the background
  /// 2. Miss: fetch, store on success
  /// 3. Miss and network failure: placeholder for images, error otherwise
  pub async fn cache_first(
    &self,
    request: &Request,
    key: &RequestKey,
    partition: &str,
    resource: ResourceClass,
  ) -> Result<Served, FetchError> {
    if let Some(cached) = self.lookup(partition, key) {
      debug!(url = key.url(), partition, "cache-first hit");
      let refresh = self.spawn_refresh(request, key, partition);
      return Ok(Served::from_cache(cached.response, cached.stored_at).with_background(refresh));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.writer().put(partition, key, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(e) if resource == ResourceClass::Image => {
        debug!(url = key.url(), error = %e, "image unavailable, serving placeholder");
        Ok(Served::synthesized(Response::image_placeholder()))
      }
      Err(e) => Err(e),
    }
  }

  /// Network-first with cache fallback.
  ///
  /// 1. Fetch; on any answer store it (if 2xx) and return it
  /// 2. Network failure: return the cached entry if any
  /// 3. Otherwise return the structured offline error body
  pub async fn network_first(&self, request: &Request, key: &RequestKey, partition: &str) -> Served {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.writer().put(partition, key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = key.url(), error = %e, "network-first fetch failed, trying cache");
        self.offline_fallback(partition, key)
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// The network fetch always starts. A cached candidate is returned at once;
  /// on a cold cache the network result is awaited instead, falling back as
  /// network-first does.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    key: &RequestKey,
    partition: &str,
  ) -> Served {
    let candidate = self.lookup(partition, key);
    let refresh = self.spawn_refresh(request, key, partition);

    if let Some(cached) = candidate {
      debug!(url = key.url(), partition, "serving stale while revalidating");
      return Served::from_cache(cached.response, cached.stored_at).with_background(refresh);
    }

    match refresh.wait().await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(url = key.url(), error = %e, "revalidation failed on cold cache");
        self.offline_fallback(partition, key)
      }
    }
  }

  fn offline_fallback(&self, partition: &str, key: &RequestKey) -> Served {
    match self.lookup(partition, key) {
      Some(cached) => Served::offline(cached.response, cached.stored_at),
      None => Served::synthesized(Response::offline(OFFLINE_MESSAGE)),
    }
  }

  /// Read one entry, treating storage errors as a miss.
  fn lookup(&self, partition: &str, key: &RequestKey) -> Option<CachedResponse> {
    match self.store.get(partition, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(partition, url = key.url(), error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  fn writer(&self) -> Writer {
    Writer {
      store: Arc::clone(&self.store),
      lifecycle: self.lifecycle.clone(),
    }
  }

  /// Start a detached fetch whose only side effect is a store write.
  fn spawn_refresh(&self, request: &Request, key: &RequestKey, partition: &str) -> Refresh {
    let writer = self.writer();
    let fetcher = Arc::clone(&self.fetcher);
    let request = request.clone();
    let key = key.clone();
    let partition = partition.to_string();

    Refresh::new(tokio::spawn(async move {
      let result = fetcher.fetch(&request).await;
      match &result {
        Ok(response) if response.is_success() => {
          writer.put(&partition, &key, response);
        }
        Ok(response) => {
          debug!(url = key.url(), status = response.status, "refresh answered non-2xx, not stored");
        }
        Err(e) => {
          debug!(url = key.url(), error = %e, "background refresh failed");
        }
      }
      result
    }))
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      fetcher: Arc::clone(&self.fetcher),
      lifecycle: self.lifecycle.clone(),
    }
  }
}

/// Store handle used for response writes, which may land after the fetch
/// that produced them has outlived its generation.
struct Writer {
  store: Arc<dyn PartitionStore>,
  lifecycle: Option<Arc<LifecycleController>>,
}

impl Writer {
  /// Write an entry; failures are logged and otherwise ignored.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) {
    let write = || self.store.put(partition, key, response);
    let managed = PartitionName::parse(partition);

    let result = match (&self.lifecycle, managed) {
      (Some(lifecycle), Some(name)) => match lifecycle.while_current(name.generation, write) {
        Some(result) => result,
        None => {
          debug!(partition, url = key.url(), "generation no longer active, write dropped");
          return;
        }
      },
      _ => write(),
    };

    if let Err(e) = result {
      warn!(partition, url = key.url(), error = %e, "cache write skipped");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStore};
  use crate::db::Database;
  use crate::error::StoreError;
  use crate::testing::{FailingStore, StubFetcher};
  use std::time::Duration;
  use url::Url;

  fn key_for(request: &Request) -> RequestKey {
    RequestKey::for_request(request, &Url::parse("https://shop.example.com").unwrap()).unwrap()
  }

  fn layer(fetcher: &Arc<StubFetcher>) -> (CacheLayer, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
    let layer = CacheLayer::new(store.clone(), fetcher.clone());
    (layer, store)
  }

  #[tokio::test]
  async fn test_cache_first_hit_does_not_wait_for_network() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/static/app.js");
    fetcher.hang(&req.url);
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);
    store.put("static-v1", &key, &Response::new(200, "cached js")).unwrap();

    let served = tokio::time::timeout(
      Duration::from_millis(200),
      layer.cache_first(&req, &key, "static-v1", ResourceClass::Static),
    )
    .await
    .expect("cache hit must not wait on the network")
    .unwrap();

    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"cached js");
    assert!(served.background.is_some());
  }

  #[tokio::test]
  async fn test_cache_first_background_refresh_overwrites_entry() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/static/app.css");
    fetcher.respond(&req.url, Response::new(200, "fresh css"));
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);
    store.put("static-v1", &key, &Response::new(200, "old css")).unwrap();

    let served = layer
      .cache_first(&req, &key, "static-v1", ResourceClass::Static)
      .await
      .unwrap();
    assert_eq!(served.response.body, b"old css");

    served.background.unwrap().wait().await.unwrap();
    let cached = store.get("static-v1", &key).unwrap().unwrap();
    assert_eq!(cached.response.body, b"fresh css");
  }

  #[tokio::test]
  async fn test_cache_first_failed_refresh_keeps_entry() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/fonts/inter.woff2");
    fetcher.fail(&req.url);
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);
    store.put("static-v1", &key, &Response::new(200, "font")).unwrap();

    let served = layer
      .cache_first(&req, &key, "static-v1", ResourceClass::Static)
      .await
      .unwrap();
    assert!(served.background.unwrap().wait().await.is_err());
    assert_eq!(served.response.body, b"font");
    assert_eq!(store.get("static-v1", &key).unwrap().unwrap().response.body, b"font");
  }

  #[tokio::test]
  async fn test_cache_first_miss_stores_network_response() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/static/app.js");
    fetcher.respond(&req.url, Response::new(200, "js"));
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);

    let served = layer
      .cache_first(&req, &key, "static-v1", ResourceClass::Static)
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert!(store.get("static-v1", &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_cache_first_miss_does_not_store_error_status() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/static/missing.js");
    fetcher.respond(&req.url, Response::new(404, "nope"));
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);

    let served = layer
      .cache_first(&req, &key, "static-v1", ResourceClass::Static)
      .await
      .unwrap();
    assert_eq!(served.response.status, 404);
    assert!(store.get("static-v1", &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_image_gets_placeholder() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/img/shoe.jpg");
    fetcher.fail(&req.url);
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);

    let served = layer
      .cache_first(&req, &key, "images-v1", ResourceClass::Image)
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Synthesized);
    assert_eq!(served.response.header("content-type"), Some("image/svg+xml"));
    // Placeholders are never cached
    assert!(store.get("images-v1", &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_script_propagates_error() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/static/app.js");
    fetcher.fail(&req.url);
    let (layer, _store) = layer(&fetcher);
    let key = key_for(&req);

    let err = layer
      .cache_first(&req, &key, "static-v1", ResourceClass::Static)
      .await
      .unwrap_err();
    assert!(err.is_network());
  }

  #[tokio::test]
  async fn test_network_first_success_overwrites_cache() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/api/products");
    fetcher.respond(&req.url, Response::new(200, "[2]"));
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);
    store.put("dynamic-v1", &key, &Response::new(200, "[1]")).unwrap();

    let served = layer.network_first(&req, &key, "dynamic-v1").await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, b"[2]");
    assert_eq!(store.get("dynamic-v1", &key).unwrap().unwrap().response.body, b"[2]");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_prior_entry() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/api/products");
    let (layer, _store) = layer(&fetcher);
    let key = key_for(&req);

    fetcher.respond(&req.url, Response::new(200, "[\"sneaker\"]"));
    layer.network_first(&req, &key, "dynamic-v1").await;

    fetcher.fail(&req.url);
    let served = layer.network_first(&req, &key, "dynamic-v1").await;
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.status, 200);
    assert_eq!(served.response.body, b"[\"sneaker\"]");
  }

  #[tokio::test]
  async fn test_network_first_cold_cache_returns_offline_body() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/api/orders");
    fetcher.fail(&req.url);
    let (layer, _store) = layer(&fetcher);
    let key = key_for(&req);

    let served = layer.network_first(&req, &key, "dynamic-v1").await;
    assert_eq!(served.source, CacheSource::Synthesized);
    assert!(served.response.is_offline_error());
  }

  #[tokio::test]
  async fn test_network_first_returns_server_error_untouched() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/api/products");
    fetcher.respond(&req.url, Response::new(500, "boom"));
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);
    store.put("dynamic-v1", &key, &Response::new(200, "[1]")).unwrap();

    let served = layer.network_first(&req, &key, "dynamic-v1").await;
    assert_eq!(served.response.status, 500);
    assert_eq!(store.get("dynamic-v1", &key).unwrap().unwrap().response.body, b"[1]");
  }

  #[tokio::test]
  async fn test_swr_returns_cached_and_revalidates() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/products");
    fetcher.respond(&req.url, Response::new(200, "<html>new</html>"));
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);
    store.put("dynamic-v1", &key, &Response::new(200, "<html>old</html>")).unwrap();

    let served = layer.stale_while_revalidate(&req, &key, "dynamic-v1").await;
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"<html>old</html>");

    served.background.unwrap().wait().await.unwrap();
    assert_eq!(
      store.get("dynamic-v1", &key).unwrap().unwrap().response.body,
      b"<html>new</html>"
    );
  }

  #[tokio::test]
  async fn test_swr_cold_cache_waits_for_network() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/checkout");
    fetcher.respond(&req.url, Response::new(200, "<html/>"));
    let (layer, store) = layer(&fetcher);
    let key = key_for(&req);

    let served = layer.stale_while_revalidate(&req, &key, "dynamic-v1").await;
    assert_eq!(served.source, CacheSource::Network);
    assert!(served.background.is_none());
    assert!(store.get("dynamic-v1", &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_swr_cold_cache_offline_returns_offline_body() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/checkout");
    fetcher.fail(&req.url);
    let (layer, _store) = layer(&fetcher);
    let key = key_for(&req);

    let served = layer.stale_while_revalidate(&req, &key, "dynamic-v1").await;
    assert!(served.response.is_offline_error());
  }

  #[tokio::test]
  async fn test_writes_to_superseded_generation_are_dropped() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/api/products");
    fetcher.respond(&req.url, Response::new(200, "[]"));
    let lifecycle = Arc::new(LifecycleController::resume(2));
    let (layer, store) = layer(&fetcher);
    let layer = layer.with_lifecycle(lifecycle);
    let key = key_for(&req);

    let served = layer.network_first(&req, &key, "dynamic-v1").await;
    assert_eq!(served.response.body, b"[]");
    assert!(store.list_partitions().unwrap().is_empty());

    layer.network_first(&req, &key, "dynamic-v2").await;
    layer.network_first(&req, &key, "user-downloads").await;
    assert_eq!(store.list_partitions().unwrap(), vec!["dynamic-v2", "user-downloads"]);
  }

  #[tokio::test]
  async fn test_storage_errors_do_not_fail_requests() {
    let fetcher = Arc::new(StubFetcher::new());
    let req = Request::get("/api/products");
    fetcher.respond(&req.url, Response::new(200, "[]"));
    let store = Arc::new(FailingStore::new(|| StoreError::QuotaExceeded { used: 1, quota: 0 }));
    let layer = CacheLayer::new(store, fetcher.clone());
    let key = key_for(&req);

    let served = layer.network_first(&req, &key, "dynamic-v1").await;
    assert_eq!(served.response.body, b"[]");

    fetcher.fail(&req.url);
    let served = layer.network_first(&req, &key, "dynamic-v1").await;
    assert!(served.response.is_offline_error());

    let req = Request::get("/static/app.js");
    fetcher.respond(&req.url, Response::new(200, "js"));
    let served = layer
      .cache_first(&req, &key_for(&req), "static-v1", ResourceClass::Static)
      .await
      .unwrap();
    assert_eq!(served.response.body, b"js");
  }
}
