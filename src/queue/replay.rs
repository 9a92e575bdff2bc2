//! Sending queued operations to the server.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::storage::PendingOperation;
use crate::error::FetchError;
use crate::http::{Fetcher, Request};

/// Performs the network call for one operation.
///
/// `Ok` means the server confirmed the operation. `FetchError::Network`
/// leaves it queued; `FetchError::Rejected` is terminal.
#[async_trait]
pub trait Replayer: Send + Sync {
  async fn replay(&self, op: &PendingOperation) -> Result<(), FetchError>;
}

/// Replays operations as JSON POSTs carrying an `Idempotency-Key` header.
pub struct HttpReplayer {
  fetcher: Arc<dyn Fetcher>,
  endpoints: BTreeMap<String, String>,
  api_prefix: String,
}

impl HttpReplayer {
  pub fn new(
    fetcher: Arc<dyn Fetcher>,
    endpoints: BTreeMap<String, String>,
    api_prefix: impl Into<String>,
  ) -> Self {
    Self {
      fetcher,
      endpoints,
      api_prefix: api_prefix.into(),
    }
  }

  /// Configured endpoint for `kind`, else `{api_prefix}{kind}s`.
  pub fn endpoint_for(&self, kind: &str) -> String {
    self
      .endpoints
      .get(kind)
      .cloned()
      .unwrap_or_else(|| format!("{}{}s", self.api_prefix, kind))
  }

  fn build_request(&self, op: &PendingOperation) -> Request {
    let mut request = Request::get(self.endpoint_for(&op.kind)).with_method("POST");
    request
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    request
      .headers
      .insert("idempotency-key".to_string(), op.id.clone());
    request.body = Some(op.payload.to_string().into_bytes());
    request
  }
}

#[async_trait]
impl Replayer for HttpReplayer {
  async fn replay(&self, op: &PendingOperation) -> Result<(), FetchError> {
    let response = self.fetcher.fetch(&self.build_request(op)).await?;
    if response.is_success() {
      Ok(())
    } else {
      Err(FetchError::Rejected {
        status: response.status,
        body: String::from_utf8_lossy(&response.body).into_owned(),
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::StubFetcher;
  use serde_json::json;

  fn replayer(fetcher: Arc<StubFetcher>) -> HttpReplayer {
    let endpoints = BTreeMap::from([("order".to_string(), "/api/orders/checkout".to_string())]);
    HttpReplayer::new(fetcher, endpoints, "/api/")
  }

  #[test]
  fn test_endpoint_resolution() {
    let r = replayer(Arc::new(StubFetcher::new()));
    assert_eq!(r.endpoint_for("order"), "/api/orders/checkout");
    assert_eq!(r.endpoint_for("payment"), "/api/payments");
  }

  #[tokio::test]
  async fn test_replay_posts_payload_with_idempotency_key() {
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.respond("/api/orders/checkout", Response::new(201, "{}"));
    let r = replayer(fetcher.clone());

    let op = PendingOperation::new("order-42", "order", json!({"total": 150000}));
    r.replay(&op).await.unwrap();

    let sent = fetcher.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "POST");
    assert_eq!(sent[0].headers.get("idempotency-key").map(String::as_str), Some("order-42"));
    let body: serde_json::Value = serde_json::from_slice(sent[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(body["total"], 150000);
  }

  #[tokio::test]
  async fn test_error_status_is_rejection_and_transport_failure_is_network() {
    let fetcher = Arc::new(StubFetcher::new());
    let r = replayer(fetcher.clone());
    let op = PendingOperation::new("order-1", "order", json!({}));

    fetcher.respond("/api/orders/checkout", Response::new(422, "invalid cart"));
    assert_eq!(
      r.replay(&op).await.unwrap_err(),
      FetchError::Rejected {
        status: 422,
        body: "invalid cart".to_string()
      }
    );

    fetcher.fail("/api/orders/checkout");
    assert!(r.replay(&op).await.unwrap_err().is_network());
  }
}
