//! Resource classification: which strategy and partition serve a request.

use url::Url;

use crate::cache::PartitionKind;
use crate::http::{Destination, Request};

/// Caching strategy applied to a read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// The category a request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  Api,
  Image,
  Static,
  Navigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
  pub strategy: Strategy,
  pub partition: PartitionKind,
  pub resource: ResourceClass,
}

/// Pure, deterministic request classifier.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  api_prefix: String,
}

impl Classifier {
  pub fn new(origin: Url, api_prefix: impl Into<String>) -> Self {
    Self {
      origin,
      api_prefix: api_prefix.into(),
    }
  }

  /// Returns `None` for non-GET requests, which bypass the cache entirely.
  /// Every GET request classifies to exactly one strategy; first rule wins.
  pub fn classify(&self, request: &Request) -> Option<Classification> {
    if !request.is_get() {
      return None;
    }

    let (strategy, partition, resource) = if self.is_api(request) {
      (Strategy::NetworkFirst, PartitionKind::Dynamic, ResourceClass::Api)
    } else {
      match request.destination {
        Destination::Image => (Strategy::CacheFirst, PartitionKind::Images, ResourceClass::Image),
        Destination::Script | Destination::Style | Destination::Font => {
          (Strategy::CacheFirst, PartitionKind::Static, ResourceClass::Static)
        }
        Destination::Document | Destination::Empty => (
          Strategy::StaleWhileRevalidate,
          PartitionKind::Dynamic,
          ResourceClass::Navigation,
        ),
      }
    };

    Some(Classification {
      strategy,
      partition,
      resource,
    })
  }

  fn is_api(&self, request: &Request) -> bool {
    match request.resolve(&self.origin) {
      Ok(url) => url.path().starts_with(&self.api_prefix),
      // Unparseable URLs still classify; match on the raw string
      Err(_) => request.url.starts_with(&self.api_prefix),
    }
  }
}
