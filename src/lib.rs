//! Offline cache and background sync engine.
//!
//! Intercepts outbound requests and serves them from generation-tagged cache
//! partitions or the network depending on the resource class, queues
//! mutations that fail for lack of connectivity and replays them on
//! reconnect, and turns push messages into routed notifications.

pub mod cache;
pub mod classify;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod notify;
pub mod queue;

#[cfg(test)]
mod testing;

pub use engine::{CacheEngine, Collaborators};
pub use event::{EngineEvent, EventBus, EventOutcome};
