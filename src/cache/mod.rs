//! Partitioned response cache with offline-aware serving strategies.
//!
//! This module provides:
//! - Named, generation-tagged partitions (`static-vN`, `dynamic-vN`, `images-vN`)
//! - A canonical request identity shared by all partitions
//! - Cache-first, network-first and stale-while-revalidate serving
//! - Detached background refreshes that only ever write to the store

mod key;
mod layer;
mod served;
mod storage;

pub use key::{PartitionKind, PartitionName, RequestKey};
pub use layer::CacheLayer;
pub use served::{CacheSource, Refresh, Served};
pub use storage::{CachedResponse, NoopStore, PartitionStore, SqliteStore};

pub(crate) use storage::parse_datetime;
