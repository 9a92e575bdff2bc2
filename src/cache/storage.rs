//! Partition store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;

use super::key::RequestKey;
use crate::db::Database;
use crate::error::StoreError;
use crate::http::Response;

/// A response read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was last written
  pub stored_at: DateTime<Utc>,
}

/// Set of named key→response stores.
///
/// Every method touches a single key or a single partition, so callers never
/// hold a read across a suspension point and write it back later.
pub trait PartitionStore: Send + Sync {
  /// Look up a key within one partition.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>, StoreError>;

  /// Store a response, overwriting any prior entry for the key.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError>;

  /// Remove a single entry. Returns whether it existed.
  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool, StoreError>;

  /// Names of all partitions holding at least one entry, sorted.
  fn list_partitions(&self) -> Result<Vec<String>, StoreError>;

  /// Drop a whole partition. Returns whether anything was removed.
  fn delete_partition(&self, partition: &str) -> Result<bool, StoreError>;
}

/// Store that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl PartitionStore for NoopStore {
  fn get(&self, _partition: &str, _key: &RequestKey) -> Result<Option<CachedResponse>, StoreError> {
    Ok(None) // Always miss
  }

  fn put(&self, _partition: &str, _key: &RequestKey, _response: &Response) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn delete(&self, _partition: &str, _key: &RequestKey) -> Result<bool, StoreError> {
    Ok(false)
  }

  fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
    Ok(Vec::new())
  }

  fn delete_partition(&self, _partition: &str) -> Result<bool, StoreError> {
    Ok(false)
  }
}

/// SQLite-based partition store.
pub struct SqliteStore {
  db: Database,
  /// Upper bound on the summed body size of all entries
  quota_bytes: Option<u64>,
}

impl SqliteStore {
  pub fn new(db: Database) -> Self {
    Self {
      db,
      quota_bytes: None,
    }
  }

  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }

  /// Total body bytes currently stored across all partitions.
  pub fn used_bytes(&self) -> Result<u64, StoreError> {
    let conn = self.db.conn()?;
    let used: i64 = conn.query_row(
      "SELECT COALESCE(SUM(length(body)), 0) FROM cache_entries",
      [],
      |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
  }
}

impl PartitionStore for SqliteStore {
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>, StoreError> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![partition, key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    let headers = serde_json::to_string(&response.headers)?;
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    if let Some(quota) = self.quota_bytes {
      // Bytes held by everything except the entry being replaced
      let others: i64 = tx.query_row(
        "SELECT COALESCE(SUM(length(body)), 0) FROM cache_entries
         WHERE NOT (cache_name = ? AND request_key = ?)",
        params![partition, key.as_str()],
        |row| row.get(0),
      )?;
      let used = others.max(0) as u64 + response.body.len() as u64;
      if used > quota {
        return Err(StoreError::QuotaExceeded { used, quota });
      }
    }

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, request_key, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key.as_str(),
        key.url(),
        response.status,
        headers,
        response.body,
        Utc::now().to_rfc3339()
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool, StoreError> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ? AND request_key = ?",
      params![partition, key.as_str()],
    )?;
    Ok(removed > 0)
  }

  fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool, StoreError> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![partition],
    )?;
    Ok(removed > 0)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::InvalidRecord(format!("bad timestamp '{}': {}", s, e)))
}
