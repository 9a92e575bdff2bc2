//! SQLite persistence for pending operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use crate::cache::parse_datetime;
use crate::db::Database;
use crate::error::StoreError;

/// Replay state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
  /// Waiting for the next drain
  Pending,
  /// Terminal failure, kept for inspection but never replayed
  Dead,
}

impl OperationState {
  fn as_str(self) -> &'static str {
    match self {
      OperationState::Pending => "pending",
      OperationState::Dead => "dead",
    }
  }

  fn parse(s: &str) -> Result<Self, StoreError> {
    match s {
      "pending" => Ok(OperationState::Pending),
      "dead" => Ok(OperationState::Dead),
      other => Err(StoreError::InvalidRecord(format!("unknown state '{}'", other))),
    }
  }
}

/// A mutating operation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
  /// Caller-supplied idempotency key
  pub id: String,
  /// Operation family, e.g. "order" or "payment"
  pub kind: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub state: OperationState,
  pub last_error: Option<String>,
}

impl PendingOperation {
  pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
    Self {
      id: id.into(),
      kind: kind.into(),
      payload,
      created_at: Utc::now(),
      attempts: 0,
      state: OperationState::Pending,
      last_error: None,
    }
  }
}

const COLUMNS: &str = "id, kind, payload, created_at, attempts, state, last_error";

/// Pending operation store. Every method is a single statement keyed by id.
#[derive(Clone)]
pub struct QueueStore {
  db: Database,
}

impl QueueStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Persist an operation. Returns false when a record with the same id
  /// already exists, in which case the stored record is left unchanged.
  pub fn insert(&self, op: &PendingOperation) -> Result<bool, StoreError> {
    let payload = serde_json::to_string(&op.payload)?;
    let conn = self.db.conn()?;
    let inserted = conn.execute(
      "INSERT OR IGNORE INTO pending_operations (id, kind, payload, created_at, attempts, state)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        op.id,
        op.kind,
        payload,
        op.created_at.to_rfc3339(),
        op.attempts,
        op.state.as_str()
      ],
    )?;
    Ok(inserted > 0)
  }

  pub fn get(&self, id: &str) -> Result<Option<PendingOperation>, StoreError> {
    let conn = self.db.conn()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM pending_operations WHERE id = ?", COLUMNS),
        params![id],
        RawOperation::from_row,
      )
      .optional()?;
    raw.map(RawOperation::into_operation).transpose()
  }

  /// Operations in `state`, in creation order, optionally restricted to kinds.
  pub fn list(
    &self,
    state: OperationState,
    kinds: Option<&[String]>,
  ) -> Result<Vec<PendingOperation>, StoreError> {
    let conn = self.db.conn()?;

    let mut sql = format!(
      "SELECT {} FROM pending_operations WHERE state = ?",
      COLUMNS
    );
    let mut args: Vec<String> = vec![state.as_str().to_string()];
    if let Some(kinds) = kinds {
      if kinds.is_empty() {
        return Ok(Vec::new());
      }
      let placeholders = vec!["?"; kinds.len()].join(", ");
      sql.push_str(&format!(" AND kind IN ({})", placeholders));
      args.extend(kinds.iter().cloned());
    }
    sql.push_str(" ORDER BY seq");

    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
      .query_map(params_from_iter(args.iter()), RawOperation::from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawOperation::into_operation).collect()
  }

  /// Bump the attempt counter of a pending record. Returns the new count,
  /// or `None` if the record is gone or no longer pending.
  pub fn record_attempt(&self, id: &str) -> Result<Option<u32>, StoreError> {
    let conn = self.db.conn()?;
    let attempts = conn
      .query_row(
        "UPDATE pending_operations SET attempts = attempts + 1
         WHERE id = ? AND state = 'pending'
         RETURNING attempts",
        params![id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(attempts)
  }

  pub fn set_error(&self, id: &str, error: &str) -> Result<(), StoreError> {
    let conn = self.db.conn()?;
    conn.execute(
      "UPDATE pending_operations SET last_error = ? WHERE id = ?",
      params![error, id],
    )?;
    Ok(())
  }

  /// Delete a record. Returns whether this call removed it.
  pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
    let conn = self.db.conn()?;
    let removed = conn.execute("DELETE FROM pending_operations WHERE id = ?", params![id])?;
    Ok(removed > 0)
  }

  /// Move a pending record to the dead-letter state.
  pub fn mark_dead(&self, id: &str, error: &str) -> Result<bool, StoreError> {
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE pending_operations SET state = 'dead', last_error = ?
       WHERE id = ? AND state = 'pending'",
      params![error, id],
    )?;
    Ok(updated > 0)
  }

  /// Move a dead record back to pending with a fresh attempt budget. It keeps
  /// its place in creation order.
  pub fn revive(&self, id: &str) -> Result<bool, StoreError> {
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE pending_operations SET state = 'pending', attempts = 0, last_error = NULL
       WHERE id = ? AND state = 'dead'",
      params![id],
    )?;
    Ok(updated > 0)
  }

  pub fn count(&self, state: OperationState) -> Result<usize, StoreError> {
    let conn = self.db.conn()?;
    let n: i64 = conn.query_row(
      "SELECT COUNT(*) FROM pending_operations WHERE state = ?",
      params![state.as_str()],
      |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
  }
}

/// Row as read from SQLite, before JSON and timestamp decoding.
struct RawOperation {
  id: String,
  kind: String,
  payload: String,
  created_at: String,
  attempts: u32,
  state: String,
  last_error: Option<String>,
}

impl RawOperation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      kind: row.get(1)?,
      payload: row.get(2)?,
      created_at: row.get(3)?,
      attempts: row.get(4)?,
      state: row.get(5)?,
      last_error: row.get(6)?,
    })
  }

  fn into_operation(self) -> Result<PendingOperation, StoreError> {
    Ok(PendingOperation {
      payload: serde_json::from_str(&self.payload)?,
      created_at: parse_datetime(&self.created_at)?,
      state: OperationState::parse(&self.state)?,
      id: self.id,
      kind: self.kind,
      attempts: self.attempts,
      last_error: self.last_error,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> QueueStore {
    QueueStore::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_insert_is_keyed_by_id() {
    let store = store();
    assert!(store
      .insert(&PendingOperation::new("order-1", "order", json!({"total": 1})))
      .unwrap());
    assert!(!store
      .insert(&PendingOperation::new("order-1", "order", json!({"total": 2})))
      .unwrap());

    let op = store.get("order-1").unwrap().unwrap();
    assert_eq!(op.payload, json!({"total": 1}));
    assert_eq!(store.count(OperationState::Pending).unwrap(), 1);
  }

  #[test]
  fn test_list_preserves_creation_order_and_filters_kind() {
    let store = store();
    for (id, kind) in [("o1", "order"), ("p1", "payment"), ("o2", "order")] {
      store.insert(&PendingOperation::new(id, kind, json!({}))).unwrap();
    }

    let all: Vec<_> = store
      .list(OperationState::Pending, None)
      .unwrap()
      .into_iter()
      .map(|op| op.id)
      .collect();
    assert_eq!(all, vec!["o1", "p1", "o2"]);

    let orders: Vec<_> = store
      .list(OperationState::Pending, Some(&["order".to_string()]))
      .unwrap()
      .into_iter()
      .map(|op| op.id)
      .collect();
    assert_eq!(orders, vec!["o1", "o2"]);

    assert!(store.list(OperationState::Pending, Some(&[])).unwrap().is_empty());
  }

  #[test]
  fn test_record_attempt_and_remove() {
    let store = store();
    store.insert(&PendingOperation::new("o1", "order", json!({}))).unwrap();

    assert_eq!(store.record_attempt("o1").unwrap(), Some(1));
    assert_eq!(store.record_attempt("o1").unwrap(), Some(2));

    assert!(store.remove("o1").unwrap());
    assert!(!store.remove("o1").unwrap());
    assert_eq!(store.record_attempt("o1").unwrap(), None);
  }

  #[test]
  fn test_dead_letter_and_revive() {
    let store = store();
    store.insert(&PendingOperation::new("p1", "payment", json!({}))).unwrap();
    store.record_attempt("p1").unwrap();

    assert!(store.mark_dead("p1", "declined").unwrap());
    assert_eq!(store.count(OperationState::Pending).unwrap(), 0);
    assert_eq!(store.record_attempt("p1").unwrap(), None);

    let dead = store.list(OperationState::Dead, None).unwrap();
    assert_eq!(dead[0].last_error.as_deref(), Some("declined"));

    assert!(store.revive("p1").unwrap());
    let op = store.get("p1").unwrap().unwrap();
    assert_eq!(op.state, OperationState::Pending);
    assert_eq!(op.attempts, 0);
    assert!(!store.revive("p1").unwrap());
  }
}
