//! Cursor values and their persistence.

use std::cmp::Ordering;
use std::fmt;

use fuschia_host_kv::KvStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dedupe::{EmissionRecord, RecentKeys};
use crate::delivery::{PollBacklog, PushRegistration};
use crate::error::{CursorError, RunError};

/// Position marker of a source within its upstream stream.
///
/// Cursors of the same kind are totally ordered. Cursors of different kinds
/// are incomparable (`partial_cmp` returns `None`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
  /// Unix timestamp in milliseconds.
  Timestamp(u64),
  /// Monotonically increasing numeric ID.
  Sequence(u64),
  /// Provider token, ordered lexicographically.
  Token(String),
}

impl Cursor {
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Timestamp(_) => "timestamp",
      Self::Sequence(_) => "sequence",
      Self::Token(_) => "token",
    }
  }

  /// Compare two cursors, failing if their kinds differ.
  pub fn try_cmp(&self, other: &Cursor) -> Result<Ordering, CursorError> {
    self
      .partial_cmp(other)
      .ok_or_else(|| CursorError::KindMismatch {
        expected: other.kind(),
        found: self.kind(),
      })
  }

  /// Whether `self` is strictly after `other`. Incomparable cursors are never after.
  pub fn is_after(&self, other: &Cursor) -> bool {
    matches!(self.partial_cmp(other), Some(Ordering::Greater))
  }
}

impl PartialOrd for Cursor {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    match (self, other) {
      (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
      (Self::Sequence(a), Self::Sequence(b)) => Some(a.cmp(b)),
      (Self::Token(a), Self::Token(b)) => Some(a.cmp(b)),
      _ => None,
    }
  }
}

impl fmt::Display for Cursor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Timestamp(ms) => write!(f, "timestamp:{ms}"),
      Self::Sequence(n) => write!(f, "sequence:{n}"),
      Self::Token(token) => write!(f, "token:{token}"),
    }
  }
}

/// Outcome of [`CursorStore::write_cursor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorWrite {
  /// The cursor moved forward (or was written for the first time).
  Advanced,
  /// The new value equals the stored one; nothing was written.
  Unchanged,
  /// The new value is behind the stored one and was ignored.
  Rejected { current: Cursor },
}

/// Per-source persistent state on top of a [`KvStore`].
///
/// Keys are namespaced as `{source_id}:{name}` so many sources can share one
/// backend without seeing each other's state.
pub struct CursorStore<K: KvStore> {
  kv: K,
  source_id: String,
}

impl<K: KvStore> CursorStore<K> {
  pub fn new(kv: K, source_id: impl Into<String>) -> Self {
    Self {
      kv,
      source_id: source_id.into(),
    }
  }

  pub fn source_id(&self) -> &str {
    &self.source_id
  }

  fn key(&self, name: &str) -> String {
    format!("{}:{}", self.source_id, name)
  }

  async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, RunError> {
    let key = self.key(name);
    let Some(raw) = self.kv.get(&key).await? else {
      return Ok(None);
    };
    let value = serde_json::from_str(&raw).map_err(|e| CursorError::Corrupt {
      key,
      message: e.to_string(),
    })?;
    Ok(Some(value))
  }

  async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), RunError> {
    let key = self.key(name);
    let raw = serde_json::to_string(value).map_err(|e| CursorError::Corrupt {
      key: key.clone(),
      message: e.to_string(),
    })?;
    self.kv.set(&key, raw).await?;
    Ok(())
  }

  /// Read the resume cursor. `None` on the first run.
  pub async fn read_cursor(&self) -> Result<Option<Cursor>, RunError> {
    self.read_json("cursor").await
  }

  /// Persist a new cursor, refusing to move backwards.
  pub async fn write_cursor(&self, cursor: &Cursor) -> Result<CursorWrite, RunError> {
    if let Some(current) = self.read_cursor().await? {
      match cursor.try_cmp(&current)? {
        Ordering::Less => {
          warn!(
            source_id = %self.source_id,
            current = %current,
            rejected = %cursor,
            "ignoring cursor regression"
          );
          return Ok(CursorWrite::Rejected { current });
        }
        Ordering::Equal => return Ok(CursorWrite::Unchanged),
        Ordering::Greater => {}
      }
    }

    self.write_json("cursor", cursor).await?;
    debug!(source_id = %self.source_id, cursor = %cursor, "cursor advanced");
    Ok(CursorWrite::Advanced)
  }

  /// Load the recently emitted keys, bounded to `capacity`.
  pub async fn read_recent_keys(&self, capacity: usize) -> Result<RecentKeys, RunError> {
    let records: Vec<EmissionRecord> = self.read_json("emitted").await?.unwrap_or_default();
    Ok(RecentKeys::from_records(records, capacity))
  }

  pub async fn write_recent_keys(&self, recent: &RecentKeys) -> Result<(), RunError> {
    self.write_json("emitted", &recent.records()).await
  }

  pub async fn read_push(&self) -> Result<Option<PushRegistration>, RunError> {
    self.read_json("push").await
  }

  pub async fn write_push(&self, registration: &PushRegistration) -> Result<(), RunError> {
    self.write_json("push", registration).await
  }

  pub async fn clear_push(&self) -> Result<(), RunError> {
    self.kv.delete(&self.key("push")).await?;
    Ok(())
  }

  /// The unfinished polling walk, if the page cap cut the last one short.
  pub async fn read_backlog(&self) -> Result<Option<PollBacklog>, RunError> {
    self.read_json("backlog").await
  }

  pub async fn write_backlog(&self, backlog: &PollBacklog) -> Result<(), RunError> {
    self.write_json("backlog", backlog).await
  }

  pub async fn clear_backlog(&self) -> Result<(), RunError> {
    self.kv.delete(&self.key("backlog")).await?;
    Ok(())
  }

  /// Forget the cursor, emitted keys and any unfinished walk. The next run
  /// is a first run again.
  pub async fn reset(&self) -> Result<(), RunError> {
    self.kv.delete(&self.key("cursor")).await?;
    self.kv.delete(&self.key("emitted")).await?;
    self.kv.delete(&self.key("backlog")).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use fuschia_host_kv::InMemoryKvStore;

  use super::*;

  #[test]
  fn test_cursor_ordering() {
    assert!(Cursor::Timestamp(1100) > Cursor::Timestamp(1050));
    assert!(Cursor::Sequence(2) > Cursor::Sequence(1));
    assert!(Cursor::Token("b".into()) > Cursor::Token("a".into()));
    assert_eq!(Cursor::Timestamp(1).partial_cmp(&Cursor::Sequence(1)), None);
    assert!(!Cursor::Timestamp(5).is_after(&Cursor::Sequence(1)));
    assert!(Cursor::Timestamp(1).try_cmp(&Cursor::Token("1".into())).is_err());
  }

  #[test]
  fn test_cursor_serialization() {
    let json = serde_json::to_string(&Cursor::Timestamp(1100)).unwrap();
    assert_eq!(json, r#"{"kind":"timestamp","value":1100}"#);

    let parsed: Cursor = serde_json::from_str(r#"{"kind":"token","value":"abc"}"#).unwrap();
    assert_eq!(parsed, Cursor::Token("abc".to_string()));
  }

  #[tokio::test]
  async fn test_write_cursor_is_monotonic() {
    let store = CursorStore::new(InMemoryKvStore::new(), "src");

    assert_eq!(store.read_cursor().await.unwrap(), None);

    let write = store.write_cursor(&Cursor::Timestamp(1000)).await.unwrap();
    assert_eq!(write, CursorWrite::Advanced);

    let write = store.write_cursor(&Cursor::Timestamp(1000)).await.unwrap();
    assert_eq!(write, CursorWrite::Unchanged);

    let write = store.write_cursor(&Cursor::Timestamp(900)).await.unwrap();
    assert_eq!(
      write,
      CursorWrite::Rejected {
        current: Cursor::Timestamp(1000)
      }
    );
    assert_eq!(
      store.read_cursor().await.unwrap(),
      Some(Cursor::Timestamp(1000))
    );

    let result = store.write_cursor(&Cursor::Sequence(5)).await;
    assert!(matches!(result, Err(RunError::Cursor(_))));
  }

  #[tokio::test]
  async fn test_state_is_scoped_per_source() {
    let kv = InMemoryKvStore::new();
    let a = CursorStore::new(kv.clone(), "a");
    let b = CursorStore::new(kv.clone(), "b");

    a.write_cursor(&Cursor::Timestamp(10)).await.unwrap();

    assert_eq!(b.read_cursor().await.unwrap(), None);
    assert_eq!(kv.get("a:cursor").await.unwrap().as_deref(), Some(r#"{"kind":"timestamp","value":10}"#));
  }

  #[tokio::test]
  async fn test_corrupt_cursor_is_reported() {
    let kv = InMemoryKvStore::new();
    kv.set("src:cursor", "not json".to_string()).await.unwrap();
    let store = CursorStore::new(kv, "src");

    let result = store.read_cursor().await;
    assert!(matches!(
      result,
      Err(RunError::Cursor(CursorError::Corrupt { .. }))
    ));
  }

  #[tokio::test]
  async fn test_reset_clears_cursor_and_keys() {
    let store = CursorStore::new(InMemoryKvStore::new(), "src");
    store.write_cursor(&Cursor::Sequence(3)).await.unwrap();
    store
      .write_backlog(&PollBacklog {
        page_token: "p2".to_string(),
        floor: Some(Cursor::Sequence(3)),
        high_water: None,
      })
      .await
      .unwrap();

    store.reset().await.unwrap();

    assert_eq!(store.read_cursor().await.unwrap(), None);
    assert!(store.read_recent_keys(10).await.unwrap().is_empty());
    assert_eq!(store.read_backlog().await.unwrap(), None);
  }
}
