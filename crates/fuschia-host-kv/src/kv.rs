use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::KvError;

/// Boxed future returned by [`KvStore`] operations.
pub type KvFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, KvError>> + Send + 'a>>;

/// Trait for source-scoped key-value storage.
///
/// A successful `set` must be visible to every later `get` on the same store,
/// including after a process restart for durable backends.
///
/// This trait is async to support networked backends like Redis.
pub trait KvStore: Send + Sync {
  /// Get a value by key.
  fn get(&self, key: &str) -> KvFuture<'_, Option<String>>;

  /// Set a value.
  fn set(&self, key: &str, value: String) -> KvFuture<'_, ()>;

  /// Delete a value.
  fn delete(&self, key: &str) -> KvFuture<'_, ()>;
}

/// In-memory KV store implementation.
///
/// Clones share the same data. Suitable for tests and single-process use.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKvStore {
  data: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of stored keys.
  pub fn len(&self) -> usize {
    self.lock().map(|data| data.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, KvError> {
    self
      .data
      .lock()
      .map_err(|_| KvError::backend("in-memory store lock poisoned"))
  }
}

impl KvStore for InMemoryKvStore {
  fn get(&self, key: &str) -> KvFuture<'_, Option<String>> {
    let value = self.lock().map(|data| data.get(key).cloned());
    Box::pin(async move { value })
  }

  fn set(&self, key: &str, value: String) -> KvFuture<'_, ()> {
    let result = self.lock().map(|mut data| {
      data.insert(key.to_string(), value);
    });
    Box::pin(async move { result })
  }

  fn delete(&self, key: &str) -> KvFuture<'_, ()> {
    let result = self.lock().map(|mut data| {
      data.remove(key);
    });
    Box::pin(async move { result })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_in_memory_kv_store() {
    let store = InMemoryKvStore::new();

    assert_eq!(store.get("key").await.unwrap(), None);

    store.set("key", "value".to_string()).await.unwrap();
    assert_eq!(store.get("key").await.unwrap(), Some("value".to_string()));

    store.set("key", "updated".to_string()).await.unwrap();
    assert_eq!(store.get("key").await.unwrap(), Some("updated".to_string()));

    store.delete("key").await.unwrap();
    assert_eq!(store.get("key").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_clones_share_data() {
    let store = InMemoryKvStore::new();
    let other = store.clone();

    store.set("cursor", "1100".to_string()).await.unwrap();

    assert_eq!(other.get("cursor").await.unwrap(), Some("1100".to_string()));
    assert_eq!(other.len(), 1);
  }
}
