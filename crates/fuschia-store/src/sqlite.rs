use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use fuschia_host_kv::{KvError, KvFuture, KvStore};
use sqlx::SqlitePool;
use sqlx::sqlite::{
  SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::debug;

use crate::Error;

/// SQLite-based KV store implementation.
///
/// Clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
  pool: SqlitePool,
}

impl SqliteKvStore {
  /// Create a new SQLite store with the given connection pool.
  ///
  /// The caller is responsible for running [`SqliteKvStore::migrate`].
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database file at `path` and migrate it.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
    let path = path.as_ref();
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    debug!(path = %path.display(), "opened source state database");

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Open a private in-memory database. State is lost when the store is dropped.
  pub async fn in_memory() -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

    // Every connection to `:memory:` is a separate database, so keep exactly one alive.
    let pool = SqlitePoolOptions::new()
      .min_connections(1)
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  /// Close the underlying pool, waiting for connections to finish.
  pub async fn close(&self) {
    self.pool.close().await;
  }
}

fn backend_error(e: sqlx::Error) -> KvError {
  KvError::backend(e.to_string())
}

impl KvStore for SqliteKvStore {
  fn get(&self, key: &str) -> KvFuture<'_, Option<String>> {
    let key = key.to_string();
    Box::pin(async move {
      sqlx::query_scalar::<_, String>(
        r#"
        SELECT value
        FROM source_state
        WHERE key = ?
        "#,
      )
      .bind(&key)
      .fetch_optional(&self.pool)
      .await
      .map_err(backend_error)
    })
  }

  fn set(&self, key: &str, value: String) -> KvFuture<'_, ()> {
    let key = key.to_string();
    Box::pin(async move {
      sqlx::query(
        r#"
        INSERT INTO source_state (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
      )
      .bind(&key)
      .bind(&value)
      .bind(Utc::now())
      .execute(&self.pool)
      .await
      .map_err(backend_error)?;

      Ok(())
    })
  }

  fn delete(&self, key: &str) -> KvFuture<'_, ()> {
    let key = key.to_string();
    Box::pin(async move {
      sqlx::query(
        r#"
        DELETE FROM source_state
        WHERE key = ?
        "#,
      )
      .bind(&key)
      .execute(&self.pool)
      .await
      .map_err(backend_error)?;

      Ok(())
    })
  }
}
