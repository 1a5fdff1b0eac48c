//! Fuschia Store
//!
//! This crate provides the durable [`KvStore`](fuschia_host_kv::KvStore)
//! backend for source state. Values are persisted to SQLite so a cursor
//! written by one process is visible to the next one after a restart.

mod sqlite;

pub use sqlite::SqliteKvStore;

/// Error type for opening and migrating the store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Running migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}
