//! Key-value host capability for fuschia components.
//!
//! Sources persist their cursor, recently emitted keys and webhook
//! registration through the [`KvStore`] trait. The platform decides the
//! backend; this crate ships the trait and an in-memory implementation.

mod error;
mod kv;

pub use error::KvError;
pub use kv::{InMemoryKvStore, KvFuture, KvStore};
