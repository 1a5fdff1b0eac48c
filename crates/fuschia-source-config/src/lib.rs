//! Fuschia Source Config
//!
//! This crate contains the serializable configuration types for fuschia
//! source components. A source emits each upstream event exactly once,
//! whether the event arrives by webhook or by the polling fallback.
//!
//! Configuration is composed rather than inherited: every source carries a
//! [`SourceConfig`] with the shared knobs (timer, dedupe strategy, back-fill,
//! paging limits) and integrations flatten it into their own definition,
//! e.g. [`HttpSourceDef`].
//!
//! Definitions are loaded from JSON files (via the CLI) and are never mutated
//! by the engine.

mod enums;
mod error;
mod http;
mod source;
mod timer;

pub use enums::{BackfillPolicy, DedupeStrategy, FallbackPolicy, KeyDerivation, OrderBy, TimestampFormat};
pub use error::ConfigError;
pub use http::{HttpRequestDef, HttpSourceDef, ItemMapping, WebhookCondition, WebhookDef};
pub use source::SourceConfig;
pub use timer::{DEFAULT_POLLING_INTERVAL_SECONDS, TimerConfig};
