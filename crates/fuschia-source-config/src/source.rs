use serde::{Deserialize, Serialize};

use crate::enums::{BackfillPolicy, DedupeStrategy, FallbackPolicy, KeyDerivation};
use crate::error::ConfigError;
use crate::timer::TimerConfig;

fn default_max_pages() -> u32 {
  10
}

fn default_dedupe_window() -> usize {
  100
}

/// Base configuration shared by every source.
///
/// Integrations embed this with `#[serde(flatten)]` and add their own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
  /// Identifier of the source instance. Scopes all persisted state.
  pub source_id: String,

  /// Human readable name, used in logs.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,

  #[serde(default)]
  pub timer: TimerConfig,

  #[serde(default)]
  pub dedupe: DedupeStrategy,

  #[serde(default)]
  pub key: KeyDerivation,

  #[serde(default)]
  pub backfill: BackfillPolicy,

  #[serde(default)]
  pub fallback: FallbackPolicy,

  /// Upper bound on pages fetched by a single polling run.
  #[serde(default = "default_max_pages")]
  pub max_pages: u32,

  /// Page size requested from the upstream API, if it supports one.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_results: Option<u32>,

  /// Number of recently emitted dedup keys kept in state.
  #[serde(default = "default_dedupe_window")]
  pub dedupe_window: usize,
}

impl SourceConfig {
  /// Create a configuration with default settings.
  pub fn new(source_id: impl Into<String>) -> Self {
    Self {
      source_id: source_id.into(),
      name: None,
      timer: TimerConfig::default(),
      dedupe: DedupeStrategy::default(),
      key: KeyDerivation::default(),
      backfill: BackfillPolicy::default(),
      fallback: FallbackPolicy::default(),
      max_pages: default_max_pages(),
      max_results: None,
      dedupe_window: default_dedupe_window(),
    }
  }

  /// Name for display, falling back to the source ID.
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or(&self.source_id)
  }

  /// Check the invariants the engine relies on.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.source_id.trim().is_empty() {
      return Err(ConfigError::MissingSourceId);
    }
    if self.source_id.contains(':') {
      return Err(ConfigError::invalid("source_id", "must not contain ':'"));
    }
    if self.timer.interval_seconds == 0 {
      return Err(ConfigError::invalid("timer.interval_seconds", "must be at least 1"));
    }
    if self.max_pages == 0 {
      return Err(ConfigError::invalid("max_pages", "must be at least 1"));
    }
    if self.max_results == Some(0) {
      return Err(ConfigError::invalid("max_results", "must be at least 1"));
    }
    if self.dedupe_window == 0 {
      return Err(ConfigError::invalid("dedupe_window", "must be at least 1"));
    }
    if let BackfillPolicy::Latest { count: 0 } = self.backfill {
      return Err(ConfigError::invalid("backfill.count", "must be at least 1"));
    }
    Ok(())
  }
}
