use serde::{Deserialize, Serialize};

/// How a source decides that a candidate event was already emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeStrategy {
  /// Reject events whose dedup key was emitted before.
  #[default]
  Unique,
  /// Accept only events whose comparison key strictly exceeds the cursor.
  Greatest,
}

/// What a source emits on its first run, when no cursor exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackfillPolicy {
  /// Emit every historical item returned by the first fetch.
  All,
  /// Emit only the `count` most recent items.
  Latest { count: usize },
}

impl Default for BackfillPolicy {
  fn default() -> Self {
    Self::Latest { count: 10 }
  }
}

/// When a timer tick is allowed to poll the upstream API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
  /// Poll only while no webhook is registered for the source.
  #[default]
  WhenPushUnavailable,
  /// Poll on every tick, even with an active webhook.
  Always,
  /// Never poll; the source is webhook-only.
  Never,
}

/// Canonical dedup key derivation for a source.
///
/// The same derivation is applied to webhook and polled items so both
/// channels agree on the identity of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivation {
  /// Provider-assigned ID, falling back to a content fingerprint.
  #[default]
  Id,
  /// `{entity}:{timestamp}`, for providers that re-use IDs across updates.
  Composite,
  /// SHA-256 of the canonical JSON payload.
  Fingerprint,
}

/// Which attribute of an item orders it relative to the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
  #[default]
  Timestamp,
  /// Monotonically increasing numeric ID.
  Id,
}

/// Encoding of timestamps in upstream payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
  #[default]
  Millis,
  Seconds,
  Rfc3339,
}
