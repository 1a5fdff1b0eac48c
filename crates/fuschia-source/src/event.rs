//! Candidate events, dedup keys and emission metadata.

use std::fmt;

use fuschia_source_config::KeyDerivation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A raw upstream record, fetched by polling or delivered by webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
  /// Provider-assigned identifier, if the provider has one.
  pub id: Option<String>,

  /// Event time (Unix millis).
  pub timestamp: u64,

  /// Entity the event is about, for composite keys.
  pub entity: Option<String>,

  /// Human readable summary for the emitted event.
  pub summary: Option<String>,

  pub payload: serde_json::Value,
}

impl CandidateEvent {
  pub fn new(timestamp: u64, payload: serde_json::Value) -> Self {
    Self {
      id: None,
      timestamp,
      entity: None,
      summary: None,
      payload,
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
    self.entity = Some(entity.into());
    self
  }

  pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
    self.summary = Some(summary.into());
    self
  }
}

/// Identity of a logical upstream event, used to suppress duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
  /// Key from a provider-assigned ID.
  pub fn provider_id(id: impl Into<String>) -> Self {
    DedupKey(id.into())
  }

  /// Key for a specific version of an entity.
  pub fn composite(entity: &str, timestamp: u64) -> Self {
    DedupKey(format!("{entity}:{timestamp}"))
  }

  /// Key from the payload content, for providers without stable IDs.
  ///
  /// Object keys are sorted before hashing, so two payloads that differ only
  /// in key order share a fingerprint.
  pub fn fingerprint(payload: &serde_json::Value) -> Self {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    DedupKey(format!("sha256:{}", hex::encode(digest)))
  }

  /// Derive the canonical key of `event`.
  ///
  /// Missing attributes degrade to the next most specific derivation:
  /// composite falls back to the ID, and the ID falls back to the fingerprint.
  pub fn derive(derivation: KeyDerivation, event: &CandidateEvent) -> Self {
    match derivation {
      KeyDerivation::Composite => match (&event.entity, &event.id) {
        (Some(entity), _) => Self::composite(entity, event.timestamp),
        (None, Some(id)) => Self::composite(id, event.timestamp),
        (None, None) => Self::fingerprint(&event.payload),
      },
      KeyDerivation::Id => match &event.id {
        Some(id) => Self::provider_id(id.as_str()),
        None => Self::fingerprint(&event.payload),
      },
      KeyDerivation::Fingerprint => Self::fingerprint(&event.payload),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
  match value {
    serde_json::Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&serde_json::Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
      }
      out.push('}');
    }
    serde_json::Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    leaf => out.push_str(&leaf.to_string()),
  }
}

impl fmt::Display for DedupKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<String> for DedupKey {
  fn from(s: String) -> Self {
    DedupKey(s)
  }
}

/// Metadata handed to the platform alongside an emitted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitMeta {
  /// Dedup key of the event.
  pub id: String,
  pub summary: String,
  /// Event time (Unix millis).
  pub ts: u64,
}

/// An event as handed to the emit interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
  pub meta: EmitMeta,
  pub payload: serde_json::Value,
}
