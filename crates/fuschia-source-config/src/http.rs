//! Definition of a generic JSON-over-HTTP source.
//!
//! Paths into upstream payloads are JSON pointers (RFC 6901), e.g.
//! `/data/items` or `/snippet/publishedAt`. The empty pointer `""` refers to
//! the whole document.
//!
//! # Example
//!
//! ```json
//! {
//!   "source_id": "new-liked-videos",
//!   "dedupe": "unique",
//!   "max_results": 25,
//!   "request": {
//!     "url": "https://api.example.com/v3/playlistItems",
//!     "query": { "playlistId": "LL", "part": "id,snippet" },
//!     "page_token_param": "pageToken",
//!     "max_results_param": "maxResults"
//!   },
//!   "mapping": {
//!     "items": "/items",
//!     "id": "/id",
//!     "timestamp": "/snippet/publishedAt",
//!     "timestamp_format": "rfc3339",
//!     "summary": "/snippet/title",
//!     "next_page_token": "/nextPageToken"
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::enums::{OrderBy, TimestampFormat};
use crate::error::ConfigError;
use crate::source::SourceConfig;

fn default_method() -> String {
  "GET".to_string()
}

/// Complete definition of a JSON HTTP source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSourceDef {
  #[serde(flatten)]
  pub source: SourceConfig,

  pub request: HttpRequestDef,

  pub mapping: ItemMapping,

  #[serde(default)]
  pub webhook: WebhookDef,
}

impl HttpSourceDef {
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.source.validate()?;
    if self.request.url.trim().is_empty() {
      return Err(ConfigError::invalid("request.url", "must not be empty"));
    }
    for (field, pointer) in self.mapping.pointers() {
      if !pointer.is_empty() && !pointer.starts_with('/') {
        return Err(ConfigError::invalid(field, format!("'{pointer}' is not a JSON pointer")));
      }
    }
    if self.mapping.order_by == OrderBy::Id && self.mapping.id.is_none() {
      return Err(ConfigError::invalid("mapping.id", "required when order_by is 'id'"));
    }
    Ok(())
  }
}

/// How to call the upstream listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestDef {
  #[serde(default = "default_method")]
  pub method: String,

  pub url: String,

  #[serde(default)]
  pub headers: HashMap<String, String>,

  /// Static query parameters added to every request.
  #[serde(default)]
  pub query: BTreeMap<String, String>,

  /// Query parameter carrying the cursor as a lower bound.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cursor_param: Option<String>,

  /// Query parameter carrying the provider's page token.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub page_token_param: Option<String>,

  /// Query parameter carrying the page size.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_results_param: Option<String>,
}

/// Where to find item attributes in upstream payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMapping {
  /// Pointer to the array of items in a listing response.
  #[serde(default)]
  pub items: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,

  pub timestamp: String,

  #[serde(default)]
  pub timestamp_format: TimestampFormat,

  /// Entity the item belongs to, for composite keys.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entity: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,

  /// Pointer to the next page token in a listing response.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_page_token: Option<String>,

  #[serde(default)]
  pub order_by: OrderBy,
}

impl ItemMapping {
  fn pointers(&self) -> Vec<(&'static str, &str)> {
    let mut pointers = vec![
      ("mapping.items", self.items.as_str()),
      ("mapping.timestamp", self.timestamp.as_str()),
    ];
    let optional = [
      ("mapping.id", &self.id),
      ("mapping.entity", &self.entity),
      ("mapping.summary", &self.summary),
      ("mapping.next_page_token", &self.next_page_token),
    ];
    for (field, pointer) in optional {
      if let Some(pointer) = pointer {
        pointers.push((field, pointer.as_str()));
      }
    }
    pointers
  }
}

/// How to read webhook deliveries for the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookDef {
  /// Pointer to the item (or array of items) within the webhook body.
  /// Defaults to the whole body.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub items: Option<String>,

  /// Only items matching this condition are considered.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<WebhookCondition>,
}

/// Equality filter on a webhook item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookCondition {
  pub pointer: String,
  pub equals: serde_json::Value,
}

impl WebhookCondition {
  pub fn matches(&self, item: &serde_json::Value) -> bool {
    item.pointer(&self.pointer) == Some(&self.equals)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn minimal() -> serde_json::Value {
    json!({
      "source_id": "runs",
      "request": { "url": "https://api.example.com/runs" },
      "mapping": { "items": "/data", "id": "/id", "timestamp": "/finishedAt" }
    })
  }

  #[test]
  fn test_minimal_definition() {
    let def: HttpSourceDef = serde_json::from_value(minimal()).unwrap();

    assert_eq!(def.source.source_id, "runs");
    assert_eq!(def.request.method, "GET");
    assert_eq!(def.mapping.items, "/data");
    assert_eq!(def.mapping.timestamp_format, TimestampFormat::Millis);
    assert_eq!(def.webhook, WebhookDef::default());
    assert!(def.validate().is_ok());
  }

  #[test]
  fn test_rejects_relative_pointer() {
    let mut value = minimal();
    value["mapping"]["timestamp"] = json!("finishedAt");
    let def: HttpSourceDef = serde_json::from_value(value).unwrap();

    let err = def.validate().unwrap_err();
    assert!(err.to_string().contains("mapping.timestamp"));
  }

  #[test]
  fn test_order_by_id_requires_id_pointer() {
    let mut value = minimal();
    value["mapping"]["order_by"] = json!("id");
    value["mapping"].as_object_mut().unwrap().remove("id");
    let def: HttpSourceDef = serde_json::from_value(value).unwrap();

    assert!(def.validate().is_err());
  }

  #[test]
  fn test_webhook_condition() {
    let condition = WebhookCondition {
      pointer: "/eventData/actorId".to_string(),
      equals: json!("actor-1"),
    };

    assert!(condition.matches(&json!({"eventData": {"actorId": "actor-1"}})));
    assert!(!condition.matches(&json!({"eventData": {"actorId": "actor-2"}})));
    assert!(!condition.matches(&json!({})));
  }
}
