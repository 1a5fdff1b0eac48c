//! The capability interface implemented by concrete integrations.

use async_trait::async_trait;
use fuschia_source_config::SourceConfig;
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::{FetchError, ParseError};
use crate::event::{CandidateEvent, DedupKey, EmitMeta};

/// Parameters of one upstream page fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
  /// Lower bound for the fetch; `None` on the first run.
  pub cursor: Option<Cursor>,
  /// Provider token of the page to fetch; `None` for the first page.
  pub page_token: Option<String>,
  /// Requested page size.
  pub max_results: Option<u32>,
}

/// One page of raw upstream items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
  pub items: Vec<serde_json::Value>,
  /// Token of the next page, if the provider reports one.
  pub next_page_token: Option<String>,
}

/// An HTTP request delivered to the source's webhook endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRequest {
  pub method: String,
  pub path: String,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Option<String>,
}

impl WebhookRequest {
  /// A POST with a JSON body, as most providers send.
  pub fn json(path: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      method: "POST".to_string(),
      path: path.into(),
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: Some(body.into()),
    }
  }

  /// Look up a header, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// The acknowledgement returned to a webhook caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
  pub status: u16,
  pub body: String,
}

impl WebhookResponse {
  /// 200, returned whether or not the delivery turns out to be a duplicate.
  pub fn accepted(items: usize) -> Self {
    Self {
      status: 200,
      body: format!(r#"{{"accepted":{items}}}"#),
    }
  }

  pub fn bad_request(message: impl Into<String>) -> Self {
    Self {
      status: 400,
      body: message.into(),
    }
  }

  pub fn unavailable(message: impl Into<String>) -> Self {
    Self {
      status: 503,
      body: message.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A source component that can be polled and, optionally, pushed to.
///
/// Integrations implement [`fetch_page`](PollingSource::fetch_page) and
/// [`parse_item`](PollingSource::parse_item); the remaining methods have
/// defaults driven by [`SourceConfig`] that integrations may override.
#[async_trait]
pub trait PollingSource: Send + Sync {
  /// Base configuration of this source instance.
  fn config(&self) -> &SourceConfig;

  /// Fetch one page of raw items from the upstream API.
  async fn fetch_page(&self, request: PageRequest) -> Result<Page, FetchError>;

  /// Turn a raw item (polled or pushed) into a candidate event.
  fn parse_item(&self, raw: serde_json::Value) -> Result<CandidateEvent, ParseError>;

  /// Split a webhook delivery into raw items.
  ///
  /// The default accepts a JSON array (one item per element) or any other
  /// JSON value (a single item). An empty body carries no items.
  fn webhook_items(&self, request: &WebhookRequest) -> Result<Vec<serde_json::Value>, ParseError> {
    let body = match request.body.as_deref().map(str::trim) {
      None | Some("") => return Ok(Vec::new()),
      Some(body) => body,
    };

    let value: serde_json::Value = serde_json::from_str(body)
      .map_err(|e| ParseError::new(format!("webhook body is not JSON: {e}")))?;

    Ok(match value {
      serde_json::Value::Array(items) => items,
      item => vec![item],
    })
  }

  /// Canonical dedup key, identical for webhook and polled deliveries.
  fn dedup_key(&self, event: &CandidateEvent) -> DedupKey {
    DedupKey::derive(self.config().key, event)
  }

  /// Position of the event relative to the cursor.
  fn comparison_key(&self, event: &CandidateEvent) -> Cursor {
    Cursor::Timestamp(event.timestamp)
  }

  /// Metadata handed to the emit interface.
  fn emit_meta(&self, event: &CandidateEvent, key: &DedupKey) -> EmitMeta {
    EmitMeta {
      id: key.to_string(),
      summary: event
        .summary
        .clone()
        .unwrap_or_else(|| format!("New event {key}")),
      ts: event.timestamp,
    }
  }
}
