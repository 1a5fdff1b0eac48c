use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fuschia_source::{
  CandidateEvent, Cursor, FetchError, Page, PageRequest, ParseError, PollingSource,
  WebhookRequest,
};
use fuschia_source_config::{HttpSourceDef, OrderBy, SourceConfig, TimestampFormat};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::HttpSourceError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest slice of an error response body kept in a [`FetchError`].
const ERROR_BODY_LIMIT: usize = 256;

/// A source that lists items from a JSON HTTP endpoint.
#[derive(Debug)]
pub struct HttpJsonSource {
  def: HttpSourceDef,
  method: Method,
  base_url: Url,
  client: Client,
}

impl HttpJsonSource {
  /// Build a source from a validated definition.
  pub fn new(def: HttpSourceDef) -> Result<Self, HttpSourceError> {
    let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    Self::with_client(def, client)
  }

  /// Build a source that sends requests through `client`.
  pub fn with_client(def: HttpSourceDef, client: Client) -> Result<Self, HttpSourceError> {
    def.validate()?;
    let method = parse_method(&def.request.method)?;
    let base_url = Url::parse(&def.request.url).map_err(|e| HttpSourceError::InvalidUrl {
      url: def.request.url.clone(),
      message: e.to_string(),
    })?;

    Ok(Self {
      def,
      method,
      base_url,
      client,
    })
  }

  pub fn definition(&self) -> &HttpSourceDef {
    &self.def
  }

  /// URL of the listing request for `request`.
  pub fn build_url(&self, request: &PageRequest) -> Url {
    let def = &self.def.request;
    let mut pairs: Vec<(&str, String)> = def
      .query
      .iter()
      .map(|(k, v)| (k.as_str(), v.clone()))
      .collect();

    if let (Some(param), Some(cursor)) = (&def.cursor_param, &request.cursor) {
      pairs.push((param.as_str(), self.format_cursor(cursor)));
    }
    if let (Some(param), Some(token)) = (&def.page_token_param, &request.page_token) {
      pairs.push((param.as_str(), token.clone()));
    }
    if let (Some(param), Some(max_results)) = (&def.max_results_param, request.max_results) {
      pairs.push((param.as_str(), max_results.to_string()));
    }

    let mut url = self.base_url.clone();
    if !pairs.is_empty() {
      url.query_pairs_mut().extend_pairs(pairs);
    }
    url
  }

  /// Render a cursor the way the upstream expects it in a query string.
  fn format_cursor(&self, cursor: &Cursor) -> String {
    match cursor {
      Cursor::Timestamp(ms) => match self.def.mapping.timestamp_format {
        TimestampFormat::Millis => ms.to_string(),
        TimestampFormat::Seconds => (ms / 1000).to_string(),
        TimestampFormat::Rfc3339 => i64::try_from(*ms)
          .ok()
          .and_then(DateTime::<Utc>::from_timestamp_millis)
          .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
          .unwrap_or_else(|| ms.to_string()),
      },
      Cursor::Sequence(n) => n.to_string(),
      Cursor::Token(token) => token.clone(),
    }
  }

  /// Split a listing response into items and the next page token.
  fn page_from(&self, mut document: Value) -> Result<Page, FetchError> {
    let mapping = &self.def.mapping;

    let next_page_token = mapping
      .next_page_token
      .as_deref()
      .and_then(|pointer| document.pointer(pointer))
      .and_then(scalar_string);

    let items = match document.pointer_mut(&mapping.items).map(Value::take) {
      Some(Value::Array(items)) => items,
      // Some providers omit the list entirely when it is empty.
      Some(Value::Null) | None => Vec::new(),
      Some(other) => {
        return Err(FetchError::invalid_response(format!(
          "expected an array at '{}', found {}",
          mapping.items,
          type_name(&other)
        )));
      }
    };

    Ok(Page {
      items,
      next_page_token,
    })
  }
}

#[async_trait]
impl PollingSource for HttpJsonSource {
  fn config(&self) -> &SourceConfig {
    &self.def.source
  }

  async fn fetch_page(&self, request: PageRequest) -> Result<Page, FetchError> {
    let url = self.build_url(&request);
    debug!(source_id = %self.def.source.source_id, url = %url, "fetching page");

    let mut builder = self.client.request(self.method.clone(), url);
    for (key, value) in &self.def.request.headers {
      builder = builder.header(key, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(status_error(status, &body));
    }

    let body = response
      .text()
      .await
      .map_err(|e| FetchError::network(e.to_string()))?;
    let document: Value = serde_json::from_str(&body)
      .map_err(|e| FetchError::invalid_response(format!("body is not JSON: {e}")))?;

    self.page_from(document)
  }

  fn parse_item(&self, raw: Value) -> Result<CandidateEvent, ParseError> {
    let mapping = &self.def.mapping;

    let timestamp = raw
      .pointer(&mapping.timestamp)
      .ok_or_else(|| ParseError::new(format!("missing timestamp at '{}'", mapping.timestamp)))?;
    let timestamp = parse_timestamp(timestamp, mapping.timestamp_format)?;

    let lookup = |pointer: &Option<String>| {
      pointer
        .as_deref()
        .and_then(|pointer| raw.pointer(pointer))
        .and_then(scalar_string)
    };
    let id = lookup(&mapping.id);
    let entity = lookup(&mapping.entity);
    let summary = lookup(&mapping.summary);

    if mapping.order_by == OrderBy::Id && id.is_none() {
      return Err(ParseError::new("missing id, required for ordering"));
    }

    let mut event = CandidateEvent::new(timestamp, raw);
    event.id = id;
    event.entity = entity;
    event.summary = summary;
    Ok(event)
  }

  /// Apply the webhook items pointer and condition to a delivery.
  ///
  /// A body without anything at the items pointer carries no items. The
  /// condition is evaluated against each item.
  fn webhook_items(&self, request: &WebhookRequest) -> Result<Vec<Value>, ParseError> {
    let body = match request.body.as_deref().map(str::trim) {
      None | Some("") => return Ok(Vec::new()),
      Some(body) => body,
    };

    let mut document: Value = serde_json::from_str(body)
      .map_err(|e| ParseError::new(format!("webhook body is not JSON: {e}")))?;

    let selected = match &self.def.webhook.items {
      Some(pointer) => match document.pointer_mut(pointer) {
        Some(value) => value.take(),
        None => {
          debug!(pointer = %pointer, "webhook body has no items");
          return Ok(Vec::new());
        }
      },
      None => document,
    };

    let items = match selected {
      Value::Array(items) => items,
      Value::Null => Vec::new(),
      item => vec![item],
    };

    let Some(condition) = &self.def.webhook.condition else {
      return Ok(items);
    };

    let received = items.len();
    let items: Vec<Value> = items
      .into_iter()
      .filter(|item| condition.matches(item))
      .collect();
    if items.len() < received {
      debug!(
        dropped = received - items.len(),
        pointer = %condition.pointer,
        "webhook items did not match condition"
      );
    }
    Ok(items)
  }

  fn comparison_key(&self, event: &CandidateEvent) -> Cursor {
    match (self.def.mapping.order_by, event.id.as_deref()) {
      (OrderBy::Id, Some(id)) => match id.parse::<u64>() {
        Ok(sequence) => Cursor::Sequence(sequence),
        Err(_) => Cursor::Token(id.to_string()),
      },
      _ => Cursor::Timestamp(event.timestamp),
    }
  }
}

fn parse_method(method: &str) -> Result<Method, HttpSourceError> {
  match method.to_uppercase().as_str() {
    "GET" => Ok(Method::GET),
    "POST" => Ok(Method::POST),
    "PUT" => Ok(Method::PUT),
    "DELETE" => Ok(Method::DELETE),
    "PATCH" => Ok(Method::PATCH),
    "HEAD" => Ok(Method::HEAD),
    "OPTIONS" => Ok(Method::OPTIONS),
    _ => Err(HttpSourceError::InvalidMethod(method.to_string())),
  }
}

fn status_error(status: StatusCode, body: &str) -> FetchError {
  let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
  let message = format!("{status}: {body}");
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::auth(message),
    StatusCode::TOO_MANY_REQUESTS => FetchError::rate_limited(message),
    _ => FetchError::status(status.as_u16(), message),
  }
}

/// Convert a timestamp attribute to Unix millis.
fn parse_timestamp(value: &Value, format: TimestampFormat) -> Result<u64, ParseError> {
  let millis = match format {
    TimestampFormat::Rfc3339 => {
      let text = value
        .as_str()
        .ok_or_else(|| ParseError::new(format!("expected an RFC 3339 string, found {}", type_name(value))))?;
      let parsed = DateTime::parse_from_rfc3339(text)
        .map_err(|e| ParseError::new(format!("invalid timestamp '{text}': {e}")))?;
      u64::try_from(parsed.timestamp_millis()).ok()
    }
    TimestampFormat::Millis => scaled(value, 1),
    TimestampFormat::Seconds => scaled(value, 1000),
  };

  millis.ok_or_else(|| ParseError::new(format!("invalid timestamp {value}")))
}

fn scaled(value: &Value, scale: u64) -> Option<u64> {
  match value {
    Value::Number(n) => n.as_u64().map(|v| v.saturating_mul(scale)).or_else(|| {
      n.as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| (f * scale as f64) as u64)
    }),
    Value::String(s) => s.trim().parse::<u64>().ok().map(|v| v.saturating_mul(scale)),
    _ => None,
  }
}

/// Strings and numbers as text; anything else is absent.
fn scalar_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use fuschia_source::{DedupKey, FetchErrorKind};
  use serde_json::json;

  use super::*;

  fn source(def: Value) -> HttpJsonSource {
    HttpJsonSource::new(serde_json::from_value(def).unwrap()).unwrap()
  }

  fn videos() -> HttpJsonSource {
    source(json!({
      "source_id": "liked-videos",
      "max_results": 25,
      "request": {
        "url": "https://api.example.com/v3/playlistItems",
        "query": { "playlistId": "LL" },
        "cursor_param": "publishedAfter",
        "page_token_param": "pageToken",
        "max_results_param": "maxResults"
      },
      "mapping": {
        "items": "/items",
        "id": "/id",
        "timestamp": "/snippet/publishedAt",
        "timestamp_format": "rfc3339",
        "summary": "/snippet/title",
        "next_page_token": "/nextPageToken"
      },
      "webhook": {
        "items": "/resource",
        "condition": { "pointer": "/kind", "equals": "video" }
      }
    }))
  }

  fn query(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
  }

  #[test]
  fn test_build_url_first_page() {
    let url = videos().build_url(&PageRequest {
      cursor: None,
      page_token: None,
      max_results: Some(25),
    });

    let query = query(&url);
    assert_eq!(query.get("playlistId").map(String::as_str), Some("LL"));
    assert_eq!(query.get("maxResults").map(String::as_str), Some("25"));
    assert!(!query.contains_key("pageToken"));
    assert!(!query.contains_key("publishedAfter"));
  }

  #[test]
  fn test_build_url_with_cursor_and_token() {
    let url = videos().build_url(&PageRequest {
      cursor: Some(Cursor::Timestamp(1_704_067_200_000)),
      page_token: Some("CAUQAA".to_string()),
      max_results: None,
    });

    let query = query(&url);
    assert_eq!(
      query.get("publishedAfter").map(String::as_str),
      Some("2024-01-01T00:00:00.000Z")
    );
    assert_eq!(query.get("pageToken").map(String::as_str), Some("CAUQAA"));
  }

  #[test]
  fn test_build_url_without_params_has_no_query() {
    let source = source(json!({
      "source_id": "runs",
      "request": { "url": "https://api.example.com/runs" },
      "mapping": { "timestamp": "/ts" }
    }));

    let url = source.build_url(&PageRequest::default());
    assert_eq!(url.as_str(), "https://api.example.com/runs");
  }

  #[test]
  fn test_parse_item_rfc3339() {
    let event = videos()
      .parse_item(json!({
        "id": "abc123",
        "snippet": { "publishedAt": "2024-01-01T00:00:01Z", "title": "A video" }
      }))
      .unwrap();

    assert_eq!(event.id.as_deref(), Some("abc123"));
    assert_eq!(event.timestamp, 1_704_067_201_000);
    assert_eq!(event.summary.as_deref(), Some("A video"));
  }

  #[test]
  fn test_parse_item_seconds_and_numeric_id() {
    let source = source(json!({
      "source_id": "issues",
      "request": { "url": "https://api.example.com/issues" },
      "mapping": {
        "id": "/number",
        "timestamp": "/created",
        "timestamp_format": "seconds",
        "order_by": "id"
      }
    }));

    let event = source
      .parse_item(json!({ "number": 42, "created": 1_700_000_000 }))
      .unwrap();

    assert_eq!(event.id.as_deref(), Some("42"));
    assert_eq!(event.timestamp, 1_700_000_000_000);
    assert_eq!(source.comparison_key(&event), Cursor::Sequence(42));
    assert_eq!(source.dedup_key(&event), DedupKey::provider_id("42"));
  }

  #[test]
  fn test_parse_item_rejects_bad_timestamp() {
    let source = videos();

    assert!(source.parse_item(json!({ "id": "a" })).is_err());
    assert!(
      source
        .parse_item(json!({ "id": "a", "snippet": { "publishedAt": "yesterday" } }))
        .is_err()
    );
  }

  #[test]
  fn test_page_from_listing() {
    let page = videos()
      .page_from(json!({
        "items": [{ "id": "a" }, { "id": "b" }],
        "nextPageToken": "next"
      }))
      .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.next_page_token.as_deref(), Some("next"));

    let empty = videos().page_from(json!({ "kind": "list" })).unwrap();
    assert!(empty.items.is_empty());
    assert_eq!(empty.next_page_token, None);

    let err = videos().page_from(json!({ "items": "nope" })).unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::InvalidResponse);
  }

  #[test]
  fn test_webhook_items_pointer_and_condition() {
    let source = videos();

    let matching = WebhookRequest::json(
      "/hook",
      json!({ "resource": [{ "kind": "video", "id": "a" }, { "kind": "channel", "id": "b" }] })
        .to_string(),
    );
    let items = source.webhook_items(&matching).unwrap();
    assert_eq!(items, vec![json!({ "kind": "video", "id": "a" })]);

    let unrelated = WebhookRequest::json("/hook", r#"{"ping": true}"#);
    assert!(source.webhook_items(&unrelated).unwrap().is_empty());

    let malformed = WebhookRequest::json("/hook", "<xml/>");
    assert!(source.webhook_items(&malformed).is_err());
  }

  #[test]
  fn test_status_errors() {
    assert_eq!(
      status_error(StatusCode::UNAUTHORIZED, "").kind,
      FetchErrorKind::Auth
    );
    assert_eq!(
      status_error(StatusCode::TOO_MANY_REQUESTS, "slow down").kind,
      FetchErrorKind::RateLimited
    );
    assert_eq!(
      status_error(StatusCode::BAD_GATEWAY, "").kind,
      FetchErrorKind::Status(502)
    );
  }

  #[test]
  fn test_invalid_definitions() {
    let def = |method: &str, url: &str| -> HttpSourceDef {
      serde_json::from_value(json!({
        "source_id": "runs",
        "request": { "method": method, "url": url },
        "mapping": { "timestamp": "/ts" }
      }))
      .unwrap()
    };

    assert!(matches!(
      HttpJsonSource::new(def("FETCH", "https://api.example.com")),
      Err(HttpSourceError::InvalidMethod(_))
    ));
    assert!(matches!(
      HttpJsonSource::new(def("get", "not a url")),
      Err(HttpSourceError::InvalidUrl { .. })
    ));
  }
}
