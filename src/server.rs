//! HTTP server for source webhooks.
//!
//! # Endpoints
//!
//! - `POST /sources/{source_id}/webhook` - Accepts a delivery for a source.
//!   Returns 200 once the delivery is queued, 400 if the body is unusable,
//!   503 if the source cannot take it right now.
//! - `GET /healthz` - Returns 200 if the server is running

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use fuschia_source::{SourceHandle, WebhookRequest};
use tracing::{debug, warn};

/// Shared application state: one handle per served source.
#[derive(Clone)]
pub struct AppState {
  sources: Arc<HashMap<String, SourceHandle>>,
}

impl AppState {
  pub fn new(sources: HashMap<String, SourceHandle>) -> Self {
    Self {
      sources: Arc::new(sources),
    }
  }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(state: AppState) -> axum::Router {
  axum::Router::new()
    .route("/sources/{source_id}/webhook", post(webhook_handler))
    .route("/healthz", get(health_handler))
    .with_state(state)
}

async fn health_handler() -> (StatusCode, &'static str) {
  (StatusCode::OK, "OK")
}

async fn webhook_handler(
  State(state): State<AppState>,
  Path(source_id): Path<String>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: String,
) -> Response {
  let Some(handle) = state.sources.get(&source_id) else {
    warn!(source_id = %source_id, "webhook for unknown source");
    return (StatusCode::NOT_FOUND, format!("unknown source '{source_id}'")).into_response();
  };

  let request = WebhookRequest {
    method: method.to_string(),
    path: uri.path().to_string(),
    headers: headers
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|val| (k.as_str().to_string(), val.to_string()))
      })
      .collect(),
    body: Some(body),
  };

  let response = handle.accept_webhook(&request);
  debug!(source_id = %source_id, status = response.status, "webhook acknowledged");

  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  (status, response.body).into_response()
}

#[cfg(test)]
mod tests {
  use axum::body::Body;
  use axum::http::Request;
  use fuschia_host_http::HttpJsonSource;
  use fuschia_host_kv::InMemoryKvStore;
  use fuschia_source::{MemorySink, SourceRunner};
  use http_body_util::BodyExt;
  use serde_json::json;
  use tower::ServiceExt;

  use super::*;

  fn runner() -> SourceRunner<InMemoryKvStore> {
    let def = serde_json::from_value(json!({
      "source_id": "runs",
      "request": { "url": "http://127.0.0.1:9/runs" },
      "mapping": { "id": "/id", "timestamp": "/ts" }
    }))
    .unwrap();

    SourceRunner::new(
      Arc::new(HttpJsonSource::new(def).unwrap()),
      InMemoryKvStore::new(),
      Arc::new(MemorySink::new()),
    )
  }

  fn app(runner: &SourceRunner<InMemoryKvStore>) -> axum::Router {
    let mut sources = HashMap::new();
    sources.insert("runs".to_string(), runner.handle());
    build_router(AppState::new(sources))
  }

  fn delivery(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
      .method("POST")
      .uri(uri)
      .header("content-type", "application/json")
      .body(Body::from(body.to_string()))
      .unwrap()
  }

  async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
  }

  #[tokio::test]
  async fn health_returns_200() {
    let runner = runner();
    let request = Request::builder()
      .uri("/healthz")
      .body(Body::empty())
      .unwrap();

    let response = app(&runner).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK");
  }

  #[tokio::test]
  async fn webhook_valid_returns_200() {
    let runner = runner();

    let response = app(&runner)
      .oneshot(delivery(
        "/sources/runs/webhook",
        r#"[{"id": "a", "ts": 1}, {"id": "b", "ts": 2}]"#,
      ))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"accepted":2}"#);
  }

  #[tokio::test]
  async fn webhook_malformed_returns_400() {
    let runner = runner();

    let response = app(&runner)
      .oneshot(delivery("/sources/runs/webhook", "{oops"))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn webhook_unknown_source_returns_404() {
    let runner = runner();

    let response = app(&runner)
      .oneshot(delivery("/sources/other/webhook", "{}"))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn webhook_for_stopped_source_returns_503() {
    let runner = runner();
    let app = app(&runner);
    drop(runner);

    let response = app
      .oneshot(delivery("/sources/runs/webhook", r#"{"id": "a", "ts": 1}"#))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
  }
}
