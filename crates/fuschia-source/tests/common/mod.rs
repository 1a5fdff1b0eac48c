//! Shared fixtures for the source engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use fuschia_source::{
  CandidateEvent, EmitError, EmittedEvent, EventSink, FetchError, Page, PageRequest, ParseError,
  PollingSource,
};
use fuschia_source_config::SourceConfig;
use serde_json::{Value, json};

/// An upstream that serves fixed pages, keyed by page token.
///
/// Items are `{"id": "...", "ts": <millis>}`; anything without a numeric
/// `ts` fails to parse.
pub struct ScriptedSource {
  config: SourceConfig,
  pages: Mutex<HashMap<Option<String>, Page>>,
  fail_fetch: AtomicBool,
  fetches: AtomicUsize,
  requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedSource {
  pub fn new(config: SourceConfig) -> Self {
    Self {
      config,
      pages: Mutex::new(HashMap::new()),
      fail_fetch: AtomicBool::new(false),
      fetches: AtomicUsize::new(0),
      requests: Mutex::new(Vec::new()),
    }
  }

  /// Serve `items` as the only page.
  pub fn with_items(self, items: Vec<Value>) -> Self {
    self.set_page(None, items, None);
    self
  }

  pub fn set_page(&self, token: Option<&str>, items: Vec<Value>, next: Option<&str>) {
    self.pages.lock().unwrap().insert(
      token.map(str::to_string),
      Page {
        items,
        next_page_token: next.map(str::to_string),
      },
    );
  }

  pub fn set_fail_fetch(&self, fail: bool) {
    self.fail_fetch.store(fail, Ordering::SeqCst);
  }

  pub fn fetches(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  pub fn requests(&self) -> Vec<PageRequest> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl PollingSource for ScriptedSource {
  fn config(&self) -> &SourceConfig {
    &self.config
  }

  async fn fetch_page(&self, request: PageRequest) -> Result<Page, FetchError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    self.requests.lock().unwrap().push(request.clone());

    if self.fail_fetch.load(Ordering::SeqCst) {
      return Err(FetchError::network("connection refused"));
    }

    Ok(
      self
        .pages
        .lock()
        .unwrap()
        .get(&request.page_token)
        .cloned()
        .unwrap_or_default(),
    )
  }

  fn parse_item(&self, raw: Value) -> Result<CandidateEvent, ParseError> {
    let ts = raw
      .get("ts")
      .and_then(Value::as_u64)
      .ok_or_else(|| ParseError::new("missing numeric ts"))?;
    let mut event = CandidateEvent::new(ts, raw.clone());
    if let Some(id) = raw.get("id").and_then(Value::as_str) {
      event = event.with_id(id);
    }
    Ok(event)
  }
}

/// A sink that fails the Nth emission (1-based) until healed.
pub struct FailingSink {
  fail_at: Mutex<Option<usize>>,
  attempts: AtomicUsize,
  emitted: Mutex<Vec<EmittedEvent>>,
}

impl FailingSink {
  pub fn failing_at(n: usize) -> Self {
    Self {
      fail_at: Mutex::new(Some(n)),
      attempts: AtomicUsize::new(0),
      emitted: Mutex::new(Vec::new()),
    }
  }

  pub fn heal(&self) {
    *self.fail_at.lock().unwrap() = None;
  }

  pub fn ids(&self) -> Vec<String> {
    self
      .emitted
      .lock()
      .unwrap()
      .iter()
      .map(|e| e.meta.id.clone())
      .collect()
  }

  pub fn timestamps(&self) -> Vec<u64> {
    self.emitted.lock().unwrap().iter().map(|e| e.meta.ts).collect()
  }
}

impl EventSink for FailingSink {
  fn emit(&self, event: EmittedEvent) -> Result<(), EmitError> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if *self.fail_at.lock().unwrap() == Some(attempt) {
      return Err(EmitError::new("downstream unavailable"));
    }
    self.emitted.lock().unwrap().push(event);
    Ok(())
  }
}

pub fn item(id: &str, ts: u64) -> Value {
  json!({ "id": id, "ts": ts })
}

pub fn config(source_id: &str) -> SourceConfig {
  SourceConfig::new(source_id)
}
