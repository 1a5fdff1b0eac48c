//! Delivery selection: webhook batches versus polling fallback.

use chrono::{DateTime, Utc};
use fuschia_source_config::{FallbackPolicy, SourceConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cursor::Cursor;
use crate::error::FetchError;
use crate::event::CandidateEvent;
use crate::source::{PageRequest, PollingSource};

/// What started a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunTrigger {
  /// A timer tick.
  Tick,
  /// Raw items from an acknowledged webhook delivery.
  Webhook { items: Vec<serde_json::Value> },
}

/// How a run obtains its candidate batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
  Webhook,
  Polling,
  /// A tick that must not poll; the run does nothing.
  Skipped,
}

/// A webhook registered with the provider for this source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRegistration {
  pub webhook_id: String,
  pub registered_at: DateTime<Utc>,
}

impl PushRegistration {
  pub fn new(webhook_id: impl Into<String>) -> Self {
    Self {
      webhook_id: webhook_id.into(),
      registered_at: Utc::now(),
    }
  }
}

/// A polling walk the page cap cut short.
///
/// The next polling run resumes at `page_token` instead of the first page
/// and keeps filtering against `floor`, the cursor the walk started from.
/// The cursor only moves once the walk runs out of pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBacklog {
  pub page_token: String,
  pub floor: Option<Cursor>,
  /// Greatest comparison key emitted by the walk so far.
  pub high_water: Option<Cursor>,
}

/// Candidate events obtained for one run.
#[derive(Debug, Default)]
pub struct CandidateBatch {
  pub events: Vec<CandidateEvent>,
  /// Pages fetched (0 for webhook runs).
  pub pages: u32,
  /// Raw items received before parsing.
  pub received: usize,
  /// Items dropped because they could not be parsed.
  pub parse_errors: usize,
  /// Set when the page cap stopped pagination with pages left to read.
  pub next_page_token: Option<String>,
}

/// Chooses the delivery mode of a run and produces its candidate batch.
#[derive(Debug, Clone, Copy)]
pub struct DeliverySelector {
  fallback: FallbackPolicy,
  max_pages: u32,
  max_results: Option<u32>,
}

impl DeliverySelector {
  pub fn new(config: &SourceConfig) -> Self {
    Self {
      fallback: config.fallback,
      max_pages: config.max_pages.max(1),
      max_results: config.max_results,
    }
  }

  /// Decide how `trigger` is served given the current push registration.
  pub fn select(&self, trigger: &RunTrigger, push: Option<&PushRegistration>) -> DeliveryMode {
    match trigger {
      RunTrigger::Webhook { .. } => DeliveryMode::Webhook,
      RunTrigger::Tick => match self.fallback {
        FallbackPolicy::Always => DeliveryMode::Polling,
        FallbackPolicy::Never => DeliveryMode::Skipped,
        FallbackPolicy::WhenPushUnavailable if push.is_some() => DeliveryMode::Skipped,
        FallbackPolicy::WhenPushUnavailable => DeliveryMode::Polling,
      },
    }
  }

  /// Build the candidate batch for a run. Never touches persisted state.
  ///
  /// Polling starts at `page_token` when given, otherwise at the first page.
  pub async fn collect(
    &self,
    source: &dyn PollingSource,
    trigger: RunTrigger,
    mode: DeliveryMode,
    cursor: Option<&Cursor>,
    page_token: Option<String>,
  ) -> Result<CandidateBatch, FetchError> {
    match (mode, trigger) {
      (DeliveryMode::Skipped, _) => Ok(CandidateBatch::default()),
      (DeliveryMode::Webhook, RunTrigger::Webhook { items }) => {
        let mut batch = CandidateBatch::default();
        parse_into(source, items, &mut batch);
        Ok(batch)
      }
      (DeliveryMode::Webhook, RunTrigger::Tick) => Ok(CandidateBatch::default()),
      (DeliveryMode::Polling, _) => self.poll(source, cursor, page_token).await,
    }
  }

  /// Fetch pages sequentially until the provider runs out of pages, a page
  /// reaches back to the cursor, or the page cap is hit.
  async fn poll(
    &self,
    source: &dyn PollingSource,
    cursor: Option<&Cursor>,
    mut page_token: Option<String>,
  ) -> Result<CandidateBatch, FetchError> {
    let mut batch = CandidateBatch::default();

    loop {
      let request = PageRequest {
        cursor: cursor.cloned(),
        page_token: page_token.clone(),
        max_results: self.max_results,
      };
      let page = source.fetch_page(request).await?;
      batch.pages += 1;

      let before = batch.events.len();
      parse_into(source, page.items, &mut batch);

      let reached_cursor = cursor.is_some_and(|cursor| {
        batch.events[before..]
          .iter()
          .any(|event| !source.comparison_key(event).is_after(cursor))
      });

      debug!(
        page = batch.pages,
        items = batch.events.len() - before,
        reached_cursor,
        "fetched page"
      );

      let next = match page.next_page_token {
        Some(next) if !reached_cursor => next,
        _ => break,
      };

      if page_token.as_deref() == Some(next.as_str()) {
        warn!(page_token = %next, "provider repeated a page token, stopping pagination");
        break;
      }

      if batch.pages >= self.max_pages {
        warn!(
          max_pages = self.max_pages,
          page_token = %next,
          "page cap reached, remaining pages deferred"
        );
        batch.next_page_token = Some(next);
        break;
      }

      page_token = Some(next);
    }

    Ok(batch)
  }
}

fn parse_into(source: &dyn PollingSource, items: Vec<serde_json::Value>, batch: &mut CandidateBatch) {
  for raw in items {
    batch.received += 1;
    match source.parse_item(raw) {
      Ok(event) => batch.events.push(event),
      Err(e) => {
        warn!(error = %e, "dropping unparseable item");
        batch.parse_errors += 1;
      }
    }
  }
}
