//! Source runner with channel-based triggering.
//!
//! The `SourceRunner` owns an mpsc channel of [`RunTrigger`]s and executes one
//! run at a time, so runs of a source instance never overlap even when
//! webhooks arrive concurrently with timer ticks.
//!
//! Each run walks `Fetching → Filtering → Emitting → Advancing → Done`.
//! Fetch, emission and persistence failures end the run in `Failed` with the
//! cursor at its pre-run value.
//!
//! A polling walk stopped by the page cap with pages left is saved as a
//! [`PollBacklog`]. Following polling runs resume from its page token and the
//! cursor advances only once the walk is complete.

use std::sync::Arc;
use std::time::Duration;

use fuschia_host_kv::KvStore;
use fuschia_source_config::BackfillPolicy;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cursor::{Cursor, CursorStore, CursorWrite};
use crate::dedupe::DedupEmitter;
use crate::delivery::{DeliveryMode, DeliverySelector, PollBacklog, PushRegistration, RunTrigger};
use crate::error::RunError;
use crate::sink::EventSink;
use crate::source::{PollingSource, WebhookRequest, WebhookResponse};

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
  Fetching,
  Filtering,
  Emitting,
  Advancing,
  Done,
  Failed,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
  pub source_id: String,
  pub mode: DeliveryMode,
  pub phase: RunPhase,
  pub pages: u32,
  /// Raw items received.
  pub fetched: usize,
  pub parse_errors: usize,
  /// Candidates dropped as already emitted (including back-fill and kind mismatches).
  pub duplicates: usize,
  pub emitted: usize,
  pub cursor_before: Option<Cursor>,
  pub cursor_after: Option<Cursor>,
}

/// A cloneable handle for feeding triggers to a running [`SourceRunner`].
///
/// This can be given to webhook handlers, schedulers, UIs, etc.
#[derive(Clone)]
pub struct SourceHandle {
  source: Arc<dyn PollingSource>,
  sender: mpsc::Sender<RunTrigger>,
}

impl SourceHandle {
  pub fn source_id(&self) -> &str {
    &self.source.config().source_id
  }

  /// Acknowledge a webhook delivery and queue it for processing.
  ///
  /// Returns without waiting for the run: the caller gets 200 as soon as the
  /// body is parsed and queued, whether or not its events turn out to be
  /// duplicates. An unparseable body is rejected with 400; a full or closed
  /// queue with 503 so the provider redelivers later.
  pub fn accept_webhook(&self, request: &WebhookRequest) -> WebhookResponse {
    let items = match self.source.webhook_items(request) {
      Ok(items) => items,
      Err(e) => {
        warn!(source_id = %self.source_id(), error = %e, "rejecting webhook delivery");
        return WebhookResponse::bad_request(e.to_string());
      }
    };

    let count = items.len();
    match self.sender.try_send(RunTrigger::Webhook { items }) {
      Ok(()) => {
        debug!(source_id = %self.source_id(), items = count, "webhook delivery queued");
        WebhookResponse::accepted(count)
      }
      Err(mpsc::error::TrySendError::Full(_)) => {
        warn!(source_id = %self.source_id(), "trigger queue full, asking provider to retry");
        WebhookResponse::unavailable("source busy")
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        WebhookResponse::unavailable("source stopped")
      }
    }
  }

  /// Queue an out-of-schedule polling run.
  pub async fn tick(&self) -> Result<(), RunError> {
    self
      .sender
      .send(RunTrigger::Tick)
      .await
      .map_err(|_| RunError::ChannelClosed)
  }
}

/// Runs a source in response to triggers.
///
/// # Usage
///
/// ```ignore
/// let runner = SourceRunner::new(source, kv, sink);
///
/// // Get a handle for webhook deliveries
/// let handle = runner.handle();
///
/// // Start the run loop (timer ticks + queued triggers)
/// let cancel = CancellationToken::new();
/// runner.start(cancel).await?;
/// ```
pub struct SourceRunner<K: KvStore> {
  source: Arc<dyn PollingSource>,
  store: CursorStore<K>,
  sink: Arc<dyn EventSink>,
  selector: DeliverySelector,
  emitter: DedupEmitter,
  sender: mpsc::Sender<RunTrigger>,
  receiver: mpsc::Receiver<RunTrigger>,
}

impl<K: KvStore> SourceRunner<K> {
  /// Create a new runner.
  ///
  /// # Arguments
  /// * `source` - The integration to run
  /// * `kv` - Backend for the source's persistent state
  /// * `sink` - The platform's emit interface
  pub fn new(source: Arc<dyn PollingSource>, kv: K, sink: Arc<dyn EventSink>) -> Self {
    Self::with_buffer_size(source, kv, sink, 100)
  }

  /// Create a new runner with a custom trigger buffer size.
  pub fn with_buffer_size(
    source: Arc<dyn PollingSource>,
    kv: K,
    sink: Arc<dyn EventSink>,
    buffer_size: usize,
  ) -> Self {
    let config = source.config();
    let store = CursorStore::new(kv, config.source_id.clone());
    let selector = DeliverySelector::new(config);
    let emitter = DedupEmitter::new(config.dedupe, config.backfill);
    let (sender, receiver) = mpsc::channel(buffer_size.max(1));

    Self {
      source,
      store,
      sink,
      selector,
      emitter,
      sender,
      receiver,
    }
  }

  pub fn source_id(&self) -> &str {
    self.store.source_id()
  }

  /// Access the source's persistent state.
  pub fn store(&self) -> &CursorStore<K> {
    &self.store
  }

  /// Get a handle for feeding triggers to this runner.
  pub fn handle(&self) -> SourceHandle {
    SourceHandle {
      source: self.source.clone(),
      sender: self.sender.clone(),
    }
  }

  /// Record that the provider now pushes events to our webhook.
  pub async fn register_push(&self, webhook_id: impl Into<String>) -> Result<(), RunError> {
    let registration = PushRegistration::new(webhook_id);
    info!(
      source_id = %self.source_id(),
      webhook_id = %registration.webhook_id,
      "push delivery registered"
    );
    self.store.write_push(&registration).await
  }

  /// Record that push delivery is gone; ticks fall back to polling.
  pub async fn unregister_push(&self) -> Result<(), RunError> {
    info!(source_id = %self.source_id(), "push delivery unregistered");
    self.store.clear_push().await
  }

  /// Run a webhook delivery to completion, returning the acknowledgement
  /// and, if the body was accepted, the run's report.
  pub async fn run_webhook(
    &self,
    request: &WebhookRequest,
  ) -> (WebhookResponse, Option<Result<RunReport, RunError>>) {
    match self.source.webhook_items(request) {
      Ok(items) => {
        let response = WebhookResponse::accepted(items.len());
        let report = self.run_once(RunTrigger::Webhook { items }).await;
        (response, Some(report))
      }
      Err(e) => {
        warn!(source_id = %self.source_id(), error = %e, "rejecting webhook delivery");
        (WebhookResponse::bad_request(e.to_string()), None)
      }
    }
  }

  /// Execute one run for `trigger`.
  #[instrument(
    name = "source_run",
    skip(self, trigger),
    fields(source_id = %self.store.source_id())
  )]
  pub async fn run_once(&self, trigger: RunTrigger) -> Result<RunReport, RunError> {
    let mut phase = RunPhase::Fetching;
    let result = self.run_phases(trigger, &mut phase).await;

    match &result {
      Ok(report) => {
        info!(
          mode = ?report.mode,
          fetched = report.fetched,
          emitted = report.emitted,
          duplicates = report.duplicates,
          parse_errors = report.parse_errors,
          cursor = ?report.cursor_after,
          "source run completed"
        );
      }
      Err(e) => {
        error!(phase = ?phase, error = %e, retryable = e.is_retryable(), "source run failed");
      }
    }

    result
  }

  async fn run_phases(
    &self,
    trigger: RunTrigger,
    phase: &mut RunPhase,
  ) -> Result<RunReport, RunError> {
    let config = self.source.config();

    // FETCHING
    let cursor = self.store.read_cursor().await?;
    let push = self.store.read_push().await?;
    let mode = self.selector.select(&trigger, push.as_ref());
    let backlog = match mode {
      DeliveryMode::Polling => self.store.read_backlog().await?,
      _ => None,
    };
    // A resumed walk keeps comparing against the cursor it started from.
    let floor = match &backlog {
      Some(backlog) => backlog.floor.clone(),
      None => cursor.clone(),
    };
    debug!(mode = ?mode, cursor = ?cursor, resuming = backlog.is_some(), "delivery selected");

    let batch = self
      .selector
      .collect(
        self.source.as_ref(),
        trigger,
        mode,
        floor.as_ref(),
        backlog.as_ref().map(|b| b.page_token.clone()),
      )
      .await?;

    let mut report = RunReport {
      source_id: config.source_id.clone(),
      mode,
      phase: RunPhase::Done,
      pages: batch.pages,
      fetched: batch.received,
      parse_errors: batch.parse_errors,
      duplicates: 0,
      emitted: 0,
      cursor_before: cursor.clone(),
      cursor_after: cursor.clone(),
    };

    if mode == DeliveryMode::Skipped {
      debug!("tick skipped, push delivery is active");
      return Ok(report);
    }

    // FILTERING
    *phase = RunPhase::Filtering;
    let first_poll = mode == DeliveryMode::Polling && floor.is_none() && backlog.is_none();
    let mut recent = self.store.read_recent_keys(config.dedupe_window).await?;
    let filtered = self.emitter.filter(
      self.source.as_ref(),
      batch.events,
      floor.as_ref(),
      &recent,
      first_poll,
    );
    report.duplicates = filtered.duplicates + filtered.mismatched + filtered.backfill_skipped;

    // EMITTING
    *phase = RunPhase::Emitting;
    let outcome = self.emitter.emit(
      self.source.as_ref(),
      filtered.accepted,
      self.sink.as_ref(),
      &mut recent,
    );
    report.emitted = outcome.emitted;

    if let Some((key, source)) = outcome.failure {
      // Keep what was emitted out of the retry; the cursor stays put.
      if outcome.emitted > 0
        && let Err(e) = self.store.write_recent_keys(&recent).await
      {
        warn!(error = %e, "failed to record partial emissions, they may be re-emitted");
      }
      *phase = RunPhase::Failed;
      return Err(RunError::Emission {
        key: key.to_string(),
        source,
      });
    }

    // ADVANCING
    *phase = RunPhase::Advancing;
    let held_back = !filtered.held_back.is_empty();
    for key in filtered.held_back {
      recent.insert(key);
    }
    if outcome.emitted > 0 || held_back {
      self.store.write_recent_keys(&recent).await?;
    }

    let resumed = backlog.is_some();
    let high_water = greatest(backlog.and_then(|b| b.high_water), outcome.max_key);

    // Older history behind a capped first walk is what back-fill drops anyway.
    let bounded_backfill = matches!(config.backfill, BackfillPolicy::Latest { .. });
    let defer = match batch.next_page_token {
      Some(page_token) if !(first_poll && bounded_backfill) => Some(page_token),
      _ => None,
    };

    if let Some(page_token) = defer {
      info!(page_token = %page_token, "polling walk continues on the next run");
      self
        .store
        .write_backlog(&PollBacklog {
          page_token,
          floor,
          high_water,
        })
        .await?;
      *phase = RunPhase::Done;
      return Ok(report);
    }

    if let Some(max_key) = high_water {
      match self.store.write_cursor(&max_key).await? {
        CursorWrite::Advanced => report.cursor_after = Some(max_key),
        CursorWrite::Unchanged => {}
        CursorWrite::Rejected { current } => report.cursor_after = Some(current),
      }
    }
    if resumed {
      self.store.clear_backlog().await?;
    }

    *phase = RunPhase::Done;
    Ok(report)
  }

  /// Start the run loop.
  ///
  /// Polls on the configured timer interval and serves queued triggers until
  /// the cancellation token is triggered. Failed runs are logged and retried
  /// on the next tick. The first tick fires immediately.
  pub async fn start(mut self, cancel: CancellationToken) -> Result<(), RunError> {
    let interval_seconds = self.source.config().timer.interval_seconds.max(1);
    let mut timer = tokio::time::interval(Duration::from_secs(interval_seconds));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
      source_id = %self.source_id(),
      name = %self.source.config().display_name(),
      interval_seconds,
      "starting source runner"
    );

    loop {
      let trigger = tokio::select! {
          _ = cancel.cancelled() => {
              info!(source_id = %self.source_id(), "source runner cancelled");
              break;
          }
          _ = timer.tick() => RunTrigger::Tick,
          trigger = self.receiver.recv() => match trigger {
              Some(trigger) => trigger,
              // Unreachable while `self.sender` is alive.
              None => break,
          },
      };

      // Errors are already logged by run_once; the next trigger retries.
      let _ = self.run_once(trigger).await;
    }

    // Drain deliveries that were acknowledged before cancellation.
    self.receiver.close();
    while let Ok(trigger) = self.receiver.try_recv() {
      if matches!(trigger, RunTrigger::Webhook { .. }) {
        let _ = self.run_once(trigger).await;
      }
    }

    Ok(())
  }
}

/// The greater of two optional keys. Keys of different kinds keep `a`.
fn greatest(a: Option<Cursor>, b: Option<Cursor>) -> Option<Cursor> {
  match (a, b) {
    (Some(a), Some(b)) if b.is_after(&a) => Some(b),
    (Some(a), _) => Some(a),
    (None, b) => b,
  }
}
