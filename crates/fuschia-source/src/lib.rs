//! Polling and webhook source engine.
//!
//! A source instance receives new upstream events either pushed through a
//! webhook or pulled on a timer, and hands each event to the platform
//! exactly once, in order, across both paths and across restarts.
//!
//! - [`DeliverySelector`] decides per run whether to consume a webhook batch,
//!   poll upstream, or skip the tick.
//! - [`CursorStore`] persists the resume cursor, the recently emitted keys
//!   the push registration and any unfinished polling walk in a [`KvStore`](fuschia_host_kv::KvStore).
//! - [`DedupEmitter`] filters and orders candidates and emits survivors.
//! - [`SourceRunner`] drives runs one at a time from timer ticks and queued
//!   webhook deliveries.

mod cursor;
mod dedupe;
mod delivery;
mod error;
mod event;
mod runner;
mod sink;
mod source;

pub use cursor::{Cursor, CursorStore, CursorWrite};
pub use dedupe::{Accepted, DedupEmitter, EmissionRecord, EmitOutcome, Filtered, RecentKeys};
pub use delivery::{
  CandidateBatch, DeliveryMode, DeliverySelector, PollBacklog, PushRegistration, RunTrigger,
};
pub use error::{CursorError, EmitError, FetchError, FetchErrorKind, ParseError, RunError};
pub use event::{CandidateEvent, DedupKey, EmitMeta, EmittedEvent};
pub use runner::{RunPhase, RunReport, SourceHandle, SourceRunner};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink};
pub use source::{Page, PageRequest, PollingSource, WebhookRequest, WebhookResponse};
