//! Deduplicated, ordered emission of candidate events.
//!
//! A batch goes through two steps:
//!
//! 1. [`DedupEmitter::filter`] drops everything already emitted, judged by
//!    the recent-keys window plus the cursor, applies the back-fill policy on
//!    first polling runs, and sorts survivors by comparison key.
//! 2. [`DedupEmitter::emit`] hands survivors to the sink in order and stops at
//!    the first failure.
//!
//! # Strategies
//!
//! - `unique`: an event is new if its dedup key is not in the window and it
//!   is not strictly older than the cursor.
//! - `greatest`: an event is new if its comparison key is strictly greater
//!   than the cursor. Within a batch, later events with an equal comparison
//!   key are ties and dropped.
//!
//! Both strategies also drop keys repeated within the same batch.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use fuschia_source_config::{BackfillPolicy, DedupeStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cursor::Cursor;
use crate::error::EmitError;
use crate::event::{CandidateEvent, DedupKey, EmittedEvent};
use crate::sink::EventSink;
use crate::source::PollingSource;

/// A dedup key that was handed to the emit interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionRecord {
  pub key: DedupKey,
  pub emitted_at: DateTime<Utc>,
}

/// Bounded window of recently emitted keys, oldest first.
#[derive(Debug, Clone, Default)]
pub struct RecentKeys {
  records: VecDeque<EmissionRecord>,
  index: HashSet<DedupKey>,
  capacity: usize,
}

impl RecentKeys {
  pub fn new(capacity: usize) -> Self {
    Self {
      records: VecDeque::new(),
      index: HashSet::new(),
      capacity: capacity.max(1),
    }
  }

  /// Rebuild the window from persisted records, keeping the newest `capacity`.
  pub fn from_records(records: Vec<EmissionRecord>, capacity: usize) -> Self {
    let mut recent = Self::new(capacity);
    for record in records {
      recent.push(record);
    }
    recent
  }

  pub fn contains(&self, key: &DedupKey) -> bool {
    self.index.contains(key)
  }

  /// Record `key` as emitted now.
  pub fn insert(&mut self, key: DedupKey) {
    self.push(EmissionRecord {
      key,
      emitted_at: Utc::now(),
    });
  }

  fn push(&mut self, record: EmissionRecord) {
    if self.index.contains(&record.key) {
      return;
    }
    self.index.insert(record.key.clone());
    self.records.push_back(record);
    while self.records.len() > self.capacity {
      if let Some(evicted) = self.records.pop_front() {
        self.index.remove(&evicted.key);
      }
    }
  }

  pub fn records(&self) -> Vec<EmissionRecord> {
    self.records.iter().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

/// A candidate that survived filtering.
#[derive(Debug, Clone)]
pub struct Accepted {
  pub event: CandidateEvent,
  pub key: DedupKey,
  pub comparison: Cursor,
}

/// Result of [`DedupEmitter::filter`].
#[derive(Debug, Default)]
pub struct Filtered {
  /// Survivors in ascending comparison-key order.
  pub accepted: Vec<Accepted>,
  /// Candidates dropped as already emitted.
  pub duplicates: usize,
  /// Candidates dropped because their comparison key has another kind.
  pub mismatched: usize,
  /// Candidates dropped by the bounded back-fill policy.
  pub backfill_skipped: usize,
  /// Keys of back-fill skipped events to record as if emitted.
  pub held_back: Vec<DedupKey>,
}

/// Result of [`DedupEmitter::emit`].
#[derive(Debug, Default)]
pub struct EmitOutcome {
  pub emitted: usize,
  /// Greatest comparison key among emitted events.
  pub max_key: Option<Cursor>,
  /// The event that could not be emitted. Events after it were not attempted.
  pub failure: Option<(DedupKey, EmitError)>,
}

/// Applies a [`DedupeStrategy`] to batches and emits the survivors.
#[derive(Debug, Clone, Copy)]
pub struct DedupEmitter {
  strategy: DedupeStrategy,
  backfill: BackfillPolicy,
}

impl DedupEmitter {
  pub fn new(strategy: DedupeStrategy, backfill: BackfillPolicy) -> Self {
    Self { strategy, backfill }
  }

  /// Drop already-emitted candidates and order the rest.
  ///
  /// `first_poll` marks a polling run with no cursor. Only such a run
  /// applies the back-fill policy; webhook batches are live and always
  /// kept whole.
  pub fn filter(
    &self,
    source: &dyn PollingSource,
    batch: Vec<CandidateEvent>,
    cursor: Option<&Cursor>,
    recent: &RecentKeys,
    first_poll: bool,
  ) -> Filtered {
    let mut filtered = Filtered::default();
    let mut candidates: Vec<(Accepted, bool)> = Vec::new();
    let mut batch_keys: HashSet<DedupKey> = HashSet::new();
    let mut batch_comparisons: HashSet<Cursor> = HashSet::new();
    let mut reference_kind = cursor.map(Cursor::kind);

    for event in batch {
      let key = source.dedup_key(&event);
      let comparison = source.comparison_key(&event);

      match reference_kind {
        Some(kind) if kind != comparison.kind() => {
          warn!(
            key = %key,
            expected = kind,
            found = comparison.kind(),
            "dropping event with mismatched comparison key"
          );
          filtered.mismatched += 1;
          continue;
        }
        None => reference_kind = Some(comparison.kind()),
        Some(_) => {}
      }

      let seen = recent.contains(&key);
      let repeated = batch_keys.contains(&key);
      let stale = match (self.strategy, cursor) {
        (_, None) => false,
        (DedupeStrategy::Unique, Some(cursor)) => {
          matches!(comparison.partial_cmp(cursor), Some(Ordering::Less))
        }
        (DedupeStrategy::Greatest, Some(cursor)) => !comparison.is_after(cursor),
      };
      let tie = self.strategy == DedupeStrategy::Greatest
        && !seen
        && batch_comparisons.contains(&comparison);

      if repeated || stale || tie {
        debug!(key = %key, comparison = %comparison, repeated, stale, tie, "dropping duplicate");
        filtered.duplicates += 1;
        continue;
      }

      batch_keys.insert(key.clone());
      if !seen {
        batch_comparisons.insert(comparison.clone());
      }
      candidates.push((
        Accepted {
          event,
          key,
          comparison,
        },
        seen,
      ));
    }

    // Stable sort keeps upstream order among equal comparison keys.
    candidates.sort_by(|(a, _), (b, _)| {
      a.comparison
        .partial_cmp(&b.comparison)
        .unwrap_or(Ordering::Equal)
    });

    // Back-fill ranks every candidate, emitted or not, so a retried first
    // run keeps the same latest slice.
    if first_poll
      && let BackfillPolicy::Latest { count } = self.backfill
      && candidates.len() > count
    {
      let skip = candidates.len() - count;
      let floor = candidates.get(skip).map(|(kept, _)| kept.comparison.clone());
      for (skipped, seen) in candidates.drain(..skip) {
        if seen {
          filtered.duplicates += 1;
          continue;
        }
        // Skipped events tied with the oldest kept one are not stale at the
        // next cursor, so only the window keeps them out.
        if floor.as_ref() == Some(&skipped.comparison) {
          filtered.held_back.push(skipped.key);
        }
        filtered.backfill_skipped += 1;
      }
      debug!(
        skipped = filtered.backfill_skipped,
        kept = count,
        "bounded back-fill on first run"
      );
    }

    for (candidate, seen) in candidates {
      if seen {
        debug!(key = %candidate.key, "dropping already emitted event");
        filtered.duplicates += 1;
      } else {
        filtered.accepted.push(candidate);
      }
    }

    filtered
  }

  /// Emit accepted events in order, recording each successful emission.
  ///
  /// Stops at the first sink failure; `recent` then holds exactly the
  /// events emitted before it.
  pub fn emit(
    &self,
    source: &dyn PollingSource,
    accepted: Vec<Accepted>,
    sink: &dyn EventSink,
    recent: &mut RecentKeys,
  ) -> EmitOutcome {
    let mut outcome = EmitOutcome::default();

    for Accepted {
      event,
      key,
      comparison,
    } in accepted
    {
      let meta = source.emit_meta(&event, &key);
      let emitted = EmittedEvent {
        meta,
        payload: event.payload,
      };

      if let Err(e) = sink.emit(emitted) {
        outcome.failure = Some((key, e));
        break;
      }

      recent.insert(key);
      outcome.emitted += 1;
      outcome.max_key = Some(comparison);
    }

    outcome
  }
}
