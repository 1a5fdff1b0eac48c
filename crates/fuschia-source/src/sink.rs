//! Event emission interface and implementations.
//!
//! The engine calls [`EventSink::emit`] once per surviving event, in order.
//! A successful return is required before the cursor may move past the event.

use std::io::Write;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::EmitError;
use crate::event::EmittedEvent;

/// Trait for the platform's emit interface.
pub trait EventSink: Send + Sync {
  /// Hand one event to the platform.
  fn emit(&self, event: EmittedEvent) -> Result<(), EmitError>;
}

/// A sink that keeps emitted events in memory.
///
/// Useful for tests and for inspecting a single run.
#[derive(Debug, Default)]
pub struct MemorySink {
  events: Mutex<Vec<EmittedEvent>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of everything emitted so far.
  pub fn events(&self) -> Vec<EmittedEvent> {
    self
      .events
      .lock()
      .map(|events| events.clone())
      .unwrap_or_default()
  }

  /// IDs (dedup keys) of everything emitted so far.
  pub fn ids(&self) -> Vec<String> {
    self.events().into_iter().map(|e| e.meta.id).collect()
  }
}

impl EventSink for MemorySink {
  fn emit(&self, event: EmittedEvent) -> Result<(), EmitError> {
    let mut events = self
      .events
      .lock()
      .map_err(|_| EmitError::new("memory sink lock poisoned"))?;
    events.push(event);
    Ok(())
  }
}

/// A sink that forwards events to an unbounded channel.
///
/// Unlike a notifier, a closed channel is an emission failure: the event was
/// not delivered, so the cursor must not advance past it.
#[derive(Debug, Clone)]
pub struct ChannelSink {
  sender: mpsc::UnboundedSender<EmittedEvent>,
}

impl ChannelSink {
  pub fn new(sender: mpsc::UnboundedSender<EmittedEvent>) -> Self {
    Self { sender }
  }
}

impl EventSink for ChannelSink {
  fn emit(&self, event: EmittedEvent) -> Result<(), EmitError> {
    self
      .sender
      .send(event)
      .map_err(|_| EmitError::new("event channel closed"))
  }
}

/// A sink that writes one JSON document per line.
pub struct JsonLinesSink<W: Write + Send> {
  writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
  pub fn new(writer: W) -> Self {
    Self {
      writer: Mutex::new(writer),
    }
  }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
  fn emit(&self, event: EmittedEvent) -> Result<(), EmitError> {
    let line = serde_json::to_string(&event).map_err(|e| EmitError::new(e.to_string()))?;
    let mut writer = self
      .writer
      .lock()
      .map_err(|_| EmitError::new("writer lock poisoned"))?;
    writeln!(writer, "{line}")
      .and_then(|_| writer.flush())
      .map_err(|e| EmitError::new(e.to_string()))
  }
}
