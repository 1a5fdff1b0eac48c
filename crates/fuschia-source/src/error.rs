//! Source error types.

use std::fmt;

use fuschia_host_kv::KvError;

/// Category of an upstream fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
  /// Connection, DNS, TLS or timeout failure.
  Network,
  /// The upstream rejected our credentials (401/403).
  Auth,
  /// The upstream asked us to slow down (429).
  RateLimited,
  /// Any other non-success HTTP status.
  Status(u16),
  /// The response could not be interpreted as a page of items.
  InvalidResponse,
}

impl fmt::Display for FetchErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Network => write!(f, "network"),
      Self::Auth => write!(f, "auth"),
      Self::RateLimited => write!(f, "rate limit"),
      Self::Status(code) => write!(f, "status {code}"),
      Self::InvalidResponse => write!(f, "invalid response"),
    }
  }
}

/// Failure to fetch a page from the upstream API.
///
/// Fetch failures abort the run before any state is touched; the next tick
/// retries from the same cursor.
#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct FetchError {
  pub kind: FetchErrorKind,
  pub message: String,
}

impl FetchError {
  pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(FetchErrorKind::Network, message)
  }

  pub fn auth(message: impl Into<String>) -> Self {
    Self::new(FetchErrorKind::Auth, message)
  }

  pub fn rate_limited(message: impl Into<String>) -> Self {
    Self::new(FetchErrorKind::RateLimited, message)
  }

  pub fn status(code: u16, message: impl Into<String>) -> Self {
    Self::new(FetchErrorKind::Status(code), message)
  }

  pub fn invalid_response(message: impl Into<String>) -> Self {
    Self::new(FetchErrorKind::InvalidResponse, message)
  }
}

/// A single malformed item or webhook body.
///
/// Parse errors are isolated: the item is dropped and the rest of the batch
/// continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error: {message}")]
pub struct ParseError {
  pub message: String,
}

impl ParseError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// The platform's emit interface refused an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("emit failed: {message}")]
pub struct EmitError {
  pub message: String,
}

impl EmitError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// Errors comparing or decoding cursors.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
  /// Two cursors of different kinds were compared.
  #[error("cursor kind mismatch: expected {expected}, found {found}")]
  KindMismatch {
    expected: &'static str,
    found: &'static str,
  },

  /// Persisted state could not be decoded.
  #[error("corrupt state under '{key}': {message}")]
  Corrupt { key: String, message: String },
}

/// Errors that fail a whole source run.
///
/// In every case the cursor is left at its pre-run value.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
  /// Fetching from the upstream API failed.
  #[error("fetch failed: {0}")]
  Fetch(#[from] FetchError),

  /// Emitting an event failed; later events in the batch were not emitted.
  #[error("failed to emit event '{key}'")]
  Emission {
    key: String,
    #[source]
    source: EmitError,
  },

  /// Source state could not be read or written.
  #[error("state persistence failed: {0}")]
  Persistence(#[from] KvError),

  /// Cursor state is inconsistent.
  #[error("cursor error: {0}")]
  Cursor(#[from] CursorError),

  /// The runner's trigger channel is closed.
  #[error("source runner channel closed")]
  ChannelClosed,
}

impl RunError {
  /// Whether the next scheduled run may succeed without intervention.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Fetch(e) => !matches!(e.kind, FetchErrorKind::Auth),
      Self::Emission { .. } | Self::Persistence(_) => true,
      Self::Cursor(_) | Self::ChannelClosed => false,
    }
  }
}
