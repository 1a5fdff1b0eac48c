use serde::{Deserialize, Serialize};

/// Default polling cadence for sources, in seconds (15 minutes).
pub const DEFAULT_POLLING_INTERVAL_SECONDS: u64 = 15 * 60;

/// Timer configuration for the polling fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
  pub interval_seconds: u64,
}

impl Default for TimerConfig {
  fn default() -> Self {
    Self {
      interval_seconds: DEFAULT_POLLING_INTERVAL_SECONDS,
    }
  }
}
