use thiserror::Error;

/// Errors returned by key-value backends.
#[derive(Debug, Error)]
pub enum KvError {
  /// The backend could not be reached or rejected the operation.
  #[error("kv backend error: {message}")]
  Backend { message: String },
}

impl KvError {
  pub fn backend(message: impl Into<String>) -> Self {
    Self::Backend {
      message: message.into(),
    }
  }
}
