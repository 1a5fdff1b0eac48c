use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("source_id must not be empty")]
  MissingSourceId,

  #[error("invalid value for '{field}': {message}")]
  InvalidField { field: &'static str, message: String },
}

impl ConfigError {
  pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
    Self::InvalidField {
      field,
      message: message.into(),
    }
  }
}
