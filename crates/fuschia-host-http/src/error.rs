use fuschia_source_config::ConfigError;

/// Errors building an HTTP source from its definition.
#[derive(Debug, thiserror::Error)]
pub enum HttpSourceError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("unsupported HTTP method: {0}")]
  InvalidMethod(String),

  #[error("invalid request url '{url}': {message}")]
  InvalidUrl { url: String, message: String },

  #[error("failed to build HTTP client: {0}")]
  Client(#[from] reqwest::Error),
}
