//! Fuschia Host HTTP
//!
//! A [`PollingSource`](fuschia_source::PollingSource) for upstream APIs that
//! list items as JSON over HTTP. Everything provider specific lives in the
//! [`HttpSourceDef`](fuschia_source_config::HttpSourceDef): where the items
//! are in a listing response, which attributes identify and order them, how
//! the cursor and page token are passed back, and how webhook bodies are
//! unpacked.

mod error;
mod source;

pub use error::HttpSourceError;
pub use source::HttpJsonSource;
