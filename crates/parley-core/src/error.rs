//! Error types for `parley-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("cannot decode document {id}: {source}")]
  Decode {
    id:     String,
    #[source]
    source: serde_json::Error,
  },

  #[error("malformed conversation ref: {0:?}")]
  MalformedRef(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
