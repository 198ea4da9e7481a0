//! Error type for `parley-store-sqlite`.

use parley_core::document::Collection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// `update_doc` targeted a document that does not exist.
  #[error("document not found: {collection}/{id}")]
  DocumentNotFound { collection: Collection, id: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
