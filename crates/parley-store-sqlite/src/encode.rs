//! Encoding and decoding helpers between documents and the plain-text
//! representations stored in SQLite columns.

use parley_core::document::{Collection, Document};
use serde_json::{Map, Value};

/// A row as read from the `documents` table, before JSON decoding.
pub struct RawDocument {
  pub doc_id: String,
  pub body:   String,
}

impl RawDocument {
  pub fn into_document(self) -> serde_json::Result<Document> {
    Ok(Document::new(self.doc_id, decode_body(&self.body)?))
  }
}

pub fn encode_collection(collection: Collection) -> String { collection.to_string() }

pub fn encode_body(fields: &Map<String, Value>) -> serde_json::Result<String> {
  serde_json::to_string(fields)
}

/// Decode a stored body. Anything but a JSON object decodes as empty.
pub fn decode_body(body: &str) -> serde_json::Result<Map<String, Value>> {
  match serde_json::from_str(body)? {
    Value::Object(map) => Ok(map),
    _ => Ok(Map::new()),
  }
}
