//! SQL schema for the Parley SQLite store.
//!
//! Documents are stored as opaque JSON bodies; queries are evaluated in
//! process by [`parley_core::document::Query`].

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- `seq` preserves first-insertion order, which breaks ties when a query
-- orders by a field with equal values.
CREATE TABLE IF NOT EXISTS documents (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    collection  TEXT NOT NULL,   -- wire name, e.g. 'directChats'
    doc_id      TEXT NOT NULL,
    body        TEXT NOT NULL,   -- JSON object of fields
    updated_at  TEXT NOT NULL,   -- RFC 3339 UTC of the last write
    UNIQUE (collection, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
";

/// Insert a document or overwrite its body, keeping its original `seq`.
pub const UPSERT: &str = "
INSERT INTO documents (collection, doc_id, body, updated_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (collection, doc_id)
DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
";
