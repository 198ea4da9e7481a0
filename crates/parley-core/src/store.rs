//! The `RemoteStore` trait: the contract of the realtime document store.
//!
//! The trait is implemented by storage backends (e.g. `parley-store-sqlite`).
//! The engine depends on this abstraction, not on any concrete backend.

use std::future::Future;

use futures::stream::BoxStream;

use crate::document::{Collection, Document, Fields, Query};

/// A live query: every item is the complete current result set, never a
/// diff. Dropping the stream unsubscribes.
pub type SnapshotStream<E> = BoxStream<'static, Result<Vec<Document>, E>>;

/// Abstraction over a realtime document store.
///
/// Replication, durability and indexing are the backend's concern. Writes
/// are last-writer-wins per field, except for the monotonic array operations
/// in [`FieldValue`](crate::document::FieldValue).
///
/// All methods return `Send` futures so the trait can be driven from spawned
/// tokio tasks.
pub trait RemoteStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Open a live query. The first item is the current result set.
  fn subscribe(
    &self,
    query: Query,
  ) -> impl Future<Output = Result<SnapshotStream<Self::Error>, Self::Error>> + Send + '_;

  /// One-shot equivalent of [`RemoteStore::subscribe`].
  fn get_once<'a>(
    &'a self,
    query: &'a Query,
  ) -> impl Future<Output = Result<Vec<Document>, Self::Error>> + Send + 'a;

  /// Fetch a single document by id. Returns `None` if absent.
  fn get_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
  ) -> impl Future<Output = Result<Option<Document>, Self::Error>> + Send + 'a;

  // ── Writes ────────────────────────────────────────────────────────────

  /// Create a document with a store-assigned id and return that id.
  fn create_doc(
    &self,
    collection: Collection,
    fields: Fields,
  ) -> impl Future<Output = Result<String, Self::Error>> + Send + '_;

  /// Write a document at `id`. With `merge` the fields are applied on top of
  /// any existing document; without it the document is replaced.
  fn set_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
    fields: Fields,
    merge: bool,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Apply field deltas to an existing document. Fails if it is absent.
  fn update_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
    fields: Fields,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
