//! [`SqliteStore`], the SQLite implementation of [`RemoteStore`].

use std::{
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use chrono::Utc;
use futures::StreamExt as _;
use rusqlite::OptionalExtension as _;
use serde_json::Map;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_core::{
  document::{Collection, Document, Fields, Query, apply_fields, encode_timestamp},
  store::{RemoteStore, SnapshotStream},
};

use crate::{
  Error, Result,
  encode::{RawDocument, decode_body, encode_body, encode_collection},
  schema::{SCHEMA, UPSERT},
};

/// Capacity of the in-process change feed. A lagging subscriber re-queries,
/// so overflow only costs an extra read.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Emissions buffered per subscription before the feed task waits.
const SUBSCRIPTION_BUFFER: usize = 16;

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Parley document store backed by a single SQLite file.
///
/// Cloning is cheap; clones share the connection, the change feed and the
/// subscription counter.
#[derive(Clone)]
pub struct SqliteStore {
  conn:    tokio_rusqlite::Connection,
  changes: broadcast::Sender<Collection>,
  feeds:   Arc<AtomicUsize>,
}

/// How a write combines with the document already stored at its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
  /// Start from an empty document.
  Replace,
  /// Start from the stored document, or an empty one.
  Merge,
  /// Start from the stored document; fail if there is none.
  Update,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::with_connection(conn).await
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::with_connection(conn).await
  }

  async fn with_connection(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
    let store = Self {
      conn,
      changes,
      feeds: Arc::new(AtomicUsize::new(0)),
    };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Number of live subscriptions whose feed task is still running.
  pub fn active_feeds(&self) -> usize { self.feeds.load(Ordering::SeqCst) }

  /// Every document of `collection`, in first-insertion order.
  async fn load_collection(&self, collection: Collection) -> Result<Vec<Document>> {
    let coll = encode_collection(collection);

    let rows: Vec<RawDocument> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT doc_id, body FROM documents WHERE collection = ?1 ORDER BY seq",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![coll], |r| {
            Ok(RawDocument {
              doc_id: r.get(0)?,
              body:   r.get(1)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|raw| raw.into_document().map_err(Error::from))
      .collect()
  }

  /// Read-modify-write of one document inside a single transaction.
  async fn write(
    &self,
    collection: Collection,
    id: String,
    fields: Fields,
    mode: WriteMode,
  ) -> Result<()> {
    let now = Utc::now();
    let coll = encode_collection(collection);
    let doc_id = id.clone();

    // The outer result carries database failures; the inner one carries
    // body decode failures and whether a document was written at all.
    let written: serde_json::Result<bool> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
          .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND doc_id = ?2",
            rusqlite::params![coll, doc_id],
            |r| r.get(0),
          )
          .optional()?;

        let stored = match existing.as_deref().map(decode_body).transpose() {
          Ok(stored) => stored,
          Err(e) => return Ok(Err(e)),
        };
        let mut body = match (mode, stored) {
          (WriteMode::Replace, _) => Map::new(),
          (WriteMode::Merge, stored) => stored.unwrap_or_default(),
          (WriteMode::Update, Some(stored)) => stored,
          (WriteMode::Update, None) => return Ok(Ok(false)),
        };
        apply_fields(&mut body, fields, now);

        let encoded = match encode_body(&body) {
          Ok(encoded) => encoded,
          Err(e) => return Ok(Err(e)),
        };
        tx.execute(
          UPSERT,
          rusqlite::params![coll, doc_id, encoded, encode_timestamp(now)],
        )?;
        tx.commit()?;
        Ok(Ok(true))
      })
      .await?;

    if !written? {
      return Err(Error::DocumentNotFound { collection, id });
    }
    self.announce(collection);
    Ok(())
  }

  /// Tell every open subscription that `collection` changed.
  fn announce(&self, collection: Collection) {
    // No receivers simply means nobody is subscribed.
    let _ = self.changes.send(collection);
  }

  /// Drive one live query until its consumer goes away or a re-query fails.
  async fn run_feed(
    self,
    query: Query,
    mut changes: broadcast::Receiver<Collection>,
    initial: Vec<Document>,
    tx: mpsc::Sender<Result<Vec<Document>>>,
    _guard: FeedGuard,
  ) {
    let mut last = initial.clone();
    if tx.send(Ok(initial)).await.is_err() {
      return;
    }

    loop {
      tokio::select! {
        _ = tx.closed() => break,
        change = changes.recv() => match change {
          Ok(collection) if collection != query.collection => continue,
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, collection = %query.collection, "change feed lagged; re-querying");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        },
      }

      match self.get_once(&query).await {
        Ok(docs) if docs == last => {}
        Ok(docs) => {
          last = docs.clone();
          if tx.send(Ok(docs)).await.is_err() {
            break;
          }
        }
        Err(e) => {
          warn!(error = %e, collection = %query.collection, "live query failed");
          let _ = tx.send(Err(e)).await;
          break;
        }
      }
    }
  }
}

/// Counts a running feed task for [`SqliteStore::active_feeds`].
struct FeedGuard(Arc<AtomicUsize>);

impl FeedGuard {
  fn enter(counter: Arc<AtomicUsize>) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for FeedGuard {
  fn drop(&mut self) { self.0.fetch_sub(1, Ordering::SeqCst); }
}

// ─── RemoteStore impl ────────────────────────────────────────────────────────

impl RemoteStore for SqliteStore {
  type Error = Error;

  // ── Reads ─────────────────────────────────────────────────────────────

  async fn subscribe(&self, query: Query) -> Result<SnapshotStream<Error>> {
    // Register for changes before the initial read so no write can slip
    // between the two.
    let changes = self.changes.subscribe();
    let initial = self.get_once(&query).await?;

    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let guard = FeedGuard::enter(self.feeds.clone());
    tokio::spawn(self.clone().run_feed(query, changes, initial, tx, guard));

    let stream = futures::stream::unfold(rx, |mut rx| async move {
      rx.recv().await.map(|item| (item, rx))
    });
    Ok(stream.boxed())
  }

  async fn get_once<'a>(&'a self, query: &'a Query) -> Result<Vec<Document>> {
    let docs = self.load_collection(query.collection).await?;
    Ok(query.apply(docs))
  }

  async fn get_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
  ) -> Result<Option<Document>> {
    let coll = encode_collection(collection);
    let doc_id = id.to_owned();

    let raw: Option<RawDocument> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT doc_id, body FROM documents WHERE collection = ?1 AND doc_id = ?2",
              rusqlite::params![coll, doc_id],
              |r| {
                Ok(RawDocument {
                  doc_id: r.get(0)?,
                  body:   r.get(1)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    Ok(raw.map(RawDocument::into_document).transpose()?)
  }

  // ── Writes ────────────────────────────────────────────────────────────

  async fn create_doc(&self, collection: Collection, fields: Fields) -> Result<String> {
    let id = Uuid::new_v4().simple().to_string();
    self
      .write(collection, id.clone(), fields, WriteMode::Replace)
      .await?;
    Ok(id)
  }

  async fn set_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
    fields: Fields,
    merge: bool,
  ) -> Result<()> {
    let mode = if merge { WriteMode::Merge } else { WriteMode::Replace };
    self.write(collection, id.to_owned(), fields, mode).await
  }

  async fn update_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
    fields: Fields,
  ) -> Result<()> {
    self
      .write(collection, id.to_owned(), fields, WriteMode::Update)
      .await
  }
}
