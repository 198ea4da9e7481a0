//! Integration tests for `SqliteStore` against an in-memory database.

use std::time::Duration;

use futures::StreamExt as _;
use serde_json::json;

use parley_core::{
  document::{Collection, Direction, FieldValue, Filter, Query, fields},
  store::RemoteStore,
};

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

/// Wait briefly for the next emission of a live query.
async fn next<S>(stream: &mut S) -> Vec<String>
where
  S: futures::Stream<Item = crate::Result<Vec<parley_core::document::Document>>>
    + Unpin,
{
  let docs = tokio::time::timeout(Duration::from_secs(2), stream.next())
    .await
    .expect("emission within timeout")
    .expect("stream still open")
    .expect("emission is ok");
  docs.into_iter().map(|d| d.id).collect()
}

// ─── Documents ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_doc() {
  let s = store().await;

  let id = s
    .create_doc(
      Collection::Groups,
      fields([
        ("name", FieldValue::set("team")),
        ("members", FieldValue::set(json!(["u1", "u2"]))),
      ]),
    )
    .await
    .unwrap();

  let doc = s.get_doc(Collection::Groups, &id).await.unwrap().unwrap();
  assert_eq!(doc.id, id);
  assert_eq!(doc.get("name"), Some(&json!("team")));
  assert_eq!(doc.get("members"), Some(&json!(["u1", "u2"])));
}

#[tokio::test]
async fn get_doc_missing_returns_none() {
  let s = store().await;
  let doc = s.get_doc(Collection::Users, "nobody").await.unwrap();
  assert!(doc.is_none());
}

#[tokio::test]
async fn set_doc_merge_keeps_other_fields() {
  let s = store().await;
  s.set_doc(
    Collection::Users,
    "u1",
    fields([
      ("username", FieldValue::set("ada")),
      ("online", FieldValue::set(false)),
    ]),
    false,
  )
  .await
  .unwrap();

  s.set_doc(Collection::Users, "u1", fields([("online", FieldValue::set(true))]), true)
    .await
    .unwrap();

  let doc = s.get_doc(Collection::Users, "u1").await.unwrap().unwrap();
  assert_eq!(doc.get("username"), Some(&json!("ada")));
  assert_eq!(doc.get("online"), Some(&json!(true)));
}

#[tokio::test]
async fn set_doc_without_merge_replaces() {
  let s = store().await;
  s.set_doc(Collection::Users, "u1", fields([("username", FieldValue::set("ada"))]), false)
    .await
    .unwrap();
  s.set_doc(Collection::Users, "u1", fields([("online", FieldValue::set(true))]), false)
    .await
    .unwrap();

  let doc = s.get_doc(Collection::Users, "u1").await.unwrap().unwrap();
  assert!(doc.get("username").is_none());
  assert_eq!(doc.get("online"), Some(&json!(true)));
}

#[tokio::test]
async fn update_doc_missing_fails() {
  let s = store().await;
  let err = s
    .update_doc(Collection::Messages, "m1", fields([("deleted", FieldValue::set(true))]))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::DocumentNotFound { collection: Collection::Messages, .. }
  ));
}

#[tokio::test]
async fn update_doc_applies_array_operations() {
  let s = store().await;
  s.set_doc(
    Collection::Messages,
    "m1",
    fields([("seenBy", FieldValue::set(json!(["u1"])))]),
    false,
  )
  .await
  .unwrap();

  s.update_doc(Collection::Messages, "m1", fields([("seenBy", FieldValue::union("u2"))]))
    .await
    .unwrap();
  s.update_doc(Collection::Messages, "m1", fields([("seenBy", FieldValue::union("u2"))]))
    .await
    .unwrap();
  s.update_doc(Collection::Messages, "m1", fields([("seenBy", FieldValue::remove("u1"))]))
    .await
    .unwrap();

  let doc = s.get_doc(Collection::Messages, "m1").await.unwrap().unwrap();
  assert_eq!(doc.get("seenBy"), Some(&json!(["u2"])));
}

#[tokio::test]
async fn server_timestamp_is_resolved_on_write() {
  let s = store().await;
  let id = s
    .create_doc(
      Collection::Notifications,
      fields([("createdAt", FieldValue::ServerTimestamp)]),
    )
    .await
    .unwrap();

  let doc = s.get_doc(Collection::Notifications, &id).await.unwrap().unwrap();
  let raw = doc.get("createdAt").and_then(|v| v.as_str()).unwrap();
  assert!(chrono::DateTime::parse_from_rfc3339(raw).is_ok());
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_once_filters_and_orders() {
  let s = store().await;
  for (id, chat, at) in [
    ("m1", "direct:d1", "2024-01-01T00:00:03Z"),
    ("m2", "direct:d2", "2024-01-01T00:00:01Z"),
    ("m3", "direct:d1", "2024-01-01T00:00:01Z"),
  ] {
    s.set_doc(
      Collection::Messages,
      id,
      fields([
        ("chatRef", FieldValue::set(chat)),
        ("createdAt", FieldValue::set(at)),
      ]),
      false,
    )
    .await
    .unwrap();
  }

  let query = Query::new(Collection::Messages)
    .filter(Filter::eq("chatRef", "direct:d1"))
    .order_by("createdAt", Direction::Ascending);
  let ids: Vec<_> = s
    .get_once(&query)
    .await
    .unwrap()
    .into_iter()
    .map(|d| d.id)
    .collect();
  assert_eq!(ids, vec!["m3", "m1"]);
}

#[tokio::test]
async fn collections_are_isolated() {
  let s = store().await;
  s.set_doc(Collection::Users, "x", fields([]), false).await.unwrap();
  s.set_doc(Collection::Groups, "x", fields([]), false).await.unwrap();

  let users = s.get_once(&Query::new(Collection::Users)).await.unwrap();
  assert_eq!(users.len(), 1);
  assert_eq!(users[0].id, "x");
}

// ─── Live queries ────────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_emits_initial_then_full_result_sets() {
  let s = store().await;
  s.set_doc(
    Collection::Groups,
    "g1",
    fields([("members", FieldValue::set(json!(["u1"])))]),
    false,
  )
  .await
  .unwrap();

  let query =
    Query::new(Collection::Groups).filter(Filter::array_contains("members", "u1"));
  let mut stream = s.subscribe(query).await.unwrap();
  assert_eq!(next(&mut stream).await, vec!["g1"]);

  s.set_doc(
    Collection::Groups,
    "g2",
    fields([("members", FieldValue::set(json!(["u1", "u2"])))]),
    false,
  )
  .await
  .unwrap();
  assert_eq!(next(&mut stream).await, vec!["g1", "g2"]);

  // Leaving a group drops it from the next full result set.
  s.update_doc(Collection::Groups, "g1", fields([("members", FieldValue::remove("u1"))]))
    .await
    .unwrap();
  assert_eq!(next(&mut stream).await, vec!["g2"]);
}

#[tokio::test]
async fn unrelated_writes_do_not_emit() {
  let s = store().await;
  let mut stream = s.subscribe(Query::new(Collection::Groups)).await.unwrap();
  assert!(next(&mut stream).await.is_empty());

  s.set_doc(Collection::Users, "u1", fields([]), false).await.unwrap();

  let quiet = tokio::time::timeout(Duration::from_millis(150), stream.next()).await;
  assert!(quiet.is_err(), "no emission expected for another collection");
}

#[tokio::test]
async fn dropping_stream_ends_feed() {
  let s = store().await;
  let stream = s.subscribe(Query::new(Collection::Users)).await.unwrap();
  assert_eq!(s.active_feeds(), 1);

  drop(stream);
  for _ in 0..100 {
    if s.active_feeds() == 0 {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("feed task still running after the stream was dropped");
}
