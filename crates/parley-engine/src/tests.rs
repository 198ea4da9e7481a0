//! Engine integration tests: real engines sharing one in-memory
//! `SqliteStore`, so every write travels through the live queries exactly as
//! it would between two clients.

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use futures::StreamExt as _;
use serde_json::json;
use tokio::sync::Notify;

use parley_core::{
  conversation::ConversationRef,
  document::{Collection, Document, FieldValue, Fields, Filter, Query, fields},
  message::{Draft, Message},
  snapshot::SnapshotStore,
  store::{RemoteStore, SnapshotStream},
  typing::{TypingSignal, now_ms, typing_doc_id},
  user::Identity,
  view::{self, DeliveryLabel},
};
use parley_store_sqlite::SqliteStore;

use crate::{Engine, EngineConfig, EngineEvent, Error, Membership, Slot, SlotState};

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn config() -> EngineConfig {
  EngineConfig {
    auto_mark_seen: false,
    typing_quiet_ms: 100,
    ..Default::default()
  }
}

fn identity(uid: &str) -> Identity {
  let mut name = uid.to_owned();
  name[..1].make_ascii_uppercase();
  Identity::new(uid).with_display_name(name)
}

async fn signed_in<S: RemoteStore + 'static>(store: S, uid: &str) -> Engine<S> {
  let engine = Engine::new(store, config());
  engine.start(identity(uid)).await.expect("start");
  engine
}

/// Poll `check` until it holds, failing the test after two seconds.
async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
  for _ in 0..200 {
    if check() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("timed out waiting for {what}");
}

fn has_conversation<S: RemoteStore + 'static>(engine: &Engine<S>, r: &ConversationRef) -> bool {
  engine.read(|s| s.conversation(r).is_some())
}

fn message_count<S: RemoteStore + 'static>(engine: &Engine<S>, r: &ConversationRef) -> usize {
  engine.read(|s| s.messages(r).len())
}

/// Ada and Bea signed in on the same store, sharing a direct chat that both
/// snapshots already contain.
async fn ada_and_bea(
  store: &SqliteStore,
) -> (Engine<SqliteStore>, Engine<SqliteStore>, ConversationRef) {
  let ada = signed_in(store.clone(), "ada").await;
  let bea = signed_in(store.clone(), "bea").await;
  let chat = ada.create_direct("bea").await.unwrap();
  wait_until("chat in both snapshots", || {
    has_conversation(&ada, &chat) && has_conversation(&bea, &chat)
  })
  .await;
  (ada, bea, chat)
}

// ─── Fault injection ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum Fault {
  #[error("injected fault")]
  Injected,
  #[error(transparent)]
  Store(#[from] parley_store_sqlite::Error),
}

/// How long a slowed `is_typing = false` write takes.
const SLOW_CLEAR: Duration = Duration::from_millis(250);

/// Live message queries open through a `FaultyStore`, and the most ever open
/// at once.
#[derive(Debug, Default)]
struct FeedCounter {
  open: AtomicUsize,
  peak: AtomicUsize,
}

/// Held by a message stream for as long as it lives.
struct FeedTicket(Arc<FeedCounter>);

impl FeedTicket {
  fn enter(counter: Arc<FeedCounter>) -> Self {
    let open = counter.open.fetch_add(1, Ordering::SeqCst) + 1;
    counter.peak.fetch_max(open, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for FeedTicket {
  fn drop(&mut self) { self.0.open.fetch_sub(1, Ordering::SeqCst); }
}

/// Wraps a `SqliteStore` to inject faults and delays:
///
/// - writes fail while `fail_writes` is set;
/// - live queries on `breakable` fail after their first emission once `trip`
///   is notified;
/// - message emissions for `held` after the first wait for `gate`;
/// - the next message read waits for `gate` once `stall_reads` is set;
/// - typing clears take [`SLOW_CLEAR`] when `slow_clears` is set.
#[derive(Clone)]
struct FaultyStore {
  inner:         SqliteStore,
  fail_writes:   Arc<AtomicBool>,
  breakable:     Option<Collection>,
  trip:          Arc<Notify>,
  held:          Option<ConversationRef>,
  stall_reads:   Arc<AtomicBool>,
  gate:          Arc<Notify>,
  slow_clears:   bool,
  message_feeds: Arc<FeedCounter>,
}

impl FaultyStore {
  fn new(inner: SqliteStore) -> Self {
    Self {
      inner,
      fail_writes: Arc::new(AtomicBool::new(false)),
      breakable: None,
      trip: Arc::new(Notify::new()),
      held: None,
      stall_reads: Arc::new(AtomicBool::new(false)),
      gate: Arc::new(Notify::new()),
      slow_clears: false,
      message_feeds: Arc::default(),
    }
  }

  fn breaking(mut self, collection: Collection) -> Self {
    self.breakable = Some(collection);
    self
  }

  fn holding(mut self, conversation: ConversationRef) -> Self {
    self.held = Some(conversation);
    self
  }

  fn with_slow_typing_clears(mut self) -> Self {
    self.slow_clears = true;
    self
  }

  fn check_write(&self) -> Result<(), Fault> {
    if self.fail_writes.load(Ordering::SeqCst) {
      Err(Fault::Injected)
    } else {
      Ok(())
    }
  }
}

impl RemoteStore for FaultyStore {
  type Error = Fault;

  async fn subscribe(&self, query: Query) -> Result<SnapshotStream<Fault>, Fault> {
    let breaks = self.breakable == Some(query.collection);
    let held = self
      .held
      .as_ref()
      .is_some_and(|c| query.filters.contains(&Filter::eq("chatRef", c.to_string())));
    let ticket = (query.collection == Collection::Messages)
      .then(|| FeedTicket::enter(self.message_feeds.clone()));

    let stream = self.inner.subscribe(query).await?.map(move |r| {
      let _ticket = &ticket;
      r.map_err(Fault::from)
    });
    let stream = if held {
      let gate = self.gate.clone();
      let mut first = true;
      stream
        .then(move |item| {
          let hold = !std::mem::take(&mut first);
          let gate = gate.clone();
          async move {
            if hold {
              gate.notified().await;
            }
            item
          }
        })
        .boxed()
    } else {
      stream.boxed()
    };
    if !breaks {
      return Ok(stream);
    }
    let trip = self.trip.clone();
    let failure = futures::stream::once(async move {
      trip.notified().await;
      Err(Fault::Injected)
    });
    Ok(stream.take(1).chain(failure).boxed())
  }

  async fn get_once<'a>(&'a self, query: &'a Query) -> Result<Vec<Document>, Fault> {
    let docs = self.inner.get_once(query).await?;
    if query.collection == Collection::Messages && self.stall_reads.swap(false, Ordering::SeqCst) {
      self.gate.notified().await;
    }
    Ok(docs)
  }

  async fn get_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
  ) -> Result<Option<Document>, Fault> {
    Ok(self.inner.get_doc(collection, id).await?)
  }

  async fn create_doc(&self, collection: Collection, fields: Fields) -> Result<String, Fault> {
    self.check_write()?;
    Ok(self.inner.create_doc(collection, fields).await?)
  }

  async fn set_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
    fields: Fields,
    merge: bool,
  ) -> Result<(), Fault> {
    self.check_write()?;
    if self.slow_clears
      && collection == Collection::TypingSignals
      && fields.get("isTyping") == Some(&FieldValue::set(false))
    {
      tokio::time::sleep(SLOW_CLEAR).await;
    }
    Ok(self.inner.set_doc(collection, id, fields, merge).await?)
  }

  async fn update_doc<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
    fields: Fields,
  ) -> Result<(), Fault> {
    self.check_write()?;
    Ok(self.inner.update_doc(collection, id, fields).await?)
  }
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_creates_profile_and_goes_live() {
  let s = store().await;
  let ada = signed_in(s.clone(), "ada").await;

  wait_until("identity slots live", || {
    Slot::IDENTITY
      .iter()
      .all(|slot| ada.slot_state(*slot) == SlotState::Live)
  })
  .await;
  wait_until("own profile loaded", || {
    ada.read(|snap| snap.user("ada").is_some_and(|p| p.online && p.display_name == "Ada"))
  })
  .await;
  assert_eq!(ada.slot_state(Slot::ActiveMessages), SlotState::Detached);
}

#[tokio::test]
async fn start_keeps_existing_profile_name() {
  let s = store().await;
  s.set_doc(
    Collection::Users,
    "ada",
    fields([("username", FieldValue::set("Countess"))]),
    false,
  )
  .await
  .unwrap();

  let ada = signed_in(s.clone(), "ada").await;
  wait_until("profile loaded", || ada.read(|snap| snap.user("ada").is_some())).await;
  ada.read(|snap| {
    let profile = snap.user("ada").unwrap();
    assert_eq!(profile.display_name, "Countess");
    assert!(profile.online);
  });
}

#[tokio::test]
async fn stop_clears_everything_and_is_idempotent() {
  let s = store().await;
  let (ada, _bea, chat) = ada_and_bea(&s).await;
  ada.open_conversation(chat.clone()).await.unwrap();
  wait_until("messages slot live", || {
    ada.slot_state(Slot::ActiveMessages) == SlotState::Live
  })
  .await;

  let mut events = ada.subscribe_events();
  ada.stop().await;

  assert!(Slot::ALL.iter().all(|slot| ada.slot_state(*slot) == SlotState::Detached));
  assert!(ada.read(SnapshotStore::is_empty));
  assert!(ada.active().is_none());
  assert!(ada.identity().is_none());
  // Teardown writes may still surface as changes before the final clear.
  let mut cleared = false;
  while let Ok(event) = events.try_recv() {
    cleared |= matches!(event, EngineEvent::Cleared { .. });
  }
  assert!(cleared);

  let profile = s.get_doc(Collection::Users, "ada").await.unwrap().unwrap();
  assert_eq!(profile.get("online"), Some(&json!(false)));

  ada.stop().await;
  assert!(ada.read(SnapshotStore::is_empty));
}

#[tokio::test]
async fn actions_require_identity() {
  let s = store().await;
  let engine = Engine::new(s, config());
  let err = engine
    .open_conversation(ConversationRef::direct("d1"))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::NotSignedIn));
  assert!(matches!(engine.mark_seen(&ConversationRef::direct("d1")).await, Err(Error::NotSignedIn)));
}

#[tokio::test]
async fn switching_conversations_keeps_one_message_feed() {
  let s = store().await;
  let ada = signed_in(s.clone(), "ada").await;
  let with_bea = ada.create_direct("bea").await.unwrap();
  let with_cy = ada.create_direct("cy").await.unwrap();
  wait_until("both chats loaded", || {
    has_conversation(&ada, &with_bea) && has_conversation(&ada, &with_cy)
  })
  .await;

  ada.open_conversation(with_bea.clone()).await.unwrap();
  wait_until("first conversation live", || {
    ada.slot_state(Slot::ActiveMessages) == SlotState::Live
  })
  .await;
  // Four identity feeds plus messages and typing.
  wait_until("six feeds", || s.active_feeds() == 6).await;

  ada.open_conversation(with_cy.clone()).await.unwrap();
  assert_eq!(ada.active(), Some(with_cy));
  wait_until("second conversation live", || {
    ada.slot_state(Slot::ActiveMessages) == SlotState::Live
  })
  .await;
  wait_until("still six feeds", || s.active_feeds() == 6).await;

  ada.close_conversation().await;
  assert!(ada.active().is_none());
  wait_until("conversation feeds gone", || s.active_feeds() == 4).await;
}

#[tokio::test]
async fn late_emission_for_previous_conversation_is_dropped() {
  let s = store().await;
  let bea = signed_in(s.clone(), "bea").await;
  let cy = signed_in(s.clone(), "cy").await;
  let with_bea = bea.create_direct("ada").await.unwrap();
  let with_cy = cy.create_direct("ada").await.unwrap();
  wait_until("chat in bea's snapshot", || has_conversation(&bea, &with_bea)).await;
  bea.send_message(&with_bea, Draft::text("first")).await.unwrap();

  let faulty = FaultyStore::new(s.clone()).holding(with_bea.clone());
  let ada = signed_in(faulty.clone(), "ada").await;
  wait_until("both chats loaded", || {
    has_conversation(&ada, &with_bea) && has_conversation(&ada, &with_cy)
  })
  .await;
  let feeds_before = s.active_feeds();

  ada.open_conversation(with_bea.clone()).await.unwrap();
  wait_until("first message loaded", || message_count(&ada, &with_bea) == 1).await;
  assert_eq!(ada.slot_state(Slot::ActiveMessages), SlotState::Live);
  wait_until("messages and typing feeds open", || s.active_feeds() == feeds_before + 2).await;

  // This emission is held back until after the switch.
  bea.send_message(&with_bea, Draft::text("second")).await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(message_count(&ada, &with_bea), 1);

  ada.open_conversation(with_cy.clone()).await.unwrap();
  assert_eq!(ada.active(), Some(with_cy.clone()));
  assert_ne!(ada.slot_state(Slot::ActiveMessages), SlotState::Detached);
  wait_until("second conversation live", || {
    ada.slot_state(Slot::ActiveMessages) == SlotState::Live
  })
  .await;
  tokio::time::sleep(Duration::from_millis(50)).await;

  let held_count = message_count(&ada, &with_bea);
  let mut events = ada.subscribe_events();
  faulty.gate.notify_one();
  tokio::time::sleep(Duration::from_millis(100)).await;

  assert_eq!(message_count(&ada, &with_bea), held_count);
  while let Ok(event) = events.try_recv() {
    assert!(
      !matches!(event, EngineEvent::Changed { slot: Slot::ActiveMessages, .. }),
      "unexpected message change after the switch: {event:?}"
    );
  }
  assert_eq!(ada.active(), Some(with_cy));
  assert_eq!(ada.slot_state(Slot::ActiveMessages), SlotState::Live);
  assert_eq!(faulty.message_feeds.peak.load(Ordering::SeqCst), 1);
  wait_until("still one conversation's feeds", || s.active_feeds() == feeds_before + 2).await;
}

#[tokio::test]
async fn sign_out_wins_over_concurrent_conversation_switch() {
  let s = store().await;
  let faulty = FaultyStore::new(s.clone()).with_slow_typing_clears();
  let ada = signed_in(faulty, "ada").await;
  let with_bea = ada.create_direct("bea").await.unwrap();
  let with_cy = ada.create_direct("cy").await.unwrap();
  wait_until("both chats loaded", || {
    has_conversation(&ada, &with_bea) && has_conversation(&ada, &with_cy)
  })
  .await;
  ada.open_conversation(with_bea).await.unwrap();
  wait_until("messages slot live", || {
    ada.slot_state(Slot::ActiveMessages) == SlotState::Live
  })
  .await;

  // Sign-out stalls on its typing clear while the switch comes in.
  let stopping = tokio::spawn({
    let ada = ada.clone();
    async move { ada.stop().await }
  });
  tokio::time::sleep(Duration::from_millis(20)).await;
  let switched = ada.open_conversation(with_cy).await;
  stopping.await.unwrap();

  assert!(matches!(switched, Err(Error::NotSignedIn)));
  assert!(ada.identity().is_none());
  assert!(ada.active().is_none());
  assert!(Slot::ALL.iter().all(|slot| ada.slot_state(*slot) == SlotState::Detached));
  wait_until("every feed closed", || s.active_feeds() == 0).await;
}

// ─── Messages ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_direct_guard_returns_same_chat() {
  let s = store().await;
  let ada = signed_in(s.clone(), "ada").await;
  let bea = signed_in(s.clone(), "bea").await;

  // The second call may run before the snapshot has the first chat; the
  // one-shot query still finds it.
  let first = ada.create_direct("bea").await.unwrap();
  let second = ada.create_direct("bea").await.unwrap();
  assert_eq!(first, second);

  let from_bea = bea.create_direct("ada").await.unwrap();
  assert_eq!(first, from_bea);

  let chats = s.get_once(&Query::new(Collection::DirectChats)).await.unwrap();
  assert_eq!(chats.len(), 1);
}

#[tokio::test]
async fn direct_chat_with_self_is_rejected() {
  let s = store().await;
  let ada = signed_in(s, "ada").await;
  assert!(matches!(ada.create_direct("ada").await, Err(Error::ValidationFailed(_))));
  assert!(matches!(ada.create_direct("  ").await, Err(Error::ValidationFailed(_))));
}

#[tokio::test]
async fn send_message_validates_before_writing() {
  let s = store().await;
  let (ada, _bea, chat) = ada_and_bea(&s).await;

  let err = ada.send_message(&chat, Draft::text("   ")).await.unwrap_err();
  assert!(matches!(err, Error::ValidationFailed(_)));

  let err = ada
    .send_message(&chat, Draft::attachment("application/pdf", "data:..."))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::ValidationFailed(_)));

  let unknown = ConversationRef::group("nope");
  let err = ada.send_message(&unknown, Draft::text("hi")).await.unwrap_err();
  assert!(matches!(err, Error::UnknownConversation(r) if r == unknown));

  let messages = s.get_once(&Query::new(Collection::Messages)).await.unwrap();
  assert!(messages.is_empty());
}

#[tokio::test]
async fn sent_messages_arrive_in_order_and_notify_peer() {
  let s = store().await;
  let (ada, bea, chat) = ada_and_bea(&s).await;
  bea.open_conversation(chat.clone()).await.unwrap();

  ada.send_message(&chat, Draft::text("one")).await.unwrap();
  ada.send_message(&chat, Draft::text("two")).await.unwrap();
  ada
    .send_message(&chat, Draft::attachment("image/png", "data:image/png;base64,AAAA"))
    .await
    .unwrap();

  wait_until("three messages", || message_count(&bea, &chat) == 3).await;
  bea.read(|snap| {
    let ordered: Vec<_> = view::chat_messages(snap, &chat)
      .into_iter()
      .map(|m| m.payload.as_str())
      .collect();
    assert_eq!(ordered, vec!["one", "two", "data:image/png;base64,AAAA"]);
    assert_eq!(view::media_gallery(snap, &chat, 8).len(), 1);
  });

  wait_until("three notifications", || {
    bea.read(view::unread_notifications) == 3
  })
  .await;
  bea.read(|snap| {
    assert!(snap.notifications().all(|n| n.text == "New message from Ada"));
    assert!(
      snap
        .notifications()
        .all(|n| n.ref_conversation.as_ref() == Some(&chat))
    );
  });
}

#[tokio::test]
async fn mark_seen_clears_unread_and_is_idempotent() {
  let s = store().await;
  let (ada, bea, chat) = ada_and_bea(&s).await;
  ada.send_message(&chat, Draft::text("one")).await.unwrap();
  ada.send_message(&chat, Draft::text("two")).await.unwrap();

  bea.open_conversation(chat.clone()).await.unwrap();
  wait_until("messages loaded", || message_count(&bea, &chat) == 2).await;
  assert_eq!(bea.read(|snap| view::unread_count(snap, &chat, "bea")), 2);

  assert_eq!(bea.mark_seen(&chat).await.unwrap(), 2);
  wait_until("unread cleared", || {
    bea.read(|snap| view::unread_count(snap, &chat, "bea")) == 0
  })
  .await;
  assert_eq!(bea.mark_seen(&chat).await.unwrap(), 0);

  // The sender sees the delivery label flip.
  ada.open_conversation(chat.clone()).await.unwrap();
  wait_until("ada sees seen labels", || {
    ada.read(|snap| {
      let Some(conversation) = snap.conversation(&chat) else {
        return false;
      };
      let messages = snap.messages(&chat);
      messages.len() == 2
        && messages
          .iter()
          .all(|m| view::delivery_label(m, &conversation, "ada") == Some(DeliveryLabel::Seen))
    })
  })
  .await;
}

#[tokio::test]
async fn active_conversation_is_marked_seen_automatically() {
  let s = store().await;
  let (ada, _bea, chat) = ada_and_bea(&s).await;
  let bea = Engine::new(
    s.clone(),
    EngineConfig {
      auto_mark_seen: true,
      ..config()
    },
  );
  bea.start(identity("bea")).await.unwrap();
  wait_until("chat loaded", || has_conversation(&bea, &chat)).await;
  bea.open_conversation(chat.clone()).await.unwrap();

  ada.send_message(&chat, Draft::text("ping")).await.unwrap();

  wait_until("seen by bea", || {
    bea.read(|snap| snap.messages(&chat).iter().any(|m| m.is_seen_by("bea")))
  })
  .await;
  assert_eq!(bea.read(|snap| view::unread_count(snap, &chat, "bea")), 0);
}

#[tokio::test]
async fn only_sender_may_delete() {
  let s = store().await;
  let (ada, bea, chat) = ada_and_bea(&s).await;
  let id = ada.send_message(&chat, Draft::text("oops")).await.unwrap();

  ada.open_conversation(chat.clone()).await.unwrap();
  bea.open_conversation(chat.clone()).await.unwrap();
  wait_until("both loaded", || {
    message_count(&ada, &chat) == 1 && message_count(&bea, &chat) == 1
  })
  .await;

  assert!(matches!(bea.delete_message(&id).await, Err(Error::PermissionDenied(_))));
  assert!(matches!(ada.delete_message("nope").await, Err(Error::UnknownMessage(_))));

  ada.delete_message(&id).await.unwrap();
  wait_until("tombstone arrives", || {
    bea.read(|snap| snap.message(&id).is_some_and(|m| m.deleted))
  })
  .await;
  // Tombstones stay in the snapshot but stop counting.
  assert_eq!(message_count(&bea, &chat), 1);
  assert_eq!(bea.read(|snap| view::unread_count(snap, &chat, "bea")), 0);
}

#[tokio::test]
async fn refresh_loads_messages_without_a_subscription() {
  let s = store().await;
  let (ada, bea, chat) = ada_and_bea(&s).await;
  ada.send_message(&chat, Draft::text("hello")).await.unwrap();

  assert_eq!(bea.slot_state(Slot::ActiveMessages), SlotState::Detached);
  assert_eq!(bea.refresh(&chat).await.unwrap(), 1);
  assert_eq!(message_count(&bea, &chat), 1);
  assert_eq!(bea.slot_state(Slot::ActiveMessages), SlotState::Detached);

  let summaries = bea.conversations("");
  assert_eq!(summaries.len(), 1);
  assert_eq!(summaries[0].label, "Ada");
  assert_eq!(summaries[0].unread, 1);
}

#[tokio::test]
async fn stale_refresh_does_not_overwrite_live_messages() {
  let s = store().await;
  let faulty = FaultyStore::new(s.clone());
  let ada = signed_in(faulty.clone(), "ada").await;
  let chat = ada.create_direct("bea").await.unwrap();
  wait_until("chat loaded", || has_conversation(&ada, &chat)).await;
  ada.send_message(&chat, Draft::text("first")).await.unwrap();
  ada.open_conversation(chat.clone()).await.unwrap();
  wait_until("first message live", || message_count(&ada, &chat) == 1).await;

  // The refresh reads one message, then stalls while a second arrives live.
  faulty.stall_reads.store(true, Ordering::SeqCst);
  let refreshing = tokio::spawn({
    let ada = ada.clone();
    let chat = chat.clone();
    async move { ada.refresh(&chat).await }
  });
  tokio::time::sleep(Duration::from_millis(50)).await;
  ada.send_message(&chat, Draft::text("second")).await.unwrap();
  wait_until("second message live", || message_count(&ada, &chat) == 2).await;

  faulty.gate.notify_one();
  assert_eq!(refreshing.await.unwrap().unwrap(), 1);
  assert_eq!(message_count(&ada, &chat), 2);
}

// ─── Failures ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transport_failure_surfaces_as_remote_write_failed() {
  let s = store().await;
  let faulty = FaultyStore::new(s.clone());
  let ada = signed_in(faulty.clone(), "ada").await;
  let chat = ada.create_direct("bea").await.unwrap();
  wait_until("chat loaded", || has_conversation(&ada, &chat)).await;

  faulty.fail_writes.store(true, Ordering::SeqCst);
  let err = ada.send_message(&chat, Draft::text("hi")).await.unwrap_err();
  assert!(matches!(err, Error::RemoteWriteFailed(_)));

  let messages = s.get_once(&Query::new(Collection::Messages)).await.unwrap();
  assert!(messages.is_empty());
  assert!(message_count(&ada, &chat) == 0);

  // Teardown writes fail too, but stop still completes.
  ada.stop().await;
  assert!(ada.identity().is_none());
}

#[tokio::test]
async fn subscription_failure_keeps_last_snapshot() {
  let s = store().await;
  let (ada, _bea, chat) = ada_and_bea(&s).await;
  ada.send_message(&chat, Draft::text("before")).await.unwrap();

  let faulty = FaultyStore::new(s.clone()).breaking(Collection::Messages);
  let bea = signed_in(faulty.clone(), "bea").await;
  wait_until("chat loaded", || has_conversation(&bea, &chat)).await;

  let mut events = bea.subscribe_events();
  bea.open_conversation(chat.clone()).await.unwrap();
  wait_until("message loaded", || message_count(&bea, &chat) == 1).await;

  faulty.trip.notify_one();
  wait_until("slot detached", || {
    bea.slot_state(Slot::ActiveMessages) == SlotState::Detached
  })
  .await;
  assert_eq!(message_count(&bea, &chat), 1);

  let mut failures = 0;
  while let Ok(event) = events.try_recv() {
    if let EngineEvent::SubscriptionFailed { slot, .. } = event {
      assert_eq!(slot, Slot::ActiveMessages);
      failures += 1;
    }
  }
  assert_eq!(failures, 1);

  // Re-opening the same conversation re-attaches the failed slot.
  bea.open_conversation(chat.clone()).await.unwrap();
  wait_until("slot live again", || {
    bea.slot_state(Slot::ActiveMessages) == SlotState::Live
  })
  .await;
  wait_until("typing slot live", || {
    bea.slot_state(Slot::ActiveTyping) == SlotState::Live
  })
  .await;
}

// ─── Typing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn typing_is_shown_then_stops_after_quiet_interval() {
  let s = store().await;
  let (ada, bea, chat) = ada_and_bea(&s).await;
  ada.open_conversation(chat.clone()).await.unwrap();
  bea.open_conversation(chat.clone()).await.unwrap();
  wait_until("typing slot live", || {
    bea.slot_state(Slot::ActiveTyping) == SlotState::Live
  })
  .await;

  ada.input_activity().await.unwrap();
  wait_until("bea sees ada typing", || bea.typing_users() == vec!["Ada".to_owned()]).await;
  // The viewer never sees themselves.
  assert!(ada.typing_users().is_empty());

  // No further activity: the stop fires after the quiet interval.
  wait_until("typing stopped", || bea.typing_users().is_empty()).await;
}

#[tokio::test]
async fn sending_clears_own_typing_signal() {
  let s = store().await;
  let (ada, _bea, chat) = ada_and_bea(&s).await;
  ada.open_conversation(chat.clone()).await.unwrap();
  ada.input_activity().await.unwrap();

  let id = typing_doc_id(&chat, "ada");
  let raised = s.get_doc(Collection::TypingSignals, &id).await.unwrap().unwrap();
  assert_eq!(raised.get("isTyping"), Some(&json!(true)));

  ada.send_message(&chat, Draft::text("done")).await.unwrap();
  let cleared = s.get_doc(Collection::TypingSignals, &id).await.unwrap().unwrap();
  assert_eq!(cleared.get("isTyping"), Some(&json!(false)));
}

#[tokio::test]
async fn activity_during_slow_typing_clear_raises_again() {
  let s = store().await;
  let faulty = FaultyStore::new(s.clone()).with_slow_typing_clears();
  let ada = Engine::new(faulty, EngineConfig {
    typing_quiet_ms: 300,
    ..config()
  });
  ada.start(identity("ada")).await.unwrap();
  let chat = ada.create_direct("bea").await.unwrap();
  wait_until("chat loaded", || has_conversation(&ada, &chat)).await;
  ada.open_conversation(chat.clone()).await.unwrap();
  let id = typing_doc_id(&chat, "ada");

  ada.input_activity().await.unwrap();
  // The quiet interval has passed and its clear is still in flight.
  tokio::time::sleep(Duration::from_millis(350)).await;
  ada.input_activity().await.unwrap();

  let raised = s.get_doc(Collection::TypingSignals, &id).await.unwrap().unwrap();
  assert_eq!(raised.get("isTyping"), Some(&json!(true)));
  tokio::time::sleep(Duration::from_millis(150)).await;
  let still = s.get_doc(Collection::TypingSignals, &id).await.unwrap().unwrap();
  assert_eq!(still.get("isTyping"), Some(&json!(true)));
}

async fn put_signal(s: &SqliteStore, chat: &ConversationRef, uid: &str, updated_at_ms: i64) {
  s.set_doc(
    Collection::TypingSignals,
    &typing_doc_id(chat, uid),
    fields([
      ("chatRef", FieldValue::set(chat.to_string())),
      ("userId", FieldValue::set(uid)),
      ("username", FieldValue::set(uid)),
      ("isTyping", FieldValue::set(true)),
      ("updatedAtMs", FieldValue::set(updated_at_ms)),
    ]),
    false,
  )
  .await
  .unwrap();
}

#[tokio::test]
async fn stale_typing_signals_are_filtered_and_swept() {
  let s = store().await;
  let (_ada, bea, chat) = ada_and_bea(&s).await;
  put_signal(&s, &chat, "old", now_ms() - 6_000).await;
  put_signal(&s, &chat, "fresh", now_ms() - 4_600).await;

  bea.open_conversation(chat.clone()).await.unwrap();
  wait_until("fresh signal loaded", || {
    bea.read(|snap| snap.typing(&chat).len() == 1)
  })
  .await;
  bea.read(|snap| {
    let held: Vec<&TypingSignal> = snap.typing(&chat).iter().collect();
    assert_eq!(held[0].user_id, "fresh");
  });

  tokio::time::sleep(Duration::from_millis(500)).await;
  assert_eq!(bea.sweep_typing(), 1);
  assert!(bea.read(|snap| snap.typing(&chat).is_empty()));
}

// ─── Groups ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn group_membership_is_owner_controlled() {
  let s = store().await;
  let ada = signed_in(s.clone(), "ada").await;
  let bea = signed_in(s.clone(), "bea").await;
  let cy = signed_in(s.clone(), "cy").await;

  assert!(matches!(ada.create_group("  ", &[]).await, Err(Error::ValidationFailed(_))));

  let group = ada.create_group("Crew", &["bea".to_owned()]).await.unwrap();
  wait_until("bea sees the group", || has_conversation(&bea, &group)).await;
  wait_until("ada sees the group", || has_conversation(&ada, &group)).await;
  wait_until("bea notified", || {
    bea.read(|snap| {
      snap
        .notifications()
        .any(|n| n.text == "You were added to group Crew")
    })
  })
  .await;

  let err = bea.toggle_group_membership(&group.id, "cy").await.unwrap_err();
  assert!(matches!(err, Error::PermissionDenied(_)));

  assert_eq!(
    ada.toggle_group_membership(&group.id, "cy").await.unwrap(),
    Membership::Added
  );
  wait_until("cy sees the group", || has_conversation(&cy, &group)).await;
  wait_until("cy notified", || {
    cy.read(|snap| {
      snap
        .notifications()
        .any(|n| n.text == "Ada added you to group Crew")
    })
  })
  .await;

  // Removal drops the group from the removed member's next full result.
  wait_until("ada sees cy", || {
    ada.read(|snap| snap.group(&group.id).is_some_and(|g| g.is_member("cy")))
  })
  .await;
  assert_eq!(
    ada.toggle_group_membership(&group.id, "cy").await.unwrap(),
    Membership::Removed
  );
  wait_until("group gone for cy", || !has_conversation(&cy, &group)).await;

  // Anyone may remove themselves.
  assert_eq!(
    bea.toggle_group_membership(&group.id, "bea").await.unwrap(),
    Membership::Removed
  );
  wait_until("group gone for bea", || !has_conversation(&bea, &group)).await;
}

#[tokio::test]
async fn leaving_the_active_group_closes_it() {
  let s = store().await;
  let ada = signed_in(s.clone(), "ada").await;
  let bea = signed_in(s.clone(), "bea").await;
  let group = ada.create_group("Crew", &["bea".to_owned()]).await.unwrap();
  wait_until("bea sees the group", || has_conversation(&bea, &group)).await;

  bea.open_conversation(group.clone()).await.unwrap();
  bea.leave_group(&group.id).await.unwrap();

  assert!(bea.active().is_none());
  assert_eq!(bea.slot_state(Slot::ActiveMessages), SlotState::Detached);
  let doc = s.get_doc(Collection::Groups, &group.id).await.unwrap().unwrap();
  assert_eq!(doc.get("members"), Some(&json!(["ada"])));
}

#[tokio::test]
async fn group_delivery_label_needs_every_member() {
  let s = store().await;
  let ada = signed_in(s.clone(), "ada").await;
  let bea = signed_in(s.clone(), "bea").await;
  let cy = signed_in(s.clone(), "cy").await;
  let group = ada
    .create_group("Crew", &["bea".to_owned(), "cy".to_owned()])
    .await
    .unwrap();
  wait_until("everyone sees the group", || {
    [&ada, &bea, &cy].iter().all(|e| has_conversation(*e, &group))
  })
  .await;

  ada.send_message(&group, Draft::text("hi all")).await.unwrap();
  ada.open_conversation(group.clone()).await.unwrap();
  wait_until("ada loaded", || message_count(&ada, &group) == 1).await;

  let label = |engine: &Engine<SqliteStore>| {
    engine.read(|snap| {
      let conversation = snap.conversation(&group)?;
      let message: &Message = snap.messages(&group).first()?;
      view::delivery_label(message, &conversation, "ada")
    })
  };
  assert_eq!(label(&ada), Some(DeliveryLabel::Delivered));

  bea.refresh(&group).await.unwrap();
  bea.mark_seen(&group).await.unwrap();
  wait_until("bea's receipt", || {
    ada.read(|snap| snap.messages(&group).first().is_some_and(|m| m.is_seen_by("bea")))
  })
  .await;
  assert_eq!(label(&ada), Some(DeliveryLabel::Delivered));

  cy.refresh(&group).await.unwrap();
  cy.mark_seen(&group).await.unwrap();
  wait_until("seen by everyone", || label(&ada) == Some(DeliveryLabel::Seen)).await;
}

// ─── Notifications & profile ─────────────────────────────────────────────────

#[tokio::test]
async fn notifications_toggle_and_mark_all_read() {
  let s = store().await;
  let (ada, bea, chat) = ada_and_bea(&s).await;
  ada.send_message(&chat, Draft::text("one")).await.unwrap();
  ada.send_message(&chat, Draft::text("two")).await.unwrap();
  wait_until("two unread", || bea.read(view::unread_notifications) == 2).await;

  let first = bea.read(|snap| snap.notifications().next().map(|n| n.id.clone()).unwrap());
  assert!(bea.toggle_notification_read(&first).await.unwrap());
  wait_until("one unread", || bea.read(view::unread_notifications) == 1).await;

  assert!(matches!(
    bea.toggle_notification_read("nope").await,
    Err(Error::UnknownNotification(_))
  ));

  assert_eq!(bea.mark_all_notifications_read().await.unwrap(), 1);
  wait_until("none unread", || bea.read(view::unread_notifications) == 0).await;
}

#[tokio::test]
async fn display_name_edit_propagates() {
  let s = store().await;
  let (ada, bea, chat) = ada_and_bea(&s).await;

  assert!(matches!(ada.update_display_name(" ").await, Err(Error::ValidationFailed(_))));
  ada.update_display_name("Ada Lovelace").await.unwrap();

  wait_until("bea sees new name", || {
    bea.read(|snap| view::display_label(snap, &chat, "bea")) == "Ada Lovelace"
  })
  .await;
}

#[tokio::test]
async fn export_collects_visible_documents() {
  let s = store().await;
  let (ada, _bea, chat) = ada_and_bea(&s).await;
  ada.send_message(&chat, Draft::text("keep me")).await.unwrap();

  let bundle = ada.export().await.unwrap();
  assert_eq!(bundle.user_id, "ada");
  assert_eq!(bundle.users.len(), 2);
  assert_eq!(bundle.direct_chats.len(), 1);
  assert_eq!(bundle.messages.len(), 1);
  // Ada sent the only message, so only Bea was notified.
  assert!(bundle.notifications.is_empty());

  let notifications = s
    .get_once(&Query::new(Collection::Notifications).filter(Filter::eq("userId", "bea")))
    .await
    .unwrap();
  assert_eq!(notifications.len(), 1);
  assert!(serde_json::to_string(&bundle).is_ok());
}
