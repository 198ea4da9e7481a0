//! The subscription manager.
//!
//! Each [`Slot`] runs at most one live query. A slot task owns the backend
//! stream and feeds every emission through one apply step, which replaces
//! the slot's scope in the snapshot wholesale. Every attach bumps the slot's
//! generation; an emission is applied only while its generation is still the
//! current one, so anything arriving after a detach is discarded.

use std::collections::BTreeMap;

use futures::StreamExt as _;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_core::{
  conversation::{ConversationRef, DirectChat, Group},
  document::{Collection, Direction, Document, Filter, Query},
  message::Message,
  notification::Notification,
  snapshot::{ScopeKey, Stored},
  store::RemoteStore,
  typing::{TypingSignal, now_ms},
  user::UserProfile,
};

use crate::{Engine, EngineConfig, EngineEvent, Error};

// ─── Slots ───────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  strum::Display,
  strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Slot {
  Directory,
  DirectChats,
  Groups,
  Notifications,
  ActiveMessages,
  ActiveTyping,
}

impl Slot {
  /// Attached once per sign-in.
  pub const IDENTITY: [Slot; 4] = [
    Slot::Directory,
    Slot::DirectChats,
    Slot::Groups,
    Slot::Notifications,
  ];
  /// Re-attached on every active-conversation change.
  pub const CONVERSATION: [Slot; 2] = [Slot::ActiveMessages, Slot::ActiveTyping];
  pub const ALL: [Slot; 6] = [
    Slot::Directory,
    Slot::DirectChats,
    Slot::Groups,
    Slot::Notifications,
    Slot::ActiveMessages,
    Slot::ActiveTyping,
  ];
}

/// `Detached → Attaching → Live → Detached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SlotState {
  #[default]
  Detached,
  Attaching,
  Live,
}

#[derive(Debug, Default)]
pub(crate) struct SlotEntry {
  pub state:      SlotState,
  pub generation: u64,
  pub task:       Option<JoinHandle<()>>,
}

/// Slot bookkeeping for one session.
#[derive(Debug, Default)]
pub(crate) struct Slots(BTreeMap<Slot, SlotEntry>);

impl Slots {
  pub fn state(&self, slot: Slot) -> SlotState {
    self.0.get(&slot).map(|e| e.state).unwrap_or_default()
  }

  /// True while `generation` is the slot's current, non-detached attachment.
  pub fn is_current(&self, slot: Slot, generation: u64) -> bool {
    self
      .0
      .get(&slot)
      .is_some_and(|e| e.generation == generation && e.state != SlotState::Detached)
  }

  fn entry(&mut self, slot: Slot) -> &mut SlotEntry { self.0.entry(slot).or_default() }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

pub(crate) fn direct_chats_query(uid: &str) -> Query {
  Query::new(Collection::DirectChats).filter(Filter::array_contains("members", uid))
}

pub(crate) fn groups_query(uid: &str) -> Query {
  Query::new(Collection::Groups).filter(Filter::array_contains("members", uid))
}

pub(crate) fn notifications_query(uid: &str, config: &EngineConfig) -> Query {
  Query::new(Collection::Notifications)
    .filter(Filter::eq("userId", uid))
    .order_by("createdAt", Direction::Descending)
    .limit(config.notification_limit)
}

pub(crate) fn messages_query(conversation: &ConversationRef) -> Query {
  Query::new(Collection::Messages)
    .filter(Filter::eq("chatRef", conversation.to_string()))
    .order_by("createdAt", Direction::Ascending)
}

pub(crate) fn typing_query(conversation: &ConversationRef) -> Query {
  Query::new(Collection::TypingSignals).filter(Filter::eq("chatRef", conversation.to_string()))
}

/// Decode every document, skipping (and logging) the ones that don't fit `T`.
pub(crate) fn decode_all<T: Stored>(docs: &[Document]) -> Vec<T> {
  docs
    .iter()
    .filter_map(|doc| match T::from_document(doc) {
      Ok(item) => Some(item),
      Err(e) => {
        warn!(collection = %T::COLLECTION, id = %doc.id, error = %e, "skipping malformed document");
        None
      }
    })
    .collect()
}

// ─── Attach / detach ─────────────────────────────────────────────────────────

impl<S: RemoteStore + 'static> Engine<S> {
  /// Attach every identity-scoped slot that is currently detached.
  pub(crate) fn attach_identity_slots(&self, uid: &str) {
    for slot in Slot::IDENTITY {
      if self.slot_state(slot) != SlotState::Detached {
        continue;
      }
      let scope = ScopeKey::Identity;
      match slot {
        Slot::Directory => {
          self.attach::<UserProfile>(slot, Query::new(Collection::Users), scope)
        }
        Slot::DirectChats => self.attach::<DirectChat>(slot, direct_chats_query(uid), scope),
        Slot::Groups => self.attach::<Group>(slot, groups_query(uid), scope),
        Slot::Notifications => {
          let query = notifications_query(uid, self.config());
          self.attach::<Notification>(slot, query, scope)
        }
        Slot::ActiveMessages | Slot::ActiveTyping => {}
      }
    }
  }

  /// Attach whichever of the conversation slots is detached, for
  /// `conversation`.
  pub(crate) fn attach_conversation_slots(&self, conversation: &ConversationRef) {
    let scope = ScopeKey::Conversation(conversation.clone());
    if self.slot_state(Slot::ActiveMessages) == SlotState::Detached {
      self.attach::<Message>(Slot::ActiveMessages, messages_query(conversation), scope.clone());
    }
    if self.slot_state(Slot::ActiveTyping) == SlotState::Detached {
      self.attach::<TypingSignal>(Slot::ActiveTyping, typing_query(conversation), scope);
    }
  }

  fn attach<T: Stored>(&self, slot: Slot, query: Query, scope: ScopeKey) {
    let mut session = self.inner.session.lock();
    let entry = session.slots.entry(slot);
    entry.generation += 1;
    entry.state = SlotState::Attaching;
    let generation = entry.generation;

    debug!(%slot, generation, collection = %query.collection, "attaching");
    let engine = self.clone();
    let task = tokio::spawn(async move {
      engine.run_slot::<T>(slot, generation, query, scope).await;
    });
    if let Some(stale) = entry.task.replace(task) {
      stale.abort();
    }
  }

  /// Stop `slot`. No further emission from it reaches the snapshot once this
  /// returns. Detaching a detached slot is a no-op.
  pub(crate) async fn detach(&self, slot: Slot) {
    let task = {
      let mut session = self.inner.session.lock();
      let entry = session.slots.entry(slot);
      if entry.state == SlotState::Detached && entry.task.is_none() {
        return;
      }
      entry.generation += 1;
      entry.state = SlotState::Detached;
      entry.task.take()
    };

    if let Some(task) = task {
      task.abort();
      // Awaiting makes sure the backend stream has been dropped.
      let _ = task.await;
    }
    debug!(%slot, "detached");
  }

  // ── Slot task ─────────────────────────────────────────────────────────

  async fn run_slot<T: Stored>(
    self,
    slot: Slot,
    generation: u64,
    query: Query,
    scope: ScopeKey,
  ) {
    let mut stream = match self.inner.store.subscribe(query).await {
      Ok(stream) => stream,
      Err(e) => return self.fail_slot(slot, generation, Box::new(e)),
    };

    {
      let mut session = self.inner.session.lock();
      if !session.slots.is_current(slot, generation) {
        return;
      }
      session.slots.entry(slot).state = SlotState::Live;
    }
    debug!(%slot, generation, "live");

    while let Some(emission) = stream.next().await {
      let docs = match emission {
        Ok(docs) => docs,
        Err(e) => return self.fail_slot(slot, generation, Box::new(e)),
      };
      if !self.apply::<T>(slot, generation, &scope, &docs) {
        return;
      }
      if slot == Slot::ActiveMessages
        && self.config().auto_mark_seen
        && let ScopeKey::Conversation(conversation) = &scope
        && let Err(e) = self.mark_seen(conversation).await
      {
        warn!(%conversation, error = %e, "auto mark-seen failed");
      }
    }

    // The backend closed the stream without an error.
    let mut session = self.inner.session.lock();
    if session.slots.is_current(slot, generation) {
      let entry = session.slots.entry(slot);
      entry.state = SlotState::Detached;
      entry.task = None;
      debug!(%slot, "stream ended");
    }
  }

  /// Replace `scope` with one emission. Returns false once the emission's
  /// attachment is no longer current.
  fn apply<T: Stored>(
    &self,
    slot: Slot,
    generation: u64,
    scope: &ScopeKey,
    docs: &[Document],
  ) -> bool {
    let items = decode_all::<T>(docs);

    let revision = {
      let mut session = self.inner.session.lock();
      if !session.slots.is_current(slot, generation) {
        debug!(%slot, generation, "discarding late emission");
        return false;
      }
      session.snapshot.replace_scoped(scope.clone(), items);
      if slot == Slot::ActiveTyping {
        let ttl = self.config().typing_ttl_ms;
        let now = now_ms();
        session.snapshot.retain::<TypingSignal>(|s| s.is_live(now, ttl));
      }
      session.bump()
    };

    debug!(%slot, count = docs.len(), revision, "applied emission");
    self.inner.events.emit(EngineEvent::Changed { slot, revision });
    true
  }

  fn fail_slot(
    &self,
    slot: Slot,
    generation: u64,
    source: Box<dyn std::error::Error + Send + Sync>,
  ) {
    {
      let mut session = self.inner.session.lock();
      if !session.slots.is_current(slot, generation) {
        return;
      }
      let entry = session.slots.entry(slot);
      entry.state = SlotState::Detached;
      entry.task = None;
    }

    let error = Error::RemoteSubscriptionFailed { slot, source };
    warn!(%slot, error = %error, "subscription failed; keeping last snapshot");
    self.inner.events.emit(EngineEvent::SubscriptionFailed {
      slot,
      error: error.to_string(),
    });
  }

  // ── Typing sweep ──────────────────────────────────────────────────────

  pub(crate) fn spawn_sweep(&self) -> JoinHandle<()> {
    let engine = self.clone();
    let period = self.config().typing_sweep();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick completes immediately.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        engine.sweep_typing();
      }
    })
  }

  /// Drop typing signals that have outlived the TTL. Returns how many were
  /// dropped.
  pub fn sweep_typing(&self) -> usize {
    let ttl = self.config().typing_ttl_ms;
    let now = now_ms();

    let (removed, revision) = {
      let mut session = self.inner.session.lock();
      let removed = session.snapshot.retain::<TypingSignal>(|s| s.is_live(now, ttl));
      if removed == 0 {
        return 0;
      }
      (removed, session.bump())
    };

    debug!(removed, "swept expired typing signals");
    self.inner.events.emit(EngineEvent::Changed {
      slot: Slot::ActiveTyping,
      revision,
    });
    removed
  }
}
