//! [`SnapshotStore`], the local mirror of every collection relevant to the
//! signed-in identity.
//!
//! Pure merge logic, no I/O. Every update is a full replacement of one
//! `(collection, scope)` pair: the items previously held under that scope
//! are discarded and the new emission installed in their place. Scopes never
//! bleed into each other, so replacing the messages of one conversation
//! leaves every other conversation untouched.

use std::collections::{BTreeMap, HashSet};

use crate::{
  conversation::{Conversation, ConversationKind, ConversationRef, DirectChat, Group},
  document::Entity,
  message::Message,
  notification::Notification,
  typing::TypingSignal,
  user::UserProfile,
};

/// The scope an emission is authoritative for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
  /// Everything visible to the signed-in identity (directory, memberships,
  /// notifications).
  Identity,
  /// Items belonging to a single conversation (messages, typing).
  Conversation(ConversationRef),
}

// ─── Table ───────────────────────────────────────────────────────────────────

/// All items of one collection, partitioned by scope. Within a scope items
/// are unique by id and keep their arrival order.
#[derive(Debug, Clone)]
pub struct Table<T> {
  scopes: BTreeMap<ScopeKey, Vec<T>>,
}

impl<T> Default for Table<T> {
  fn default() -> Self {
    Self {
      scopes: BTreeMap::new(),
    }
  }
}

impl<T: Entity> Table<T> {
  fn replace(&mut self, scope: ScopeKey, items: Vec<T>) {
    // Later duplicates win, but the surviving item keeps the later position.
    let mut seen = HashSet::new();
    let mut unique: Vec<T> = items
      .into_iter()
      .rev()
      .filter(|item| seen.insert(item.id().to_owned()))
      .collect();
    unique.reverse();

    if unique.is_empty() {
      self.scopes.remove(&scope);
    } else {
      self.scopes.insert(scope, unique);
    }
  }

  /// Items held under `scope`, in arrival order.
  pub fn scope(&self, scope: &ScopeKey) -> &[T] {
    self.scopes.get(scope).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn iter(&self) -> impl Iterator<Item = &T> { self.scopes.values().flatten() }

  pub fn get(&self, id: &str) -> Option<&T> { self.iter().find(|item| item.id() == id) }

  pub fn len(&self) -> usize { self.scopes.values().map(Vec::len).sum() }

  pub fn is_empty(&self) -> bool { self.scopes.is_empty() }

  fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
    let before = self.len();
    for items in self.scopes.values_mut() {
      items.retain(&mut keep);
    }
    self.scopes.retain(|_, items| !items.is_empty());
    before - self.len()
  }
}

/// Entities the [`SnapshotStore`] knows how to hold.
pub trait Stored: Entity {
  fn table(snapshot: &SnapshotStore) -> &Table<Self>;
  fn table_mut(snapshot: &mut SnapshotStore) -> &mut Table<Self>;
}

macro_rules! stored {
  ($ty:ty, $field:ident) => {
    impl Stored for $ty {
      fn table(snapshot: &SnapshotStore) -> &Table<Self> { &snapshot.$field }

      fn table_mut(snapshot: &mut SnapshotStore) -> &mut Table<Self> {
        &mut snapshot.$field
      }
    }
  };
}

stored!(UserProfile, users);
stored!(DirectChat, direct_chats);
stored!(Group, groups);
stored!(Notification, notifications);
stored!(Message, messages);
stored!(TypingSignal, typing);

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
  users:         Table<UserProfile>,
  direct_chats:  Table<DirectChat>,
  groups:        Table<Group>,
  notifications: Table<Notification>,
  messages:      Table<Message>,
  typing:        Table<TypingSignal>,
}

impl SnapshotStore {
  pub fn new() -> Self { Self::default() }

  /// Atomically replace everything held under `scope` for `T`'s collection
  /// with `items`.
  pub fn replace_scoped<T: Stored>(&mut self, scope: ScopeKey, items: Vec<T>) {
    T::table_mut(self).replace(scope, items);
  }

  pub fn table<T: Stored>(&self) -> &Table<T> { T::table(self) }

  /// Drop every `T` for which `keep` returns false. Returns how many were
  /// dropped.
  pub fn retain<T: Stored>(&mut self, keep: impl FnMut(&T) -> bool) -> usize {
    T::table_mut(self).retain(keep)
  }

  pub fn clear(&mut self) { *self = Self::default(); }

  pub fn is_empty(&self) -> bool {
    self.users.is_empty()
      && self.direct_chats.is_empty()
      && self.groups.is_empty()
      && self.notifications.is_empty()
      && self.messages.is_empty()
      && self.typing.is_empty()
  }

  // ── Projections ───────────────────────────────────────────────────────

  pub fn user(&self, id: &str) -> Option<&UserProfile> { self.users.get(id) }

  pub fn users(&self) -> impl Iterator<Item = &UserProfile> { self.users.iter() }

  pub fn direct_chats(&self) -> impl Iterator<Item = &DirectChat> {
    self.direct_chats.iter()
  }

  pub fn groups(&self) -> impl Iterator<Item = &Group> { self.groups.iter() }

  pub fn group(&self, id: &str) -> Option<&Group> { self.groups.get(id) }

  pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
    self.notifications.iter()
  }

  pub fn message(&self, id: &str) -> Option<&Message> { self.messages.get(id) }

  /// Messages of one conversation, in arrival order.
  pub fn messages(&self, conversation: &ConversationRef) -> &[Message] {
    self
      .messages
      .scope(&ScopeKey::Conversation(conversation.clone()))
  }

  /// Typing records held for one conversation.
  pub fn typing(&self, conversation: &ConversationRef) -> &[TypingSignal] {
    self.typing.scope(&ScopeKey::Conversation(conversation.clone()))
  }

  pub fn conversation(&self, reference: &ConversationRef) -> Option<Conversation> {
    match reference.kind {
      ConversationKind::Direct => self
        .direct_chats
        .get(&reference.id)
        .cloned()
        .map(Conversation::Direct),
      ConversationKind::Group => self
        .groups
        .get(&reference.id)
        .cloned()
        .map(Conversation::Group),
    }
  }
}
