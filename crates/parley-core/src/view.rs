//! Derived views: the computed read models handed to the presentation layer.
//!
//! Every function here is a pure projection over a [`SnapshotStore`]; nothing
//! is cached or stored. Views must tolerate a partially loaded snapshot: a
//! peer profile that has not arrived yet, or a message whose server
//! timestamp is still pending, degrades to a fallback rather than an error.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
  conversation::{Conversation, ConversationKind, ConversationRef, Group},
  message::Message,
  snapshot::SnapshotStore,
  user::UserProfile,
};

/// Label shown when a peer's profile is not (yet) in the directory.
pub const UNKNOWN_USER: &str = "Unknown user";

// ─── Conversation list ───────────────────────────────────────────────────────

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
  pub reference: ConversationRef,
  pub label:     String,
  pub unread:    usize,
  /// `createdAt` of the latest non-deleted, acknowledged message.
  pub latest_at: Option<DateTime<Utc>>,
  /// Peer presence for direct chats whose peer profile is loaded.
  pub presence:  Option<Presence>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Presence {
  pub online:       bool,
  pub last_seen_at: Option<DateTime<Utc>>,
}

/// Every conversation `viewer` belongs to, most recently active first.
///
/// Conversations without timestamped messages sort last, in snapshot order.
/// `filter` is matched case-insensitively against the display label; an
/// empty filter keeps everything.
pub fn conversations(
  snapshot: &SnapshotStore,
  viewer: &str,
  filter: &str,
) -> Vec<ConversationSummary> {
  let needle = filter.trim().to_lowercase();

  let direct = snapshot
    .direct_chats()
    .filter(|c| c.is_well_formed() && c.members.iter().any(|m| m == viewer))
    .map(|c| Conversation::Direct(c.clone()));
  let groups = snapshot
    .groups()
    .filter(|g| g.is_member(viewer))
    .map(|g| Conversation::Group(g.clone()));

  let mut rows: Vec<ConversationSummary> = direct
    .chain(groups)
    .map(|conversation| summarize(snapshot, &conversation, viewer))
    .filter(|row| needle.is_empty() || row.label.to_lowercase().contains(&needle))
    .collect();

  // Stable sort: `None < Some`, so reversing the comparison puts silent
  // conversations last.
  rows.sort_by(|a, b| b.latest_at.cmp(&a.latest_at));
  rows
}

fn summarize(
  snapshot: &SnapshotStore,
  conversation: &Conversation,
  viewer: &str,
) -> ConversationSummary {
  let reference = conversation.reference();
  let presence = match conversation {
    Conversation::Direct(chat) => chat
      .peer_of(viewer)
      .and_then(|peer| snapshot.user(peer))
      .map(|p| Presence {
        online:       p.online,
        last_seen_at: p.last_seen_at,
      }),
    Conversation::Group(_) => None,
  };

  ConversationSummary {
    label: label_for(snapshot, conversation, viewer),
    unread: unread_count(snapshot, &reference, viewer),
    latest_at: latest_activity(snapshot, &reference),
    presence,
    reference,
  }
}

/// `createdAt` of the newest non-deleted message in the conversation.
pub fn latest_activity(
  snapshot: &SnapshotStore,
  reference: &ConversationRef,
) -> Option<DateTime<Utc>> {
  snapshot
    .messages(reference)
    .iter()
    .filter(|m| !m.deleted)
    .filter_map(|m| m.created_at)
    .max()
}

// ─── Labels ──────────────────────────────────────────────────────────────────

/// Display label of a conversation: the peer's name (or handle) for direct
/// chats, the group name for groups.
pub fn display_label(
  snapshot: &SnapshotStore,
  reference: &ConversationRef,
  viewer: &str,
) -> String {
  match snapshot.conversation(reference) {
    Some(conversation) => label_for(snapshot, &conversation, viewer),
    None => match reference.kind {
      ConversationKind::Direct => UNKNOWN_USER.to_owned(),
      ConversationKind::Group => reference.id.clone(),
    },
  }
}

fn label_for(snapshot: &SnapshotStore, conversation: &Conversation, viewer: &str) -> String {
  match conversation {
    Conversation::Direct(chat) => chat
      .peer_of(viewer)
      .map(|peer| user_label(snapshot, peer))
      .unwrap_or_else(|| UNKNOWN_USER.to_owned()),
    Conversation::Group(group) => group.name.clone(),
  }
}

/// A user's name, handle, or [`UNKNOWN_USER`].
pub fn user_label(snapshot: &SnapshotStore, user_id: &str) -> String {
  snapshot
    .user(user_id)
    .and_then(UserProfile::label)
    .unwrap_or(UNKNOWN_USER)
    .to_owned()
}

/// Member labels of a group, in membership order. Unloaded profiles fall
/// back to the raw id.
pub fn member_labels(snapshot: &SnapshotStore, group: &Group) -> Vec<String> {
  group
    .members
    .iter()
    .map(|id| {
      snapshot
        .user(id)
        .and_then(UserProfile::label)
        .unwrap_or(id.as_str())
        .to_owned()
    })
    .collect()
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Messages of a conversation, oldest first. Unacknowledged messages (no
/// `createdAt` yet) sort before every timestamped one; ties keep arrival
/// order.
pub fn chat_messages<'a>(
  snapshot: &'a SnapshotStore,
  reference: &ConversationRef,
) -> Vec<&'a Message> {
  let mut messages: Vec<&Message> = snapshot.messages(reference).iter().collect();
  messages.sort_by_key(|m| m.created_at);
  messages
}

/// Non-deleted messages from others that `viewer` has not seen.
pub fn unread_count(
  snapshot: &SnapshotStore,
  reference: &ConversationRef,
  viewer: &str,
) -> usize {
  snapshot
    .messages(reference)
    .iter()
    .filter(|m| m.is_unread_for(viewer))
    .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeliveryLabel {
  Delivered,
  Seen,
}

/// Delivery status of `message` as shown to `viewer`. Only the viewer's own
/// messages carry a label.
///
/// A direct message is seen once the peer is in `seen_by`; a group message
/// once every other member is.
pub fn delivery_label(
  message: &Message,
  conversation: &Conversation,
  viewer: &str,
) -> Option<DeliveryLabel> {
  if message.sender_id != viewer {
    return None;
  }
  let seen = match conversation {
    Conversation::Direct(chat) => chat
      .peer_of(&message.sender_id)
      .is_some_and(|peer| message.is_seen_by(peer)),
    Conversation::Group(_) => conversation
      .others(&message.sender_id)
      .all(|member| message.is_seen_by(member)),
  };
  Some(if seen {
    DeliveryLabel::Seen
  } else {
    DeliveryLabel::Delivered
  })
}

/// Image and video messages, newest first, capped to `window`.
pub fn media_gallery<'a>(
  snapshot: &'a SnapshotStore,
  reference: &ConversationRef,
  window: usize,
) -> Vec<&'a Message> {
  let mut media: Vec<&Message> = chat_messages(snapshot, reference)
    .into_iter()
    .filter(|m| m.kind.is_media() && !m.deleted)
    .collect();
  media.reverse();
  media.truncate(window);
  media
}

// ─── Typing ──────────────────────────────────────────────────────────────────

/// Distinct names of users currently typing in `reference`, excluding the
/// viewer, in arrival order.
pub fn typing_users(
  snapshot: &SnapshotStore,
  reference: &ConversationRef,
  viewer: &str,
  now_ms: i64,
  ttl_ms: i64,
) -> Vec<String> {
  let mut seen = HashSet::new();
  snapshot
    .typing(reference)
    .iter()
    .filter(|t| t.user_id != viewer && t.is_live(now_ms, ttl_ms))
    .filter(|t| seen.insert(t.user_id.clone()))
    .map(|t| {
      if t.username.trim().is_empty() {
        user_label(snapshot, &t.user_id)
      } else {
        t.username.clone()
      }
    })
    .collect()
}

/// Render the typing indicator line, or `None` when nobody is typing.
pub fn typing_line(names: &[String]) -> Option<String> {
  if names.is_empty() {
    None
  } else {
    Some(format!("{} typing...", names.join(", ")))
  }
}

// ─── Directory & notifications ───────────────────────────────────────────────

/// Directory search: every user but the viewer whose name or handle contains
/// `filter`, case-insensitively.
pub fn directory<'a>(
  snapshot: &'a SnapshotStore,
  viewer: &str,
  filter: &str,
) -> Vec<&'a UserProfile> {
  let needle = filter.trim().to_lowercase();
  snapshot
    .users()
    .filter(|u| u.id != viewer)
    .filter(|u| u.matches(&needle))
    .collect()
}

/// Group search by name, case-insensitively.
pub fn groups_matching<'a>(snapshot: &'a SnapshotStore, filter: &str) -> Vec<&'a Group> {
  let needle = filter.trim().to_lowercase();
  snapshot
    .groups()
    .filter(|g| g.name.to_lowercase().contains(&needle))
    .collect()
}

pub fn unread_notifications(snapshot: &SnapshotStore) -> usize {
  snapshot.notifications().filter(|n| !n.read).count()
}
