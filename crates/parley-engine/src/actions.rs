//! The action layer.
//!
//! Every action validates against the current snapshot, writes to the
//! remote store and returns. Nothing is inserted into the snapshot locally:
//! results show up once the subscriptions deliver them. Validation failures
//! never reach the store.

use serde_json::json;
use tracing::{debug, info, warn};

use parley_core::{
  conversation::{ConversationRef, DirectChat},
  document::{Collection, FieldValue, fields},
  message::{Draft, Message, MessageKind},
  notification::NotificationKind,
  snapshot::ScopeKey,
  store::RemoteStore,
};

use crate::{
  Engine, EngineEvent, Error, Result,
  signaler::own_name,
  subscription::{Slot, SlotState, decode_all, direct_chats_query, messages_query},
};

/// Outcome of [`Engine::toggle_group_membership`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Membership {
  Added,
  Removed,
}

impl<S: RemoteStore + 'static> Engine<S> {
  // ─── Messages ──────────────────────────────────────────────────────────────

  /// Send `draft` to `conversation`, notify every other member and clear the
  /// sender's typing signal. Returns the new message id.
  pub async fn send_message(&self, conversation: &ConversationRef, draft: Draft) -> Result<String> {
    if draft.is_empty() {
      return Err(Error::invalid("message is empty"));
    }
    let (kind, payload) = match draft.attachment {
      Some(attachment) => {
        let kind = MessageKind::from_media_type(&attachment.media_type).ok_or_else(|| {
          Error::invalid(format!("unsupported attachment type {}", attachment.media_type))
        })?;
        (kind, attachment.payload)
      }
      None => (MessageKind::Text, draft.text.trim().to_owned()),
    };

    let (identity, target, sender_name) = {
      let session = self.inner.session.lock();
      let identity = session.identity()?.clone();
      let target = session
        .snapshot
        .conversation(conversation)
        .ok_or_else(|| Error::UnknownConversation(conversation.clone()))?;
      let sender_name = own_name(&session.snapshot, &identity);
      (identity, target, sender_name)
    };
    if !target.members().iter().any(|m| *m == identity.uid) {
      return Err(Error::PermissionDenied(format!("not a member of {conversation}")));
    }

    let id = self
      .store()
      .create_doc(
        Collection::Messages,
        fields([
          ("chatRef", FieldValue::set(conversation.to_string())),
          ("senderId", FieldValue::set(identity.uid.as_str())),
          ("type", FieldValue::set(kind.to_string())),
          ("content", FieldValue::set(payload)),
          ("createdAt", FieldValue::ServerTimestamp),
          ("seenBy", FieldValue::set(json!([identity.uid]))),
          ("deleted", FieldValue::set(false)),
        ]),
      )
      .await
      .map_err(Error::write)?;

    let text = format!("New message from {sender_name}");
    for member in target.others(&identity.uid) {
      self
        .notify_quietly(member, NotificationKind::Message, &text, conversation)
        .await;
    }
    self.stop_typing(conversation).await;
    Ok(id)
  }

  /// Add the viewer to `seenBy` of every unseen peer message in
  /// `conversation`. Returns how many messages were updated; already-seen
  /// messages are skipped.
  pub async fn mark_seen(&self, conversation: &ConversationRef) -> Result<usize> {
    let (uid, unseen) = {
      let session = self.inner.session.lock();
      let uid = session.identity()?.uid.clone();
      let unseen: Vec<String> = session
        .snapshot
        .messages(conversation)
        .iter()
        .filter(|m| m.is_unread_for(&uid))
        .map(|m| m.id.clone())
        .collect();
      (uid, unseen)
    };

    for id in &unseen {
      self
        .store()
        .update_doc(
          Collection::Messages,
          id,
          fields([("seenBy", FieldValue::union(uid.as_str()))]),
        )
        .await
        .map_err(Error::write)?;
    }
    Ok(unseen.len())
  }

  /// Tombstone one of the viewer's own messages.
  pub async fn delete_message(&self, message_id: &str) -> Result<()> {
    let message = {
      let session = self.inner.session.lock();
      let uid = &session.identity()?.uid;
      let message = session
        .snapshot
        .message(message_id)
        .ok_or_else(|| Error::UnknownMessage(message_id.to_owned()))?;
      if message.sender_id != *uid {
        return Err(Error::PermissionDenied(
          "only the sender may delete a message".into(),
        ));
      }
      message.clone()
    };
    if message.deleted {
      return Ok(());
    }

    self
      .store()
      .update_doc(
        Collection::Messages,
        &message.id,
        fields([("deleted", FieldValue::set(true))]),
      )
      .await
      .map_err(Error::write)
  }

  /// One-shot re-fetch of `conversation`'s messages into the snapshot. The
  /// live subscription is left alone. Returns how many messages were loaded.
  ///
  /// When the conversation is active with a live feed that applied anything
  /// while the read was in flight, the read is older than the snapshot and
  /// is dropped.
  pub async fn refresh(&self, conversation: &ConversationRef) -> Result<usize> {
    let (uid, started_at) = {
      let session = self.inner.session.lock();
      (session.identity()?.uid.clone(), session.revision)
    };
    let docs = self
      .store()
      .get_once(&messages_query(conversation))
      .await
      .map_err(Error::read)?;
    let messages = decode_all::<Message>(&docs);
    let count = messages.len();

    let (revision, active) = {
      let mut session = self.inner.session.lock();
      if session.identity.as_ref().map(|i| i.uid.as_str()) != Some(uid.as_str()) {
        return Err(Error::NotSignedIn);
      }
      let active = session.active.as_ref() == Some(conversation);
      if active
        && session.slots.state(Slot::ActiveMessages) == SlotState::Live
        && session.revision != started_at
      {
        debug!(%conversation, count, "dropping refresh overtaken by live feed");
        return Ok(count);
      }
      session
        .snapshot
        .replace_scoped(ScopeKey::Conversation(conversation.clone()), messages);
      (session.bump(), active)
    };
    self.inner.events.emit(EngineEvent::Changed {
      slot: Slot::ActiveMessages,
      revision,
    });

    if active && self.config().auto_mark_seen {
      self.mark_seen(conversation).await?;
    }
    Ok(count)
  }

  // ─── Conversations ─────────────────────────────────────────────────────────

  /// Find or create the direct chat between the viewer and `peer_id`.
  ///
  /// The snapshot is checked first, then a one-shot query of the viewer's
  /// direct chats. Two peers creating the same chat concurrently can still
  /// end up with two chats.
  pub async fn create_direct(&self, peer_id: &str) -> Result<ConversationRef> {
    let peer_id = peer_id.trim();
    if peer_id.is_empty() {
      return Err(Error::invalid("peer id is empty"));
    }

    let (uid, known) = {
      let session = self.inner.session.lock();
      let uid = session.identity()?.uid.clone();
      let known = session
        .snapshot
        .direct_chats()
        .find(|c| c.connects(&uid, peer_id))
        .map(DirectChat::reference);
      (uid, known)
    };
    if peer_id == uid {
      return Err(Error::invalid("cannot start a direct chat with yourself"));
    }
    if let Some(existing) = known {
      return Ok(existing);
    }

    let docs = self
      .store()
      .get_once(&direct_chats_query(&uid))
      .await
      .map_err(Error::read)?;
    if let Some(existing) = decode_all::<DirectChat>(&docs)
      .into_iter()
      .find(|c| c.connects(&uid, peer_id))
    {
      return Ok(existing.reference());
    }

    let id = self
      .store()
      .create_doc(
        Collection::DirectChats,
        fields([
          ("members", FieldValue::set(json!([uid, peer_id]))),
          ("createdAt", FieldValue::ServerTimestamp),
        ]),
      )
      .await
      .map_err(Error::write)?;
    info!(chat = %id, peer = %peer_id, "created direct chat");
    Ok(ConversationRef::direct(id))
  }

  /// Create a group owned by the viewer. The owner is always a member; every
  /// other member is notified.
  pub async fn create_group(&self, name: &str, member_ids: &[String]) -> Result<ConversationRef> {
    let name = name.trim();
    if name.is_empty() {
      return Err(Error::invalid("group name is empty"));
    }
    let uid = self.require_identity()?.uid;

    let mut members = vec![uid.clone()];
    for member in member_ids.iter().map(|m| m.trim()) {
      if !member.is_empty() && !members.iter().any(|m| m == member) {
        members.push(member.to_owned());
      }
    }

    let id = self
      .store()
      .create_doc(
        Collection::Groups,
        fields([
          ("name", FieldValue::set(name)),
          ("members", FieldValue::set(json!(members))),
          ("adminId", FieldValue::set(uid.as_str())),
          ("createdAt", FieldValue::ServerTimestamp),
        ]),
      )
      .await
      .map_err(Error::write)?;
    let reference = ConversationRef::group(id);
    info!(group = %reference.id, members = members.len(), "created group");

    let text = format!("You were added to group {name}");
    for member in members.iter().filter(|m| **m != uid) {
      self
        .notify_quietly(member, NotificationKind::GroupAdd, &text, &reference)
        .await;
    }
    Ok(reference)
  }

  /// Add `user_id` to the group if absent, remove them if present. Only the
  /// owner may change anyone's membership but their own.
  pub async fn toggle_group_membership(&self, group_id: &str, user_id: &str) -> Result<Membership> {
    let (identity, group, actor_name) = {
      let session = self.inner.session.lock();
      let identity = session.identity()?.clone();
      let group = session
        .snapshot
        .group(group_id)
        .cloned()
        .ok_or_else(|| Error::UnknownConversation(ConversationRef::group(group_id)))?;
      let actor_name = own_name(&session.snapshot, &identity);
      (identity, group, actor_name)
    };

    let removing = group.is_member(user_id);
    if removing && user_id == identity.uid {
      self.leave_group(group_id).await?;
      return Ok(Membership::Removed);
    }
    if !group.is_owner(&identity.uid) {
      return Err(Error::PermissionDenied(
        "only the group owner can change membership".into(),
      ));
    }

    if removing {
      self
        .store()
        .update_doc(
          Collection::Groups,
          group_id,
          fields([("members", FieldValue::remove(user_id))]),
        )
        .await
        .map_err(Error::write)?;
      return Ok(Membership::Removed);
    }

    self
      .store()
      .update_doc(
        Collection::Groups,
        group_id,
        fields([("members", FieldValue::union(user_id))]),
      )
      .await
      .map_err(Error::write)?;
    let text = format!("{actor_name} added you to group {}", group.name);
    self
      .notify_quietly(user_id, NotificationKind::GroupAdd, &text, &group.reference())
      .await;
    Ok(Membership::Added)
  }

  /// Remove the viewer from a group. Leaving the active conversation closes
  /// it.
  pub async fn leave_group(&self, group_id: &str) -> Result<()> {
    let (uid, reference, active) = {
      let session = self.inner.session.lock();
      let uid = session.identity()?.uid.clone();
      let group = session
        .snapshot
        .group(group_id)
        .ok_or_else(|| Error::UnknownConversation(ConversationRef::group(group_id)))?;
      let reference = group.reference();
      let active = session.active.as_ref() == Some(&reference);
      (uid, reference, active)
    };

    self
      .store()
      .update_doc(
        Collection::Groups,
        group_id,
        fields([("members", FieldValue::remove(uid.as_str()))]),
      )
      .await
      .map_err(Error::write)?;
    info!(group = %reference.id, "left group");

    if active {
      self.close_conversation().await;
    }
    Ok(())
  }

  // ─── Notifications ─────────────────────────────────────────────────────────

  /// Flip one notification's read flag. Returns the new value.
  pub async fn toggle_notification_read(&self, notification_id: &str) -> Result<bool> {
    let read = {
      let session = self.inner.session.lock();
      let uid = &session.identity()?.uid;
      let notification = session
        .snapshot
        .notifications()
        .find(|n| n.id == notification_id)
        .ok_or_else(|| Error::UnknownNotification(notification_id.to_owned()))?;
      if notification.target_user_id != *uid {
        return Err(Error::PermissionDenied(
          "notification belongs to another user".into(),
        ));
      }
      !notification.read
    };

    self
      .store()
      .update_doc(
        Collection::Notifications,
        notification_id,
        fields([("read", FieldValue::set(read))]),
      )
      .await
      .map_err(Error::write)?;
    Ok(read)
  }

  /// Mark every unread notification in the snapshot read. Returns how many
  /// were updated.
  pub async fn mark_all_notifications_read(&self) -> Result<usize> {
    let unread: Vec<String> = {
      let session = self.inner.session.lock();
      session.identity()?;
      session
        .snapshot
        .notifications()
        .filter(|n| !n.read)
        .map(|n| n.id.clone())
        .collect()
    };

    for id in &unread {
      self
        .store()
        .update_doc(
          Collection::Notifications,
          id,
          fields([("read", FieldValue::set(true))]),
        )
        .await
        .map_err(Error::write)?;
    }
    Ok(unread.len())
  }

  /// Fan-out side effect of another action. A failure is logged, not
  /// returned, since the primary write already succeeded.
  async fn notify_quietly(
    &self,
    target_user_id: &str,
    kind: NotificationKind,
    text: &str,
    conversation: &ConversationRef,
  ) {
    let result = self
      .store()
      .create_doc(
        Collection::Notifications,
        fields([
          ("userId", FieldValue::set(target_user_id)),
          ("type", FieldValue::set(kind.to_string())),
          ("text", FieldValue::set(text)),
          ("refId", FieldValue::set(conversation.to_string())),
          ("read", FieldValue::set(false)),
          ("createdAt", FieldValue::ServerTimestamp),
        ]),
      )
      .await;
    if let Err(e) = result {
      warn!(user = %target_user_id, %kind, error = %e, "could not create notification");
    }
  }

  // ─── Profile ───────────────────────────────────────────────────────────────

  /// Change the viewer's display name.
  pub async fn update_display_name(&self, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
      return Err(Error::invalid("display name is empty"));
    }
    let uid = self.require_identity()?.uid;
    self
      .store()
      .set_doc(
        Collection::Users,
        &uid,
        fields([("username", FieldValue::set(name))]),
        true,
      )
      .await
      .map_err(Error::write)
  }
}
