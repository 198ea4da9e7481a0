//! Presence and typing signals.
//!
//! Typing is one upserted record per `(conversation, user)`. Input activity
//! raises it at most once per burst and schedules the matching stop after a
//! quiet interval; the stop timer is a single task handle owned by
//! [`TypingState`] and only ever replaced through [`Engine::input_activity`].
//!
//! Upserts are serialised, and `outstanding` is cleared before a stop is
//! written, so activity during an in-flight stop always raises again and
//! lands after it.

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_core::{
  conversation::ConversationRef,
  document::{Collection, FieldValue, fields},
  snapshot::SnapshotStore,
  store::RemoteStore,
  typing::{now_ms, typing_doc_id},
  user::Identity,
};

use crate::{Engine, Error, Result};

/// Debounce state of the local typing signal.
#[derive(Debug, Default)]
pub(crate) struct TypingState {
  /// Conversation for which `is_typing = true` was last written.
  pub outstanding:  Option<ConversationRef>,
  pub pending_stop: Option<JoinHandle<()>>,
  /// Identifies the current `pending_stop`, so a superseded timer cannot
  /// clear its successor.
  pub epoch:        u64,
}

impl TypingState {
  fn cancel_pending(&mut self) {
    if let Some(timer) = self.pending_stop.take() {
      timer.abort();
    }
  }

  /// Forget `outstanding` if it is `conversation`, ahead of writing the
  /// matching stop.
  fn release(&mut self, conversation: &ConversationRef) {
    if self.outstanding.as_ref() == Some(conversation) {
      self.outstanding = None;
    }
  }

  pub fn reset(&mut self) {
    self.cancel_pending();
    self.outstanding = None;
  }
}

impl<S: RemoteStore + 'static> Engine<S> {
  /// Upsert the viewer's typing record for `conversation`.
  pub async fn set_typing(&self, conversation: &ConversationRef, is_typing: bool) -> Result<()> {
    let (identity, username) = {
      let session = self.inner.session.lock();
      let identity = session.identity()?.clone();
      let username = own_name(&session.snapshot, &identity);
      (identity, username)
    };

    let _ordered = self.inner.typing_writes.lock().await;
    let id = typing_doc_id(conversation, &identity.uid);
    let update = fields([
      ("chatRef", FieldValue::set(conversation.to_string())),
      ("userId", FieldValue::set(identity.uid.as_str())),
      ("username", FieldValue::set(username)),
      ("isTyping", FieldValue::set(is_typing)),
      ("updatedAtMs", FieldValue::set(now_ms())),
      ("updatedAt", FieldValue::ServerTimestamp),
    ]);
    self
      .store()
      .set_doc(Collection::TypingSignals, &id, update, true)
      .await
      .map_err(Error::write)?;

    if is_typing {
      self.inner.session.lock().typing.outstanding = Some(conversation.clone());
    }
    Ok(())
  }

  /// Record input activity in the active conversation: signal typing unless
  /// already signalled, and push the stop back by the quiet interval.
  pub async fn input_activity(&self) -> Result<()> {
    let (active, outstanding) = {
      let mut session = self.inner.session.lock();
      session.identity()?;
      session.typing.cancel_pending();
      let Some(active) = session.active.clone() else {
        return Ok(());
      };
      let outstanding = session.typing.outstanding.as_ref() == Some(&active);
      (active, outstanding)
    };

    if !outstanding {
      self.set_typing(&active, true).await?;
    }
    self.schedule_stop(active);
    Ok(())
  }

  /// Input lost focus: stop typing right away.
  pub async fn input_blur(&self) {
    let active = self.active();
    if let Some(active) = &active {
      self.stop_typing(active).await;
    }
  }

  /// Replace the pending stop timer with one for `conversation`.
  fn schedule_stop(&self, conversation: ConversationRef) {
    let engine = self.clone();
    let quiet = self.config().typing_quiet();

    let mut session = self.inner.session.lock();
    session.typing.cancel_pending();
    session.typing.epoch += 1;
    let epoch = session.typing.epoch;

    session.typing.pending_stop = Some(tokio::spawn(async move {
      tokio::time::sleep(quiet).await;
      {
        let mut session = engine.inner.session.lock();
        if session.typing.epoch != epoch {
          return;
        }
        session.typing.pending_stop = None;
        session.typing.release(&conversation);
      }
      debug!(%conversation, "typing went quiet");
      if let Err(e) = engine.set_typing(&conversation, false).await {
        warn!(%conversation, error = %e, "could not clear typing signal");
      }
    }));
  }

  /// Cancel any pending stop and write `is_typing = false` now. Best effort.
  pub(crate) async fn stop_typing(&self, conversation: &ConversationRef) {
    {
      let mut session = self.inner.session.lock();
      session.typing.cancel_pending();
      session.typing.release(conversation);
    }
    if let Err(e) = self.set_typing(conversation, false).await {
      warn!(%conversation, error = %e, "could not clear typing signal");
    }
  }

  /// Write the viewer's presence.
  pub async fn set_presence(&self, online: bool) -> Result<()> {
    let identity = self.require_identity()?;
    let update = fields([
      ("online", FieldValue::set(online)),
      ("lastSeen", FieldValue::ServerTimestamp),
    ]);
    self
      .store()
      .set_doc(Collection::Users, &identity.uid, update, true)
      .await
      .map_err(Error::write)
  }
}

/// The viewer's display name: the loaded profile, else the identity's
/// fallback.
pub(crate) fn own_name(snapshot: &SnapshotStore, identity: &Identity) -> String {
  match snapshot.user(&identity.uid).and_then(|p| p.label()) {
    Some(name) => name.to_owned(),
    None => identity.fallback_name(),
  }
}
