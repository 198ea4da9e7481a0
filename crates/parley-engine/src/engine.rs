//! [`Engine`], the session context and its lifecycle.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
  sync::{self, broadcast},
  task::JoinHandle,
};
use tracing::{info, warn};

use parley_core::{
  conversation::ConversationRef,
  document::{Collection, FieldValue, fields},
  snapshot::SnapshotStore,
  store::RemoteStore,
  typing::now_ms,
  user::Identity,
  view::{self, ConversationSummary},
};

use crate::{
  EngineConfig, EngineEvent, Error, Result,
  events::EventBus,
  signaler::TypingState,
  subscription::{Slot, SlotState, Slots},
};

// ─── Session ─────────────────────────────────────────────────────────────────

/// Everything the engine mutates. Guarded by one mutex that is never held
/// across an `.await`.
#[derive(Debug, Default)]
pub(crate) struct Session {
  pub identity: Option<Identity>,
  pub active:   Option<ConversationRef>,
  pub snapshot: SnapshotStore,
  pub slots:    Slots,
  /// Bumped on every snapshot mutation.
  pub revision: u64,
  pub sweep:    Option<JoinHandle<()>>,
  pub typing:   TypingState,
}

impl Session {
  pub fn bump(&mut self) -> u64 {
    self.revision += 1;
    self.revision
  }

  pub fn identity(&self) -> Result<&Identity> {
    self.identity.as_ref().ok_or(Error::NotSignedIn)
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub(crate) struct Inner<S> {
  pub store:         S,
  pub config:        EngineConfig,
  pub session:       Mutex<Session>,
  pub events:        EventBus,
  /// Serialises `start`, `stop` and conversation switches, which await
  /// between reading and writing the session.
  pub lifecycle:     sync::Mutex<()>,
  /// Serialises typing upserts so they land in the order they were issued.
  pub typing_writes: sync::Mutex<()>,
}

/// The synchronisation engine for one client.
///
/// Cloning is cheap; clones share the same session. Background tasks hold
/// clones too, so call [`Engine::stop`] before dropping the last handle.
pub struct Engine<S> {
  pub(crate) inner: Arc<Inner<S>>,
}

impl<S> Clone for Engine<S> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<S: RemoteStore + 'static> Engine<S> {
  pub fn new(store: S, config: EngineConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        config,
        session: Mutex::new(Session::default()),
        events: EventBus::new(),
        lifecycle: sync::Mutex::new(()),
        typing_writes: sync::Mutex::new(()),
      }),
    }
  }

  pub fn store(&self) -> &S { &self.inner.store }

  pub fn config(&self) -> &EngineConfig { &self.inner.config }

  /// Receive an [`EngineEvent`] for every snapshot change from now on.
  pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
    self.inner.events.subscribe()
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  pub fn identity(&self) -> Option<Identity> { self.inner.session.lock().identity.clone() }

  pub fn active(&self) -> Option<ConversationRef> { self.inner.session.lock().active.clone() }

  pub fn revision(&self) -> u64 { self.inner.session.lock().revision }

  pub fn slot_state(&self, slot: Slot) -> SlotState { self.inner.session.lock().slots.state(slot) }

  /// Run a read-only projection over the current snapshot.
  pub fn read<R>(&self, f: impl FnOnce(&SnapshotStore) -> R) -> R {
    f(&self.inner.session.lock().snapshot)
  }

  /// The conversation list of the signed-in identity.
  pub fn conversations(&self, filter: &str) -> Vec<ConversationSummary> {
    let session = self.inner.session.lock();
    match &session.identity {
      Some(identity) => view::conversations(&session.snapshot, &identity.uid, filter),
      None => vec![],
    }
  }

  /// Names of the peers currently typing in the active conversation.
  pub fn typing_users(&self) -> Vec<String> {
    let session = self.inner.session.lock();
    match (&session.identity, &session.active) {
      (Some(identity), Some(active)) => view::typing_users(
        &session.snapshot,
        active,
        &identity.uid,
        now_ms(),
        self.config().typing_ttl_ms,
      ),
      _ => vec![],
    }
  }

  pub(crate) fn require_identity(&self) -> Result<Identity> {
    self.inner.session.lock().identity().cloned()
  }

  // ── Lifecycle ─────────────────────────────────────────────────────────

  /// Sign `identity` in: make sure its profile exists, mark it online and
  /// attach the identity-scoped subscriptions.
  ///
  /// Starting the identity that is already signed in only re-attaches slots
  /// that have failed since. Starting a different one stops the current
  /// session first.
  pub async fn start(&self, identity: Identity) -> Result<()> {
    if identity.uid.trim().is_empty() {
      return Err(Error::invalid("identity id is empty"));
    }
    let _lifecycle = self.inner.lifecycle.lock().await;

    let current = self.identity();
    match current {
      Some(current) if current.uid == identity.uid => {
        self.attach_identity_slots(&identity.uid);
        if let Some(active) = self.active() {
          self.attach_conversation_slots(&active);
        }
        return Ok(());
      }
      Some(_) => self.sign_out().await,
      None => {}
    }

    self.ensure_profile(&identity).await?;

    {
      let mut session = self.inner.session.lock();
      session.identity = Some(identity.clone());
      session.sweep = Some(self.spawn_sweep());
    }
    self.attach_identity_slots(&identity.uid);
    info!(user = %identity.uid, "session started");
    Ok(())
  }

  /// Sign out. Best-effort teardown writes (typing stop, presence offline)
  /// never fail the call. Afterwards every slot is detached and the snapshot
  /// is empty. Stopping a stopped engine is a no-op.
  pub async fn stop(&self) {
    let _lifecycle = self.inner.lifecycle.lock().await;
    self.sign_out().await;
  }

  async fn sign_out(&self) {
    let (identity, active, sweep) = {
      let mut session = self.inner.session.lock();
      (
        session.identity.clone(),
        session.active.clone(),
        session.sweep.take(),
      )
    };
    let Some(identity) = identity else {
      return;
    };
    if let Some(sweep) = sweep {
      sweep.abort();
    }

    if let Some(active) = &active {
      self.stop_typing(active).await;
    }
    if let Err(e) = self.set_presence(false).await {
      warn!(user = %identity.uid, error = %e, "could not mark profile offline");
    }

    for slot in Slot::ALL {
      self.detach(slot).await;
    }

    let revision = {
      let mut session = self.inner.session.lock();
      session.snapshot.clear();
      session.active = None;
      session.identity = None;
      session.typing.reset();
      session.bump()
    };
    self.inner.events.emit(EngineEvent::Cleared { revision });
    info!(user = %identity.uid, "session stopped");
  }

  /// Make `conversation` the active one. The previous conversation's
  /// message and typing subscriptions are fully detached before the new
  /// ones attach.
  pub async fn open_conversation(&self, conversation: ConversationRef) -> Result<()> {
    let _lifecycle = self.inner.lifecycle.lock().await;
    let previous = {
      let session = self.inner.session.lock();
      session.identity()?;
      session.active.clone()
    };

    if previous.as_ref() == Some(&conversation) {
      self.attach_conversation_slots(&conversation);
      return Ok(());
    }
    if let Some(previous) = &previous {
      self.stop_typing(previous).await;
    }
    for slot in Slot::CONVERSATION {
      self.detach(slot).await;
    }

    {
      let mut session = self.inner.session.lock();
      session.identity()?;
      session.active = Some(conversation.clone());
    }
    self.attach_conversation_slots(&conversation);
    info!(%conversation, "opened conversation");
    Ok(())
  }

  /// Clear the active conversation and detach its subscriptions.
  pub async fn close_conversation(&self) {
    let _lifecycle = self.inner.lifecycle.lock().await;
    let previous = self.inner.session.lock().active.take();
    if let Some(previous) = &previous {
      self.stop_typing(previous).await;
    }
    for slot in Slot::CONVERSATION {
      self.detach(slot).await;
    }
  }

  /// Create the profile on first sign-in, otherwise mark it online.
  async fn ensure_profile(&self, identity: &Identity) -> Result<()> {
    let store = self.store();
    let existing = store
      .get_doc(Collection::Users, &identity.uid)
      .await
      .map_err(Error::read)?;

    let update = match existing {
      Some(_) => fields([
        ("online", FieldValue::set(true)),
        ("lastSeen", FieldValue::ServerTimestamp),
      ]),
      None => {
        info!(user = %identity.uid, "creating profile");
        fields([
          ("username", FieldValue::set(identity.fallback_name())),
          ("email", FieldValue::set(identity.email.clone().unwrap_or_default())),
          ("online", FieldValue::set(true)),
          ("lastSeen", FieldValue::ServerTimestamp),
          ("createdAt", FieldValue::ServerTimestamp),
        ])
      }
    };

    store
      .set_doc(Collection::Users, &identity.uid, update, true)
      .await
      .map_err(Error::write)
  }
}
