//! Change notifications for the presentation layer.
//!
//! Every Snapshot Store mutation bumps the session revision and is announced
//! on a broadcast bus. Receivers re-derive their views on `Changed`; they
//! never receive data through the bus.

use tokio::sync::broadcast;

use crate::subscription::Slot;

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
  /// The snapshot changed because of `slot`'s data (an emission, a manual
  /// refresh or a typing sweep).
  Changed { slot: Slot, revision: u64 },
  /// The subscription behind `slot` failed. Its data is left as it was.
  SubscriptionFailed { slot: Slot, error: String },
  /// The session ended and the snapshot was emptied.
  Cleared { revision: u64 },
}

/// Fan-out of [`EngineEvent`]s. Lagging receivers lose the oldest events,
/// which is harmless since every event only says "re-derive".
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
  sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    Self { sender }
  }

  pub fn emit(&self, event: EngineEvent) {
    // No receivers is fine.
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> { self.sender.subscribe() }
}
