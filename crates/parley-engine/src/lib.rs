//! Parley synchronisation engine.
//!
//! Owns the session context for one signed-in identity: the live
//! subscriptions feeding the [`SnapshotStore`](parley_core::snapshot::SnapshotStore),
//! the presence and typing signals, and the actions that write back to the
//! [`RemoteStore`](parley_core::store::RemoteStore). Writes are never applied
//! locally; they become visible once the subscriptions echo them.

mod actions;
mod engine;
mod export;
mod signaler;
mod subscription;

pub mod config;
pub mod error;
pub mod events;

pub use actions::Membership;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::EngineEvent;
pub use export::ExportBundle;
pub use subscription::{Slot, SlotState};

#[cfg(test)]
mod tests;
