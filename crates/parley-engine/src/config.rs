//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use parley_core::typing::TYPING_TTL_MS;

/// Timing and sizing parameters of the engine. Every field has a default,
/// so an empty `[engine]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Age after which a typing signal no longer counts.
  pub typing_ttl_ms:      i64,
  /// Quiet interval after the last input activity before typing stops.
  pub typing_quiet_ms:    u64,
  /// Period of the sweep that prunes expired typing signals.
  pub typing_sweep_ms:    u64,
  pub notification_limit: usize,
  /// How many media messages the gallery view shows.
  pub media_window:       usize,
  /// Mark the active conversation seen on every message emission.
  pub auto_mark_seen:     bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      typing_ttl_ms:      TYPING_TTL_MS,
      typing_quiet_ms:    1_700,
      typing_sweep_ms:    3_000,
      notification_limit: 50,
      media_window:       8,
      auto_mark_seen:     true,
    }
  }
}

impl EngineConfig {
  pub fn typing_quiet(&self) -> Duration { Duration::from_millis(self.typing_quiet_ms) }

  pub fn typing_sweep(&self) -> Duration {
    // A zero period would make `tokio::time::interval` panic.
    Duration::from_millis(self.typing_sweep_ms.max(1))
  }
}
