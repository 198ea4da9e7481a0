//! Ephemeral typing signals.
//!
//! There is one record per `(conversation, user)`; each write overwrites the
//! previous one. A record counts as live only while it says `is_typing` and
//! is younger than the TTL, measured against the local wall clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  conversation::ConversationRef,
  document::{Collection, Entity},
};

/// Default lifetime of a typing signal.
pub const TYPING_TTL_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
  pub id:                String,
  #[serde(rename = "chatRef")]
  pub conversation:      ConversationRef,
  pub user_id:           String,
  #[serde(default)]
  pub username:          String,
  #[serde(default)]
  pub is_typing:         bool,
  /// Sender's wall clock at write time, in Unix milliseconds.
  #[serde(default)]
  pub updated_at_ms:     i64,
  #[serde(rename = "updatedAt", default)]
  pub updated_at_server: Option<DateTime<Utc>>,
}

impl TypingSignal {
  pub fn is_live(&self, now_ms: i64, ttl_ms: i64) -> bool {
    self.is_typing && now_ms - self.updated_at_ms < ttl_ms
  }
}

impl Entity for TypingSignal {
  const COLLECTION: Collection = Collection::TypingSignals;

  fn id(&self) -> &str { &self.id }
}

/// Document id of the single typing record for `(conversation, user_id)`.
pub fn typing_doc_id(conversation: &ConversationRef, user_id: &str) -> String {
  format!("{}_{}_{}", conversation.kind, conversation.id, user_id)
}

/// Local wall clock in Unix milliseconds.
pub fn now_ms() -> i64 { Utc::now().timestamp_millis() }
