//! Notifications fanned out by state-changing actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  conversation::ConversationRef,
  document::{Collection, Entity},
};

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
  /// A new message arrived in one of the recipient's conversations.
  Message,
  /// The recipient was added to a group.
  GroupAdd,
  #[default]
  #[serde(other)]
  Other,
}

/// Created by the sender's client; only the recipient flips `read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub id:               String,
  #[serde(rename = "userId")]
  pub target_user_id:   String,
  #[serde(rename = "type", default)]
  pub kind:             NotificationKind,
  #[serde(default)]
  pub text:             String,
  #[serde(rename = "refId", default)]
  pub ref_conversation: Option<ConversationRef>,
  #[serde(default)]
  pub read:             bool,
  #[serde(default)]
  pub created_at:       Option<DateTime<Utc>>,
}

impl Entity for Notification {
  const COLLECTION: Collection = Collection::Notifications;

  fn id(&self) -> &str { &self.id }
}
