//! Messages and outgoing message drafts.
//!
//! A message is immutable once written except for two monotonic fields:
//! `seen_by` only grows, and `deleted` only ever flips to `true`.

use std::collections::BTreeSet;

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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
  #[default]
  Text,
  Image,
  Video,
}

impl MessageKind {
  pub fn is_media(self) -> bool { matches!(self, Self::Image | Self::Video) }

  /// Map a MIME type to a media kind. Only `image/*` and `video/*` qualify.
  pub fn from_media_type(media_type: &str) -> Option<Self> {
    let top = media_type.split('/').next()?.trim().to_ascii_lowercase();
    match top.as_str() {
      "image" => Some(Self::Image),
      "video" => Some(Self::Video),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
  pub id:           String,
  #[serde(rename = "chatRef")]
  pub conversation: ConversationRef,
  pub sender_id:    String,
  #[serde(rename = "type", default)]
  pub kind:         MessageKind,
  /// Text body, or an encoded media payload for image/video messages.
  #[serde(rename = "content", default)]
  pub payload:      String,
  /// `None` until the server has acknowledged the write.
  #[serde(default)]
  pub created_at:   Option<DateTime<Utc>>,
  #[serde(default)]
  pub seen_by:      BTreeSet<String>,
  #[serde(default)]
  pub deleted:      bool,
}

impl Message {
  pub fn is_seen_by(&self, user_id: &str) -> bool { self.seen_by.contains(user_id) }

  /// Counts towards `viewer`'s unread badge.
  pub fn is_unread_for(&self, viewer: &str) -> bool {
    !self.deleted && self.sender_id != viewer && !self.is_seen_by(viewer)
  }
}

impl Entity for Message {
  const COLLECTION: Collection = Collection::Messages;

  fn id(&self) -> &str { &self.id }
}

// ─── Outgoing ────────────────────────────────────────────────────────────────

/// An encoded file attached to an outgoing message. Encoding the file is the
/// caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
  pub media_type: String,
  pub payload:    String,
}

/// What the user composed: text, an attachment, or both. When an attachment
/// is present it becomes the message payload and the text is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
  pub text:       String,
  pub attachment: Option<Attachment>,
}

impl Draft {
  pub fn text(text: impl Into<String>) -> Self {
    Self {
      text:       text.into(),
      attachment: None,
    }
  }

  pub fn attachment(media_type: impl Into<String>, payload: impl Into<String>) -> Self {
    Self {
      text:       String::new(),
      attachment: Some(Attachment {
        media_type: media_type.into(),
        payload:    payload.into(),
      }),
    }
  }

  /// True when there is neither text nor an attachment.
  pub fn is_empty(&self) -> bool {
    self.text.trim().is_empty() && self.attachment.is_none()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn media_type_mapping() {
    assert_eq!(MessageKind::from_media_type("image/png"), Some(MessageKind::Image));
    assert_eq!(MessageKind::from_media_type("Video/mp4"), Some(MessageKind::Video));
    assert_eq!(MessageKind::from_media_type("application/pdf"), None);
  }

  #[test]
  fn whitespace_draft_is_empty() {
    assert!(Draft::text("   ").is_empty());
    assert!(!Draft::text("hi").is_empty());
    assert!(!Draft::attachment("image/png", "data:...").is_empty());
  }
}
