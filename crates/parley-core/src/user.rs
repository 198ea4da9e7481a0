//! The signed-in identity and the user directory entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{Collection, Entity};

/// The signed-in principal, as supplied by the external auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
  pub uid:          String,
  pub display_name: Option<String>,
  pub email:        Option<String>,
}

impl Identity {
  pub fn new(uid: impl Into<String>) -> Self {
    Self {
      uid:          uid.into(),
      display_name: None,
      email:        None,
    }
  }

  pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
    self.display_name = Some(name.into());
    self
  }

  pub fn with_email(mut self, email: impl Into<String>) -> Self {
    self.email = Some(email.into());
    self
  }

  /// Name for a freshly created profile: the display name, else the local
  /// part of the email, else `"user"`.
  pub fn fallback_name(&self) -> String {
    self
      .display_name
      .as_deref()
      .filter(|n| !n.trim().is_empty())
      .or_else(|| {
        self
          .email
          .as_deref()
          .and_then(|e| e.split('@').next())
          .filter(|local| !local.is_empty())
      })
      .unwrap_or("user")
      .to_owned()
  }
}

/// A directory entry. Created on first sign-in, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
  pub id:             String,
  #[serde(rename = "username", default)]
  pub display_name:   String,
  #[serde(rename = "email", default)]
  pub contact_handle: String,
  #[serde(default)]
  pub online:         bool,
  #[serde(rename = "lastSeen", default)]
  pub last_seen_at:   Option<DateTime<Utc>>,
  #[serde(default)]
  pub created_at:     Option<DateTime<Utc>>,
}

impl UserProfile {
  /// Display name, falling back to the contact handle.
  pub fn label(&self) -> Option<&str> {
    [&self.display_name, &self.contact_handle]
      .into_iter()
      .map(|s| s.trim())
      .find(|s| !s.is_empty())
  }

  /// Case-insensitive match of `needle` against name and handle. `needle`
  /// must already be lowercase.
  pub fn matches(&self, needle: &str) -> bool {
    self.display_name.to_lowercase().contains(needle)
      || self.contact_handle.to_lowercase().contains(needle)
  }
}

impl Entity for UserProfile {
  const COLLECTION: Collection = Collection::Users;

  fn id(&self) -> &str { &self.id }
}
