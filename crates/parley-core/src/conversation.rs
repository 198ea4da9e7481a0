//! Conversations (direct chats and groups) and the [`ConversationRef`] key
//! that addresses them everywhere else.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error,
  document::{Collection, Entity},
};

// ─── Addressing ──────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConversationKind {
  Direct,
  Group,
}

/// Stable `(kind, id)` key of a conversation. Its wire form is
/// `"<kind>:<id>"`, e.g. `"group:4f1c"`.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationRef {
  pub kind: ConversationKind,
  pub id:   String,
}

impl ConversationRef {
  pub fn direct(id: impl Into<String>) -> Self {
    Self {
      kind: ConversationKind::Direct,
      id:   id.into(),
    }
  }

  pub fn group(id: impl Into<String>) -> Self {
    Self {
      kind: ConversationKind::Group,
      id:   id.into(),
    }
  }
}

impl fmt::Display for ConversationRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.id)
  }
}

impl FromStr for ConversationRef {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let malformed = || Error::MalformedRef(s.to_owned());
    let (kind, id) = s.split_once(':').ok_or_else(malformed)?;
    let kind = kind.parse::<ConversationKind>().map_err(|_| malformed())?;
    if id.is_empty() {
      return Err(malformed());
    }
    Ok(Self {
      kind,
      id: id.to_owned(),
    })
  }
}

impl TryFrom<String> for ConversationRef {
  type Error = Error;

  fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<ConversationRef> for String {
  fn from(value: ConversationRef) -> Self { value.to_string() }
}

// ─── Entities ────────────────────────────────────────────────────────────────

/// A one-to-one conversation. Well-formed chats have exactly two distinct
/// members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectChat {
  pub id:         String,
  #[serde(default)]
  pub members:    Vec<String>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

impl DirectChat {
  pub fn reference(&self) -> ConversationRef { ConversationRef::direct(&self.id) }

  pub fn is_well_formed(&self) -> bool {
    self.members.len() == 2 && self.members[0] != self.members[1]
  }

  /// The member that is not `viewer`.
  pub fn peer_of(&self, viewer: &str) -> Option<&str> {
    self.members.iter().map(String::as_str).find(|m| *m != viewer)
  }

  /// True when the unordered member pair is exactly `{a, b}`.
  pub fn connects(&self, a: &str, b: &str) -> bool {
    self.is_well_formed()
      && self.members.iter().any(|m| m == a)
      && self.members.iter().any(|m| m == b)
  }
}

impl Entity for DirectChat {
  const COLLECTION: Collection = Collection::DirectChats;

  fn id(&self) -> &str { &self.id }
}

/// A named multi-member conversation with a single owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
  pub id:         String,
  #[serde(default)]
  pub name:       String,
  #[serde(default)]
  pub members:    Vec<String>,
  #[serde(rename = "adminId", default)]
  pub owner_id:   String,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

impl Group {
  pub fn reference(&self) -> ConversationRef { ConversationRef::group(&self.id) }

  pub fn is_member(&self, user_id: &str) -> bool {
    self.members.iter().any(|m| m == user_id)
  }

  pub fn is_owner(&self, user_id: &str) -> bool { self.owner_id == user_id }
}

impl Entity for Group {
  const COLLECTION: Collection = Collection::Groups;

  fn id(&self) -> &str { &self.id }
}

/// Either kind of conversation, resolved from the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Conversation {
  Direct(DirectChat),
  Group(Group),
}

impl Conversation {
  pub fn reference(&self) -> ConversationRef {
    match self {
      Self::Direct(chat) => chat.reference(),
      Self::Group(group) => group.reference(),
    }
  }

  pub fn members(&self) -> &[String] {
    match self {
      Self::Direct(chat) => &chat.members,
      Self::Group(group) => &group.members,
    }
  }

  /// Every member except `user_id`.
  pub fn others<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a str> {
    self
      .members()
      .iter()
      .map(String::as_str)
      .filter(move |m| *m != user_id)
  }
}
