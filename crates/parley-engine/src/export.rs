//! One-shot export of everything visible to the signed-in identity.

use chrono::{DateTime, Utc};
use serde::Serialize;

use parley_core::{
  conversation::{DirectChat, Group},
  document::{Collection, Document, Filter, Query},
  store::RemoteStore,
};

use crate::{
  Engine, Error, Result,
  subscription::{decode_all, direct_chats_query, groups_query, messages_query},
};

/// Raw documents, as stored, grouped by collection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
  pub exported_at:   DateTime<Utc>,
  pub user_id:       String,
  pub users:         Vec<Document>,
  pub direct_chats:  Vec<Document>,
  pub groups:        Vec<Document>,
  /// Messages of every conversation in `direct_chats` and `groups`.
  pub messages:      Vec<Document>,
  pub notifications: Vec<Document>,
}

impl<S: RemoteStore + 'static> Engine<S> {
  /// Read the viewer's data straight from the store. The snapshot is not
  /// consulted, so the bundle is complete even for conversations that were
  /// never opened.
  pub async fn export(&self) -> Result<ExportBundle> {
    let uid = self.require_identity()?.uid;

    let users = self.fetch(&Query::new(Collection::Users)).await?;
    let direct_chats = self.fetch(&direct_chats_query(&uid)).await?;
    let groups = self.fetch(&groups_query(&uid)).await?;
    let notifications = self
      .fetch(&Query::new(Collection::Notifications).filter(Filter::eq("userId", uid.as_str())))
      .await?;

    let references = decode_all::<DirectChat>(&direct_chats)
      .iter()
      .map(DirectChat::reference)
      .chain(decode_all::<Group>(&groups).iter().map(Group::reference))
      .collect::<Vec<_>>();
    let mut messages = vec![];
    for reference in &references {
      messages.extend(self.fetch(&messages_query(reference)).await?);
    }

    Ok(ExportBundle {
      exported_at: Utc::now(),
      user_id: uid,
      users,
      direct_chats,
      groups,
      messages,
      notifications,
    })
  }

  async fn fetch(&self, query: &Query) -> Result<Vec<Document>> {
    self.store().get_once(query).await.map_err(Error::read)
  }
}
