//! Error type for `parley-engine`.

use thiserror::Error;

use parley_core::conversation::ConversationRef;

use crate::subscription::Slot;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  /// A required field was empty or malformed. No remote call was made.
  #[error("validation failed: {0}")]
  ValidationFailed(String),

  #[error("permission denied: {0}")]
  PermissionDenied(String),

  #[error("no identity is signed in")]
  NotSignedIn,

  #[error("unknown conversation: {0}")]
  UnknownConversation(ConversationRef),

  #[error("unknown message: {0}")]
  UnknownMessage(String),

  #[error("unknown notification: {0}")]
  UnknownNotification(String),

  #[error("remote write failed: {0}")]
  RemoteWriteFailed(#[source] BoxError),

  #[error("remote read failed: {0}")]
  RemoteReadFailed(#[source] BoxError),

  #[error("subscription {slot} failed: {source}")]
  RemoteSubscriptionFailed {
    slot:   Slot,
    #[source]
    source: BoxError,
  },
}

impl Error {
  pub(crate) fn write(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::RemoteWriteFailed(Box::new(e))
  }

  pub(crate) fn read(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::RemoteReadFailed(Box::new(e))
  }

  pub(crate) fn invalid(reason: impl Into<String>) -> Self {
    Self::ValidationFailed(reason.into())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
