//! Error taxonomy for the sync layer.
//!
//! Absence is not an error: document reads return `Ok(None)` when the target
//! does not exist. Everything else is one of the variants below. The enum is
//! `Clone` because a single failed fetch must propagate to every caller that
//! was deduplicated onto it.

use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
  /// The backend rejected the operation for this user.
  #[error("permission denied: {0}")]
  PermissionDenied(String),

  /// Connectivity-level failure; the operation may succeed on retry.
  #[error("transient network failure: {0}")]
  Transient(String),

  /// Malformed cached or persisted data.
  #[error("serialization error: {0}")]
  Serialization(String),

  /// Local persistent store failure.
  #[error("local store error: {0}")]
  Store(String),

  /// Remote backend failure that is not known to be transient.
  #[error("backend error: {0}")]
  Backend(String),

  /// Invalid or unreadable configuration.
  #[error("config error: {0}")]
  Config(String),
}

impl SyncError {
  /// True for failures the offline queue should absorb instead of surfacing.
  pub fn is_transient(&self) -> bool {
    matches!(self, SyncError::Transient(_))
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Serialization(e.to_string())
  }
}

impl<T> From<PoisonError<T>> for SyncError {
  fn from(e: PoisonError<T>) -> Self {
    SyncError::Store(format!("lock poisoned: {e}"))
  }
}
