//! Error taxonomy for the sync engine.
//!
//! Every fallible engine API returns `Result<T, SyncError>`. The engine never
//! retries on its own; retry policy belongs to the caller.

use thiserror::Error;

/// Errors surfaced by the sync engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// A fetch or mutation failed to reach the remote API.
  #[error("network error: {0}")]
  Network(String),

  /// The server rejected a mutation due to a stale precondition.
  #[error("conflict: {0}")]
  Conflict(String),

  /// A toggle was requested while another toggle on the same target is still
  /// in flight. Resolved locally without contacting the network.
  #[error("operation already in flight for {0}")]
  Busy(String),

  /// The entity referenced by a mutation no longer exists server-side.
  #[error("not found: {0}")]
  NotFound(String),

  /// A wire payload failed validation at the normalization boundary.
  #[error("malformed payload: {0}")]
  Normalization(String),

  /// The operation was cancelled by the caller before completion.
  #[error("cancelled")]
  Cancelled,

  /// The engine has been disposed and no longer accepts work.
  #[error("engine disposed")]
  Disposed,
}

impl SyncError {
  /// Whether the error is transient and a resubmission could succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, SyncError::Network(_))
  }
}
