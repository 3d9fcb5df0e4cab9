//! Remote API trait and its request/response envelopes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::keys::CacheKey;
use crate::page::Cursor;

use super::api_types::ApiItem;

/// A page fetch against one remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
  pub key: CacheKey,
  pub cursor: Option<Cursor>,
  pub limit: usize,
}

/// One fetched page, still in wire shape.
#[derive(Debug, Clone, Deserialize)]
pub struct PageResponse {
  pub items: Vec<ApiItem>,
  pub next_cursor: Option<String>,
}

impl PageResponse {
  pub fn cursor(&self) -> Option<Cursor> {
    self.next_cursor.clone().map(Cursor)
  }
}

/// A mutation against one remote resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationRequest {
  /// Resource collection, e.g. `"posts"`, `"likes"`, `"messages"`.
  pub resource: &'static str,
  /// Target id for updates/deletes/toggles; absent for creations.
  pub id: Option<String>,
  /// Field payload, server-validated.
  pub fields: Value,
}

/// Mutation result. Deletes return no item.
#[derive(Debug, Clone, Deserialize)]
pub struct MutationResponse {
  pub item: Option<ApiItem>,
}

/// Error envelope returned by the remote API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
  pub code: String,
  pub message: String,
}

impl ApiError {
  pub fn network(message: impl Into<String>) -> Self {
    Self {
      code: "network".into(),
      message: message.into(),
    }
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self {
      code: "conflict".into(),
      message: message.into(),
    }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self {
      code: "not_found".into(),
      message: message.into(),
    }
  }
}

impl From<ApiError> for SyncError {
  fn from(err: ApiError) -> Self {
    match err.code.as_str() {
      "conflict" => SyncError::Conflict(err.message),
      "not_found" => SyncError::NotFound(err.message),
      _ => SyncError::Network(err.message),
    }
  }
}

/// The hosted data backend, seen through the only two calls the engine makes.
///
/// Transport details (HTTP, retries at the connection layer, auth headers)
/// live behind this trait and are out of the engine's hands. Privacy
/// filtering also happens behind it; the engine performs no access control.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError>;

  async fn mutate(&self, request: MutationRequest) -> Result<MutationResponse, ApiError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_envelope_mapping() {
    assert_eq!(
      SyncError::from(ApiError::network("timeout")),
      SyncError::Network("timeout".into())
    );
    assert_eq!(
      SyncError::from(ApiError::conflict("stale version")),
      SyncError::Conflict("stale version".into())
    );
    assert_eq!(
      SyncError::from(ApiError::not_found("gone")),
      SyncError::NotFound("gone".into())
    );
    // Unknown codes degrade to transient network errors.
    let odd = ApiError {
      code: "weird".into(),
      message: "??".into(),
    };
    assert!(SyncError::from(odd).is_transient());
  }
}
