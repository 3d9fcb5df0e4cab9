//! Realtime transport collaborator and the events it delivers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::model::EntityRef;

/// What a push event did to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
  Insert,
  Update,
  Delete,
}

/// One push event. Transient: consumed by the router, never stored as-is.
#[derive(Debug, Clone)]
pub struct RealtimeEvent {
  pub channel: String,
  pub kind: EventKind,
  pub entity: EntityRef,
  /// Wire-shaped record; empty for deletes. Normalized at merge time.
  pub payload: Value,
  pub server_timestamp: DateTime<Utc>,
}

/// Opaque handle to one physical channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// The push channel collaborator. Delivery is at-least-once and possibly
/// out of order; the router tolerates both. Refcounting multiple logical
/// consumers onto one physical channel is the embedding layer's job.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
  async fn subscribe(
    &self,
    channel: &str,
    sink: mpsc::UnboundedSender<RealtimeEvent>,
  ) -> Result<TransportHandle, SyncError>;

  async fn unsubscribe(&self, handle: TransportHandle) -> Result<(), SyncError>;
}
