//! Engine tuning knobs.

use chrono::Duration;
use serde::Deserialize;

/// Configuration for a [`SyncEngine`](crate::engine::SyncEngine) instance.
///
/// All fields have defaults suitable for an interactive client. The embedding
/// app deserializes this from whatever config surface it owns and hands it to
/// `SyncEngine::create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Seconds before a fetched entry is considered stale.
  pub stale_after_secs: i64,

  /// Number of items requested per page.
  pub page_size: usize,

  /// Maximum realtime events buffered behind a pending optimistic operation,
  /// per entity. Overflow drops the oldest buffered event.
  pub realtime_buffer_cap: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: 300,
      page_size: 20,
      realtime_buffer_cap: 64,
    }
  }
}

impl SyncConfig {
  /// Set the stale time.
  pub fn with_stale_after(mut self, secs: i64) -> Self {
    self.stale_after_secs = secs;
    self
  }

  /// Set the page size.
  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  /// Stale time as a chrono duration.
  pub fn stale_after(&self) -> Duration {
    Duration::seconds(self.stale_after_secs)
  }
}
