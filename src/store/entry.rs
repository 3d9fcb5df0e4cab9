//! Cache entry types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Item;
use crate::page::Page;

/// What a cache entry holds: a paginated collection or a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheData {
  Page(Page),
  Item(Item),
}

impl CacheData {
  pub fn as_page(&self) -> Option<&Page> {
    match self {
      CacheData::Page(p) => Some(p),
      _ => None,
    }
  }

  pub fn as_item(&self) -> Option<&Item> {
    match self {
      CacheData::Item(i) => Some(i),
      _ => None,
    }
  }

  pub fn into_page(self) -> Option<Page> {
    match self {
      CacheData::Page(p) => Some(p),
      _ => None,
    }
  }
}

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
  /// Nothing fetched yet.
  Idle,
  /// A fetch is in flight. Previously fetched data, if any, is retained.
  Loading,
  /// Data is current.
  Fresh,
  /// Data is past its stale time and should be refreshed on next use.
  Stale,
  /// The last fetch failed. Last-good data is retained, never blanked.
  Error,
}

/// One cached query result. Owned exclusively by the store and mutated only
/// through its API; subscriber bookkeeping lives in the store, not here, so
/// entries stay cheap to snapshot and compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub data: Option<CacheData>,
  pub status: EntryStatus,
  pub last_fetched_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

impl CacheEntry {
  pub fn idle() -> Self {
    Self {
      data: None,
      status: EntryStatus::Idle,
      last_fetched_at: None,
      last_error: None,
    }
  }

  pub fn page(&self) -> Option<&Page> {
    self.data.as_ref().and_then(CacheData::as_page)
  }

  pub fn item(&self) -> Option<&Item> {
    self.data.as_ref().and_then(CacheData::as_item)
  }

  /// Status as seen by views: a `Fresh` entry older than `stale_after`
  /// reads as `Stale`.
  pub fn effective_status(&self, stale_after: Duration) -> EntryStatus {
    match (self.status, self.last_fetched_at) {
      (EntryStatus::Fresh, Some(at)) if Utc::now() - at > stale_after => EntryStatus::Stale,
      (status, _) => status,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_effective_status_turns_stale() {
    let entry = CacheEntry {
      data: None,
      status: EntryStatus::Fresh,
      last_fetched_at: Some(Utc::now() - Duration::seconds(600)),
      last_error: None,
    };
    assert_eq!(
      entry.effective_status(Duration::seconds(300)),
      EntryStatus::Stale
    );
    assert_eq!(
      entry.effective_status(Duration::seconds(3600)),
      EntryStatus::Fresh
    );
  }

  #[test]
  fn test_effective_status_passes_through_other_states() {
    let mut entry = CacheEntry::idle();
    assert_eq!(
      entry.effective_status(Duration::seconds(1)),
      EntryStatus::Idle
    );
    entry.status = EntryStatus::Error;
    assert_eq!(
      entry.effective_status(Duration::seconds(1)),
      EntryStatus::Error
    );
  }
}
