//! Cursor-based incremental fetch over ordered remote collections.
//!
//! One fetch per key at a time: `load_next` is a no-op while a fetch for the
//! same key is in flight or once the collection is exhausted. Every fetch
//! carries a per-key sequence number; a response whose sequence has been
//! superseded (by `cancel` or by a later `refresh`) is dropped on arrival.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::keys::CacheKey;
use crate::model::{Identity, Item};
use crate::page::Page;
use crate::remote::{normalize_items, PageRequest, RemoteApi};
use crate::store::{CacheData, CacheStore, EntryStatus};

#[derive(Default)]
struct RequestState {
  /// Last issued sequence number for this key.
  seq: u64,
  /// Sequence number of the fetch currently in flight, if any.
  in_flight: Option<u64>,
}

/// Drives paginated fetching for collection and detail keys.
pub struct Paginator {
  store: CacheStore,
  remote: Arc<dyn RemoteApi>,
  identity: Arc<Identity>,
  config: SyncConfig,
  requests: Mutex<HashMap<CacheKey, RequestState>>,
}

impl Paginator {
  pub fn new(
    store: CacheStore,
    remote: Arc<dyn RemoteApi>,
    identity: Arc<Identity>,
    config: SyncConfig,
  ) -> Self {
    Self {
      store,
      remote,
      identity,
      config,
      requests: Mutex::new(HashMap::new()),
    }
  }

  /// Fetch the next page for `key` and append it, skipping ids already
  /// present. No-op when the collection is exhausted or a fetch for this key
  /// is already in flight.
  pub async fn load_next(&self, key: &CacheKey) -> Result<(), SyncError> {
    let cursor = match self.store.get(key).as_ref().and_then(|e| e.page()) {
      Some(page) if !page.has_more => {
        debug!(key = %key, "load_next on exhausted collection; no-op");
        return Ok(());
      }
      Some(page) => page.cursor.clone(),
      None => None,
    };

    let Some(seq) = self.begin(key) else {
      debug!(key = %key, "load_next while fetch in flight; no-op");
      return Ok(());
    };

    self.store.set_status(key, EntryStatus::Loading, None);
    let result = self
      .remote
      .fetch_page(PageRequest {
        key: key.clone(),
        cursor,
        limit: self.config.page_size,
      })
      .await;

    if !self.finish(key, seq) {
      debug!(key = %key, seq, "dropping superseded page response");
      return Ok(());
    }

    match result {
      Ok(response) => {
        let cursor = response.cursor();
        let items = normalize_items(response.items, &self.identity);
        if key.is_collection() {
          let page = match self.store.get(key).and_then(|e| e.data).and_then(CacheData::into_page) {
            Some(mut page) => {
              page.append_fetch(items, cursor);
              page
            }
            None => Page::from_fetch(items, cursor, key.ordering()),
          };
          self.store.set(key, Some(CacheData::Page(page)), EntryStatus::Fresh);
        } else {
          self.store.set(
            key,
            items.into_iter().next().map(CacheData::Item),
            EntryStatus::Fresh,
          );
        }
        Ok(())
      }
      Err(err) => {
        // Last-good data is retained; only the status flips.
        self
          .store
          .set_status(key, EntryStatus::Error, Some(err.message.clone()));
        Err(err.into())
      }
    }
  }

  /// Replace the head of the collection. Already-loaded downstream items are
  /// kept when the refreshed set overlaps them; a disjoint refresh means the
  /// ordering may have shifted, so downstream items are discarded and must
  /// be reloaded.
  pub async fn refresh(&self, key: &CacheKey) -> Result<(), SyncError> {
    // A refresh supersedes whatever fetch is in flight for this key.
    let seq = self.begin_superseding(key);

    self.store.set_status(key, EntryStatus::Loading, None);
    let result = self
      .remote
      .fetch_page(PageRequest {
        key: key.clone(),
        cursor: None,
        limit: self.config.page_size,
      })
      .await;

    if !self.finish(key, seq) {
      debug!(key = %key, seq, "dropping superseded refresh response");
      return Ok(());
    }

    match result {
      Ok(response) => {
        let cursor = response.cursor();
        let items = normalize_items(response.items, &self.identity);
        if key.is_collection() {
          let previous = self.store.get(key).and_then(|e| e.data).and_then(CacheData::into_page);
          let page = merge_refresh(previous, items, cursor, key);
          self.store.set(key, Some(CacheData::Page(page)), EntryStatus::Fresh);
        } else {
          self.store.set(
            key,
            items.into_iter().next().map(CacheData::Item),
            EntryStatus::Fresh,
          );
        }
        Ok(())
      }
      Err(err) => {
        self
          .store
          .set_status(key, EntryStatus::Error, Some(err.message.clone()));
        Err(err.into())
      }
    }
  }

  /// Fetch only when needed: initial load when the entry is empty, refresh
  /// when it has gone stale, otherwise nothing.
  pub async fn ensure(&self, key: &CacheKey) -> Result<(), SyncError> {
    let entry = self.store.get(key);
    match entry {
      None => self.load_next(key).await,
      Some(entry) if entry.data.is_none() => self.load_next(key).await,
      Some(entry) => {
        if entry.effective_status(self.config.stale_after()) == EntryStatus::Stale {
          self.refresh(key).await
        } else {
          Ok(())
        }
      }
    }
  }

  /// Drop the in-flight fetch for `key`, if any. Its eventual response is
  /// ignored on arrival.
  pub fn cancel(&self, key: &CacheKey) {
    let cancelled = {
      let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
      let state = requests.entry(key.clone()).or_default();
      if state.in_flight.is_some() {
        state.seq += 1;
        state.in_flight = None;
        true
      } else {
        false
      }
    };
    if cancelled {
      debug!(key = %key, "fetch cancelled");
      if let Some(entry) = self.store.get(key) {
        if entry.status == EntryStatus::Loading {
          let status = if entry.data.is_some() {
            EntryStatus::Stale
          } else {
            EntryStatus::Idle
          };
          self.store.set_status(key, status, None);
        }
      }
    }
  }

  /// Claim the in-flight slot; `None` when a fetch is already running.
  fn begin(&self, key: &CacheKey) -> Option<u64> {
    let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
    let state = requests.entry(key.clone()).or_default();
    if state.in_flight.is_some() {
      return None;
    }
    state.seq += 1;
    state.in_flight = Some(state.seq);
    Some(state.seq)
  }

  /// Claim the in-flight slot unconditionally, superseding any running fetch.
  fn begin_superseding(&self, key: &CacheKey) -> u64 {
    let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
    let state = requests.entry(key.clone()).or_default();
    state.seq += 1;
    state.in_flight = Some(state.seq);
    state.seq
  }

  /// Release the in-flight slot. False when this fetch was superseded and
  /// its response must be dropped.
  fn finish(&self, key: &CacheKey, seq: u64) -> bool {
    let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
    let state = requests.entry(key.clone()).or_default();
    if state.in_flight == Some(seq) {
      state.in_flight = None;
      true
    } else {
      false
    }
  }
}

/// Merge a refreshed head page with the previously loaded collection.
fn merge_refresh(
  previous: Option<Page>,
  items: Vec<Item>,
  cursor: Option<crate::page::Cursor>,
  key: &CacheKey,
) -> Page {
  let Some(old) = previous else {
    return Page::from_fetch(items, cursor, key.ordering());
  };

  let fresh_ids: HashSet<&str> = items.iter().map(|i| i.id()).collect();
  let tail: Vec<Item> = old
    .items
    .iter()
    .filter(|i| !fresh_ids.contains(i.id()))
    .cloned()
    .collect();
  let overlapped = tail.len() < old.items.len();

  if tail.is_empty() {
    // The refreshed set covers everything we had.
    Page::from_fetch(items, cursor, key.ordering())
  } else if overlapped {
    // Contiguous with what we had: keep the tail and its continuation.
    let mut page = Page::from_fetch(items, old.cursor.clone(), key.ordering());
    page.has_more = old.has_more;
    for item in tail {
      if !page.contains(item.id()) {
        page.items.push(item);
      }
    }
    page
  } else {
    debug!(key = %key, dropped = tail.len(), "disjoint refresh; discarding downstream pages");
    Page::from_fetch(items, cursor, key.ordering())
  }
}
