//! The store proper: entry table, subscriber registry, write queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::debug;

use crate::keys::CacheKey;
use crate::page::Page;

use super::entry::{CacheData, CacheEntry, EntryStatus};

type Listener = Arc<dyn Fn(&CacheKey, &CacheEntry) + Send + Sync>;
type PatchFn = Box<dyn FnOnce(CacheData) -> CacheData + Send>;

/// A pending write. Writes issued while a notification pass is running are
/// queued and applied afterwards, in FIFO order.
enum Write {
  Set {
    key: CacheKey,
    data: Option<CacheData>,
    status: EntryStatus,
  },
  Patch {
    key: CacheKey,
    f: PatchFn,
  },
  SetStatus {
    key: CacheKey,
    status: EntryStatus,
    error: Option<String>,
  },
  Restore {
    key: CacheKey,
    entry: Option<CacheEntry>,
  },
  Evict {
    key: CacheKey,
  },
  MarkStale {
    key: CacheKey,
  },
}

struct Subscriber {
  id: u64,
  listener: Listener,
}

#[derive(Default)]
struct StoreInner {
  entries: HashMap<CacheKey, CacheEntry>,
  subscribers: HashMap<CacheKey, Vec<Subscriber>>,
  queue: VecDeque<Write>,
  notifying: bool,
  next_subscriber_id: u64,
}

/// Passive, observable table of cache entries.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct CacheStore {
  inner: Arc<Mutex<StoreInner>>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of the entry under `key`.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.lock().entries.get(key).cloned()
  }

  /// All keys with a live entry.
  pub fn keys(&self) -> Vec<CacheKey> {
    self.lock().entries.keys().cloned().collect()
  }

  /// Replace the entry's data and status, notifying subscribers.
  /// A `Fresh` write stamps `last_fetched_at` and clears the recorded error.
  pub fn set(&self, key: &CacheKey, data: Option<CacheData>, status: EntryStatus) {
    self.write(Write::Set {
      key: key.clone(),
      data,
      status,
    });
  }

  /// Apply a pure transform to the entry's data, notifying subscribers.
  /// No-op when the entry has no data yet.
  pub fn patch<F>(&self, key: &CacheKey, f: F)
  where
    F: FnOnce(CacheData) -> CacheData + Send + 'static,
  {
    self.write(Write::Patch {
      key: key.clone(),
      f: Box::new(f),
    });
  }

  /// Convenience for the common page transform.
  pub fn patch_page<F>(&self, key: &CacheKey, f: F)
  where
    F: FnOnce(&mut Page) + Send + 'static,
  {
    self.patch(key, move |data| match data {
      CacheData::Page(mut page) => {
        f(&mut page);
        CacheData::Page(page)
      }
      other => other,
    });
  }

  /// Transition the entry's status without touching its data. Data survives
  /// both `Loading` and `Error` transitions so views keep showing last-good
  /// content.
  pub fn set_status(&self, key: &CacheKey, status: EntryStatus, error: Option<String>) {
    self.write(Write::SetStatus {
      key: key.clone(),
      status,
      error,
    });
  }

  /// Restore an entry to an exact prior snapshot (`None` removes it).
  /// Used by optimistic rollback.
  pub fn restore(&self, key: &CacheKey, entry: Option<CacheEntry>) {
    self.write(Write::Restore {
      key: key.clone(),
      entry,
    });
  }

  /// Drop the entry entirely, notifying subscribers with an idle entry.
  pub fn evict(&self, key: &CacheKey) {
    self.write(Write::Evict { key: key.clone() });
  }

  /// Downgrade a fresh entry to stale so the next use refetches it.
  pub fn mark_stale(&self, key: &CacheKey) {
    self.write(Write::MarkStale { key: key.clone() });
  }

  /// Register a listener for one key. The listener runs synchronously on the
  /// writer's stack, after the write is applied, with a snapshot of the
  /// entry. The returned guard unsubscribes on `unsubscribe()` or on drop.
  pub fn subscribe<F>(&self, key: &CacheKey, listener: F) -> SubscriberGuard
  where
    F: Fn(&CacheKey, &CacheEntry) + Send + Sync + 'static,
  {
    let mut inner = self.lock();
    let id = inner.next_subscriber_id;
    inner.next_subscriber_id += 1;
    inner
      .subscribers
      .entry(key.clone())
      .or_default()
      .push(Subscriber {
        id,
        listener: Arc::new(listener),
      });
    SubscriberGuard {
      inner: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
      released: false,
    }
  }

  /// Number of subscribers currently registered for `key`.
  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self
      .lock()
      .subscribers
      .get(key)
      .map(|subs| subs.len())
      .unwrap_or(0)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Apply a write, or queue it if a notification pass is already running on
  /// this store. The thread that started the pass drains the queue, so
  /// cascading writes from listeners cannot recurse.
  fn write(&self, write: Write) {
    let mut inner = self.lock();
    if inner.notifying {
      inner.queue.push_back(write);
      return;
    }
    inner.notifying = true;

    let mut next = Some(write);
    while let Some(write) = next.take() {
      let notification = apply(&mut inner, write);
      drop(inner);
      if let Some((key, entry, listeners)) = notification {
        for listener in &listeners {
          listener(&key, &entry);
        }
      }
      inner = self.lock();
      next = inner.queue.pop_front();
    }
    inner.notifying = false;
  }
}

/// Live-key view used by the invalidation graph.
pub trait KeyIndex {
  fn live_keys(&self) -> Vec<CacheKey>;

  /// Whether the collection under `key` currently contains an item with the
  /// given id. False for detail entries and missing keys.
  fn collection_contains(&self, key: &CacheKey, id: &str) -> bool;
}

impl KeyIndex for CacheStore {
  fn live_keys(&self) -> Vec<CacheKey> {
    self.keys()
  }

  fn collection_contains(&self, key: &CacheKey, id: &str) -> bool {
    self
      .get(key)
      .and_then(|entry| entry.page().map(|page| page.contains(id)))
      .unwrap_or(false)
  }
}

/// Mutate the table and collect the notification to deliver, if any.
fn apply(
  inner: &mut StoreInner,
  write: Write,
) -> Option<(CacheKey, CacheEntry, Vec<Listener>)> {
  let key = match &write {
    Write::Set { key, .. }
    | Write::Patch { key, .. }
    | Write::SetStatus { key, .. }
    | Write::Restore { key, .. }
    | Write::Evict { key }
    | Write::MarkStale { key } => key.clone(),
  };

  let entry = match write {
    Write::Set { data, status, .. } => {
      let entry = inner.entries.entry(key.clone()).or_insert_with(CacheEntry::idle);
      entry.data = data;
      entry.status = status;
      if status == EntryStatus::Fresh {
        entry.last_fetched_at = Some(Utc::now());
        entry.last_error = None;
      }
      entry.clone()
    }
    Write::Patch { f, .. } => {
      let Some(entry) = inner.entries.get_mut(&key) else {
        debug!(key = %key, "patch on missing entry dropped");
        return None;
      };
      let Some(data) = entry.data.take() else {
        debug!(key = %key, "patch on empty entry dropped");
        return None;
      };
      entry.data = Some(f(data));
      entry.clone()
    }
    Write::SetStatus { status, error, .. } => {
      let entry = inner.entries.entry(key.clone()).or_insert_with(CacheEntry::idle);
      entry.status = status;
      if status == EntryStatus::Fresh {
        entry.last_fetched_at = Some(Utc::now());
        entry.last_error = None;
      }
      if let Some(error) = error {
        entry.last_error = Some(error);
      }
      entry.clone()
    }
    Write::Restore { entry, .. } => match entry {
      Some(snapshot) => {
        inner.entries.insert(key.clone(), snapshot.clone());
        snapshot
      }
      None => {
        inner.entries.remove(&key);
        CacheEntry::idle()
      }
    },
    Write::Evict { .. } => {
      inner.entries.remove(&key);
      CacheEntry::idle()
    }
    Write::MarkStale { .. } => {
      let Some(entry) = inner.entries.get_mut(&key) else {
        return None;
      };
      if entry.status != EntryStatus::Fresh {
        return None;
      }
      entry.status = EntryStatus::Stale;
      entry.clone()
    }
  };

  let listeners = inner
    .subscribers
    .get(&key)
    .map(|subs| subs.iter().map(|s| Arc::clone(&s.listener)).collect())
    .unwrap_or_default();

  Some((key, entry, listeners))
}

/// Subscription handle; releases the listener on `unsubscribe()` or drop.
pub struct SubscriberGuard {
  inner: Weak<Mutex<StoreInner>>,
  key: CacheKey,
  id: u64,
  released: bool,
}

impl SubscriberGuard {
  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if self.released {
      return;
    }
    self.released = true;
    if let Some(inner) = self.inner.upgrade() {
      let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
      if let Some(subs) = inner.subscribers.get_mut(&self.key) {
        subs.retain(|s| s.id != self.id);
        if subs.is_empty() {
          inner.subscribers.remove(&self.key);
        }
      }
    }
  }
}

impl Drop for SubscriberGuard {
  fn drop(&mut self) {
    self.release();
  }
}
