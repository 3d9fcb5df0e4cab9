//! View-facing handles.
//!
//! A `QueryHandle` is one view's window onto a cache key: read the data,
//! watch it change, drive pagination. A `MutationHandle` runs optimistic
//! writes and reports the lifecycle of the last one. Handles are cheap to
//! create and hold no data themselves; everything lives in the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::keys::CacheKey;
use crate::model::Item;
use crate::mutation::{CancelToken, MutationExecutor, MutationOutcome, MutationPlan};
use crate::page::Page;
use crate::pagination::Paginator;
use crate::store::{CacheData, CacheEntry, CacheStore, EntryStatus, SubscriberGuard};

/// One view's access to one cached query.
#[derive(Clone)]
pub struct QueryHandle {
  key: CacheKey,
  store: CacheStore,
  paginator: Arc<Paginator>,
  config: SyncConfig,
  disposed: Arc<AtomicBool>,
}

impl QueryHandle {
  pub(crate) fn new(
    key: CacheKey,
    store: CacheStore,
    paginator: Arc<Paginator>,
    config: SyncConfig,
    disposed: Arc<AtomicBool>,
  ) -> Self {
    Self {
      key,
      store,
      paginator,
      config,
      disposed,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn entry(&self) -> Option<CacheEntry> {
    self.store.get(&self.key)
  }

  pub fn data(&self) -> Option<CacheData> {
    self.entry().and_then(|entry| entry.data)
  }

  pub fn page(&self) -> Option<Page> {
    self.data().and_then(CacheData::into_page)
  }

  pub fn item(&self) -> Option<Item> {
    self.entry().and_then(|entry| entry.item().cloned())
  }

  /// Staleness-aware status.
  pub fn status(&self) -> EntryStatus {
    self
      .entry()
      .map(|entry| entry.effective_status(self.config.stale_after()))
      .unwrap_or(EntryStatus::Idle)
  }

  pub fn error(&self) -> Option<String> {
    self.entry().and_then(|entry| entry.last_error)
  }

  /// Fetch if the entry is empty or stale; otherwise a no-op.
  pub async fn ensure(&self) -> Result<(), SyncError> {
    self.check_disposed()?;
    self.paginator.ensure(&self.key).await
  }

  /// Load the next page. No-op while a fetch is in flight or once the
  /// collection is exhausted.
  pub async fn load_next(&self) -> Result<(), SyncError> {
    self.check_disposed()?;
    self.paginator.load_next(&self.key).await
  }

  /// Re-fetch the head of the collection.
  pub async fn refresh(&self) -> Result<(), SyncError> {
    self.check_disposed()?;
    self.paginator.refresh(&self.key).await
  }

  /// Drop the in-flight fetch for this key, if any.
  pub fn cancel(&self) {
    self.paginator.cancel(&self.key);
  }

  /// Watch this entry. The listener fires synchronously on every change
  /// until the guard is dropped or unsubscribed.
  pub fn subscribe<F>(&self, listener: F) -> SubscriberGuard
  where
    F: Fn(&CacheEntry) + Send + Sync + 'static,
  {
    self
      .store
      .subscribe(&self.key, move |_key, entry| listener(entry))
  }

  fn check_disposed(&self) -> Result<(), SyncError> {
    if self.disposed.load(Ordering::SeqCst) {
      return Err(SyncError::Disposed);
    }
    Ok(())
  }
}

/// Lifecycle of the last mutation run through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Idle,
  Running,
  Confirmed,
  RolledBack,
}

/// Runs optimistic mutations on behalf of one view.
#[derive(Clone)]
pub struct MutationHandle {
  executor: Arc<MutationExecutor>,
  status: Arc<Mutex<MutationStatus>>,
  disposed: Arc<AtomicBool>,
}

impl MutationHandle {
  pub(crate) fn new(executor: Arc<MutationExecutor>, disposed: Arc<AtomicBool>) -> Self {
    Self {
      executor,
      status: Arc::new(Mutex::new(MutationStatus::Idle)),
      disposed,
    }
  }

  pub fn status(&self) -> MutationStatus {
    *self.status.lock().unwrap_or_else(|p| p.into_inner())
  }

  /// Run a prepared plan. `Busy` rejections leave the reported status
  /// untouched; they never start an operation.
  pub async fn run(&self, plan: MutationPlan) -> Result<MutationOutcome, SyncError> {
    if self.disposed.load(Ordering::SeqCst) {
      return Err(SyncError::Disposed);
    }
    let previous = self.status();
    self.set_status(MutationStatus::Running);
    let result = self.executor.run(plan).await;
    match &result {
      Ok(_) => self.set_status(MutationStatus::Confirmed),
      Err(SyncError::Busy(_)) => self.set_status(previous),
      Err(_) => self.set_status(MutationStatus::RolledBack),
    }
    result
  }

  pub async fn toggle_like(&self, post_id: &str) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_toggle_like(post_id)?;
    self.run(plan).await
  }

  pub async fn toggle_save(&self, post_id: &str) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_toggle_save(post_id)?;
    self.run(plan).await
  }

  pub async fn create_post(&self, body: &str) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_create_post(body);
    self.run(plan).await
  }

  pub async fn create_post_with_cancel(
    &self,
    body: &str,
    token: CancelToken,
  ) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_create_post(body).with_cancel(token);
    self.run(plan).await
  }

  pub async fn update_post(&self, post_id: &str, body: &str) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_update_post(post_id, body)?;
    self.run(plan).await
  }

  pub async fn delete_post(&self, post_id: &str) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_delete_post(post_id)?;
    self.run(plan).await
  }

  pub async fn create_message(
    &self,
    conversation_id: &str,
    body: &str,
  ) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_create_message(conversation_id, body);
    self.run(plan).await
  }

  pub async fn mark_conversation_read(
    &self,
    conversation_id: &str,
  ) -> Result<MutationOutcome, SyncError> {
    let plan = self.executor.plan_mark_conversation_read(conversation_id)?;
    self.run(plan).await
  }

  fn set_status(&self, status: MutationStatus) {
    *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
  }
}
