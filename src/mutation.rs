//! Apply-then-confirm-or-rollback lifecycle for local writes.
//!
//! A mutation patches every affected cache entry synchronously before the
//! remote call goes out, so the UI reflects the change with zero perceived
//! latency. On confirmation the optimistic guess is reconciled with the
//! authoritative record (temporary ids replaced, server-computed counters
//! re-applied). On failure every affected entry is restored to its exact
//! pre-mutation snapshot. Operations end `Confirmed` or `RolledBack`, both
//! terminal; the engine never retries on its own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::invalidation::{ChangeKind, InvalidationGraph};
use crate::keys::CacheKey;
use crate::model::{Conversation, EntityKind, EntityRef, Identity, Item, Message, Post};
use crate::realtime::{merge_event, RealtimeEvent};
use crate::remote::{normalize_item, MutationRequest, RemoteApi};
use crate::store::{CacheData, CacheEntry, CacheStore, EntryStatus};

/// Kinds of local writes the engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
  CreatePost,
  UpdatePost,
  DeletePost,
  ToggleLike,
  ToggleSave,
  CreateMessage,
  MarkConversationRead,
}

/// Cancellation token for a pending mutation. Cancelling triggers immediate
/// rollback; the remote call's eventual outcome is ignored.
#[derive(Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  pub fn cancel(&self) {
    let _ = self.tx.send(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  pub async fn cancelled(&self) {
    let mut rx = self.tx.subscribe();
    while !*rx.borrow_and_update() {
      if rx.changed().await.is_err() {
        return;
      }
    }
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

type OptimisticFn = Arc<dyn Fn(&CacheKey, CacheData) -> CacheData + Send + Sync>;

/// Everything needed to run one optimistic mutation.
pub struct MutationPlan {
  pub kind: MutationKind,
  /// Busy-lock target: at most one pending operation per target.
  /// `None` for creations (a temporary id cannot collide).
  pub target: Option<EntityRef>,
  /// Keys receiving the optimistic patch, from the invalidation graph.
  pub affected_keys: Vec<CacheKey>,
  /// Keys evicted optimistically (detail entries of deleted records).
  pub evicted_keys: Vec<CacheKey>,
  pub optimistic: OptimisticFn,
  pub request: MutationRequest,
  /// Locally-unique temporary id, for creations.
  pub temp_id: Option<String>,
  pub cancel: Option<CancelToken>,
}

impl std::fmt::Debug for MutationPlan {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MutationPlan")
      .field("kind", &self.kind)
      .field("target", &self.target)
      .field("affected_keys", &self.affected_keys)
      .field("evicted_keys", &self.evicted_keys)
      .field("optimistic", &"<fn>")
      .field("request", &self.request)
      .field("temp_id", &self.temp_id)
      .field("cancel", &self.cancel.is_some())
      .finish()
  }
}

impl MutationPlan {
  pub fn with_cancel(mut self, token: CancelToken) -> Self {
    self.cancel = Some(token);
    self
  }
}

/// Authoritative result of a confirmed mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
  pub item: Option<Item>,
}

// ============================================================================
// Pending-operation registry
// ============================================================================

/// Registry of in-flight optimistic operations, shared with the realtime
/// router. Push events for an entity with a pending operation are buffered
/// here and applied once the operation resolves, so a stale push can never
/// clobber a local intent mid-flight.
#[derive(Default)]
pub struct PendingOps {
  inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
  pending: HashSet<(EntityKind, String)>,
  buffered: HashMap<(EntityKind, String), VecDeque<RealtimeEvent>>,
}

impl PendingOps {
  /// Claim the target. False when an operation for it is already pending.
  pub(crate) fn begin(&self, target: &EntityRef) -> bool {
    let mut inner = self.lock();
    inner.pending.insert(owned_key(target))
  }

  /// Buffer `event` if its entity has a pending operation. Overflow past
  /// `cap` drops the oldest buffered event.
  pub fn buffer_if_pending(&self, event: RealtimeEvent, cap: usize) -> bool {
    let mut inner = self.lock();
    let key = owned_key(&event.entity);
    if !inner.pending.contains(&key) {
      return false;
    }
    let queue = inner.buffered.entry(key).or_default();
    if queue.len() >= cap {
      warn!(entity = %event.entity, cap, "realtime buffer full; dropping oldest event");
      queue.pop_front();
    }
    queue.push_back(event);
    true
  }

  /// Release the target and drain whatever was buffered behind it.
  fn resolve(&self, target: &EntityRef) -> Vec<RealtimeEvent> {
    let mut inner = self.lock();
    let key = owned_key(target);
    inner.pending.remove(&key);
    inner
      .buffered
      .remove(&key)
      .map(|queue| queue.into_iter().collect())
      .unwrap_or_default()
  }

  pub fn is_pending(&self, entity: &EntityRef) -> bool {
    self.lock().pending.contains(&owned_key(entity))
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
    self.inner.lock().unwrap_or_else(|p| p.into_inner())
  }
}

fn owned_key(entity: &EntityRef) -> (EntityKind, String) {
  let (kind, id) = entity.target_key();
  (kind, id.to_string())
}

// ============================================================================
// Executor
// ============================================================================

/// Runs optimistic mutations against the store and the remote API.
pub struct MutationExecutor {
  store: CacheStore,
  remote: Arc<dyn RemoteApi>,
  identity: Arc<Identity>,
  graph: Arc<InvalidationGraph>,
  pending: Arc<PendingOps>,
  temp_seq: AtomicU64,
}

impl MutationExecutor {
  pub fn new(
    store: CacheStore,
    remote: Arc<dyn RemoteApi>,
    identity: Arc<Identity>,
    graph: Arc<InvalidationGraph>,
    pending: Arc<PendingOps>,
  ) -> Self {
    Self {
      store,
      remote,
      identity,
      graph,
      pending,
      temp_seq: AtomicU64::new(1),
    }
  }

  /// Run one mutation through the full lifecycle. Returns the authoritative
  /// record on confirmation; on failure the cache is restored to its exact
  /// pre-mutation state and the error is surfaced to the caller.
  pub async fn run(&self, plan: MutationPlan) -> Result<MutationOutcome, SyncError> {
    if let Some(target) = &plan.target {
      if !self.pending.begin(target) {
        debug!(entity = %target, "duplicate operation rejected");
        return Err(SyncError::Busy(target.to_string()));
      }
    }

    // Inverse patch: exact snapshots of every entry we are about to touch.
    let snapshots: Vec<(CacheKey, Option<CacheEntry>)> = plan
      .affected_keys
      .iter()
      .chain(plan.evicted_keys.iter())
      .map(|key| (key.clone(), self.store.get(key)))
      .collect();

    for key in &plan.affected_keys {
      let optimistic = Arc::clone(&plan.optimistic);
      let key_for_patch = key.clone();
      self
        .store
        .patch(key, move |data| optimistic(&key_for_patch, data));
    }
    for key in &plan.evicted_keys {
      self.store.evict(key);
    }

    let result = match &plan.cancel {
      Some(token) => {
        tokio::select! {
          biased;
          _ = token.cancelled() => None,
          result = self.remote.mutate(plan.request.clone()) => Some(result),
        }
      }
      None => Some(self.remote.mutate(plan.request.clone()).await),
    };

    let outcome = match result {
      None => {
        debug!(kind = ?plan.kind, "mutation cancelled; rolling back");
        self.rollback(&snapshots);
        Err(SyncError::Cancelled)
      }
      Some(Err(api)) => {
        warn!(kind = ?plan.kind, error = %api.message, "mutation failed; rolling back");
        self.rollback(&snapshots);
        Err(api.into())
      }
      Some(Ok(response)) => {
        let item = response
          .item
          .and_then(|raw| match normalize_item(raw, &self.identity) {
            Ok(item) => Some(item),
            Err(err) => {
              // The server confirmed; the optimistic state stands even if
              // the returned record is unreadable.
              warn!(kind = ?plan.kind, error = %err, "unreadable mutation response");
              None
            }
          });
        self.reconcile(&plan, item.as_ref());
        Ok(MutationOutcome { item })
      }
    };

    if let Some(target) = &plan.target {
      self.flush_buffered(target);
    }
    outcome
  }

  /// Next temporary id for a creation.
  pub fn next_temp_id(&self) -> String {
    format!("temp-{}", self.temp_seq.fetch_add(1, Ordering::Relaxed))
  }

  fn rollback(&self, snapshots: &[(CacheKey, Option<CacheEntry>)]) {
    for (key, snapshot) in snapshots {
      self.store.restore(key, snapshot.clone());
    }
  }

  /// Replace the optimistic guess with the authoritative record.
  fn reconcile(&self, plan: &MutationPlan, item: Option<&Item>) {
    let Some(item) = item else {
      // Deletes (and unreadable responses) have nothing to re-apply.
      return;
    };

    match &plan.temp_id {
      Some(temp_id) => {
        // A creation: swap the temporary record for the authoritative one,
        // keeping its position.
        let temp_id = temp_id.clone();
        for key in &plan.affected_keys {
          let temp_id = temp_id.clone();
          let item = item.clone();
          self.store.patch_page(key, move |page| {
            page.replace_item(&temp_id, item);
          });
        }
        // A confirmed post gains a detail entry under its real id.
        if let Item::Post(post) = item {
          self.store.set(
            &CacheKey::post_detail(post.id.clone()),
            Some(CacheData::Item(item.clone())),
            EntryStatus::Fresh,
          );
        }
      }
      None => {
        // An update or toggle: the server may have computed counters the
        // optimistic guess could not know.
        let id = item.id().to_string();
        for key in &plan.affected_keys {
          let id = id.clone();
          let item = item.clone();
          self.store.patch(key, move |data| match data {
            CacheData::Page(mut page) => {
              page.replace_item(&id, item);
              CacheData::Page(page)
            }
            CacheData::Item(cached) if cached.id() == id => CacheData::Item(item),
            other => other,
          });
        }
      }
    }
  }

  /// Apply push events that arrived while the operation was pending. They
  /// are applied after rollback too: the push is authoritative server
  /// state, the failed local intent is not.
  fn flush_buffered(&self, target: &EntityRef) {
    for event in self.pending.resolve(target) {
      debug!(entity = %event.entity, "applying buffered realtime event");
      merge_event(&self.store, &self.graph, &self.identity, event);
    }
  }

  // ==========================================================================
  // Plan builders
  // ==========================================================================

  /// Toggle the viewer's like on a post.
  pub fn plan_toggle_like(&self, post_id: &str) -> Result<MutationPlan, SyncError> {
    let current = self
      .find_post(post_id)
      .ok_or_else(|| SyncError::NotFound(format!("post {}", post_id)))?;
    let liked = !current.is_liked;
    let entity = EntityRef::new(EntityKind::Post, post_id.to_string());
    let affected_keys = self
      .graph
      .affected_keys(&entity, ChangeKind::LikeChanged, &self.store);
    let id = post_id.to_string();

    Ok(MutationPlan {
      kind: MutationKind::ToggleLike,
      target: Some(entity),
      affected_keys,
      evicted_keys: Vec::new(),
      optimistic: patch_post(id, move |post| {
        post.is_liked = liked;
        if liked {
          post.like_count += 1;
        } else {
          post.like_count = post.like_count.saturating_sub(1);
        }
      }),
      request: MutationRequest {
        resource: "likes",
        id: Some(post_id.to_string()),
        fields: json!({ "liked": liked }),
      },
      temp_id: None,
      cancel: None,
    })
  }

  /// Toggle the viewer's save on a post.
  pub fn plan_toggle_save(&self, post_id: &str) -> Result<MutationPlan, SyncError> {
    let current = self
      .find_post(post_id)
      .ok_or_else(|| SyncError::NotFound(format!("post {}", post_id)))?;
    let saved = !current.is_saved;
    let entity = EntityRef::new(EntityKind::Post, post_id.to_string());
    let affected_keys = self
      .graph
      .affected_keys(&entity, ChangeKind::SaveChanged, &self.store);
    let id = post_id.to_string();

    Ok(MutationPlan {
      kind: MutationKind::ToggleSave,
      target: Some(entity),
      affected_keys,
      evicted_keys: Vec::new(),
      optimistic: patch_post(id, move |post| {
        post.is_saved = saved;
      }),
      request: MutationRequest {
        resource: "saves",
        id: Some(post_id.to_string()),
        fields: json!({ "saved": saved }),
      },
      temp_id: None,
      cancel: None,
    })
  }

  /// Create a post, inserted optimistically at the order-correct position
  /// of every loaded feed under a temporary id.
  pub fn plan_create_post(&self, body: &str) -> MutationPlan {
    let temp_id = self.next_temp_id();
    let now = Utc::now();
    let draft = Item::Post(Post {
      id: temp_id.clone(),
      author_id: self.identity.current_user_id.clone(),
      body: body.to_string(),
      created_at: now,
      updated_at: now,
      like_count: 0,
      comment_count: 0,
      is_liked: false,
      is_saved: false,
      is_mine: true,
    });
    let entity = EntityRef::new(EntityKind::Post, temp_id.clone());
    let affected_keys = self
      .graph
      .affected_keys(&entity, ChangeKind::Created, &self.store);

    MutationPlan {
      kind: MutationKind::CreatePost,
      target: None,
      affected_keys,
      evicted_keys: Vec::new(),
      optimistic: Arc::new(move |_key, data| insert_into_page(data, draft.clone())),
      request: MutationRequest {
        resource: "posts",
        id: None,
        fields: json!({ "body": body }),
      },
      temp_id: Some(temp_id),
      cancel: None,
    }
  }

  /// Edit a post's body.
  pub fn plan_update_post(&self, post_id: &str, body: &str) -> Result<MutationPlan, SyncError> {
    self
      .find_post(post_id)
      .ok_or_else(|| SyncError::NotFound(format!("post {}", post_id)))?;
    let entity = EntityRef::new(EntityKind::Post, post_id.to_string());
    let affected_keys = self
      .graph
      .affected_keys(&entity, ChangeKind::Updated, &self.store);
    let id = post_id.to_string();
    let new_body = body.to_string();

    Ok(MutationPlan {
      kind: MutationKind::UpdatePost,
      target: Some(entity),
      affected_keys,
      evicted_keys: Vec::new(),
      optimistic: patch_post(id, move |post| {
        post.body = new_body.clone();
      }),
      request: MutationRequest {
        resource: "posts",
        id: Some(post_id.to_string()),
        fields: json!({ "body": body }),
      },
      temp_id: None,
      cancel: None,
    })
  }

  /// Delete a post: removed from every feed holding it, its detail entry
  /// evicted.
  pub fn plan_delete_post(&self, post_id: &str) -> Result<MutationPlan, SyncError> {
    self
      .find_post(post_id)
      .ok_or_else(|| SyncError::NotFound(format!("post {}", post_id)))?;
    let entity = EntityRef::new(EntityKind::Post, post_id.to_string());
    let mut affected_keys = self
      .graph
      .affected_keys(&entity, ChangeKind::Deleted, &self.store);
    let detail = CacheKey::post_detail(post_id.to_string());
    let evicted_keys = if affected_keys.contains(&detail) {
      affected_keys.retain(|key| *key != detail);
      vec![detail]
    } else {
      Vec::new()
    };
    let id = post_id.to_string();

    Ok(MutationPlan {
      kind: MutationKind::DeletePost,
      target: Some(entity),
      affected_keys,
      evicted_keys,
      optimistic: Arc::new(move |_key, data| remove_from_page(data, &id)),
      request: MutationRequest {
        resource: "posts",
        id: Some(post_id.to_string()),
        fields: json!({}),
      },
      temp_id: None,
      cancel: None,
    })
  }

  /// Send a message: appended to the conversation's history and reflected
  /// in the conversation list preview.
  pub fn plan_create_message(&self, conversation_id: &str, body: &str) -> MutationPlan {
    let temp_id = self.next_temp_id();
    let now = Utc::now();
    let draft = Message {
      id: temp_id.clone(),
      conversation_id: conversation_id.to_string(),
      sender_id: self.identity.current_user_id.clone(),
      body: body.to_string(),
      created_at: now,
      updated_at: now,
      read: true,
      is_mine: true,
    };
    let entity = EntityRef::child(
      EntityKind::Message,
      temp_id.clone(),
      conversation_id.to_string(),
    );
    let affected_keys = self
      .graph
      .affected_keys(&entity, ChangeKind::Created, &self.store);
    let conversation_id_owned = conversation_id.to_string();
    let preview = body.to_string();

    MutationPlan {
      kind: MutationKind::CreateMessage,
      target: None,
      affected_keys,
      evicted_keys: Vec::new(),
      optimistic: Arc::new(move |key, data| match key {
        CacheKey::Conversations => patch_conversation_in(data, &conversation_id_owned, |conv| {
          conv.last_message = Some(preview.clone());
          conv.updated_at = now;
        }),
        _ => insert_into_page(data, Item::Message(draft.clone())),
      }),
      request: MutationRequest {
        resource: "messages",
        id: None,
        fields: json!({ "conversation_id": conversation_id, "body": body }),
      },
      temp_id: Some(temp_id),
      cancel: None,
    }
  }

  /// Clear a conversation's unread state, locally marking its loaded
  /// messages read.
  pub fn plan_mark_conversation_read(
    &self,
    conversation_id: &str,
  ) -> Result<MutationPlan, SyncError> {
    let entity = EntityRef::new(EntityKind::Conversation, conversation_id.to_string());
    let affected_keys = self
      .graph
      .affected_keys(&entity, ChangeKind::ReadChanged, &self.store);
    if affected_keys.is_empty() {
      return Err(SyncError::NotFound(format!(
        "conversation {}",
        conversation_id
      )));
    }
    let conversation_id_owned = conversation_id.to_string();

    Ok(MutationPlan {
      kind: MutationKind::MarkConversationRead,
      target: Some(entity),
      affected_keys,
      evicted_keys: Vec::new(),
      optimistic: Arc::new(move |key, data| match key {
        CacheKey::Conversations => patch_conversation_in(data, &conversation_id_owned, |conv| {
          conv.unread_count = 0;
        }),
        _ => mark_messages_read(data),
      }),
      request: MutationRequest {
        resource: "conversations",
        id: Some(conversation_id.to_string()),
        fields: json!({ "read": true }),
      },
      temp_id: None,
      cancel: None,
    })
  }

  /// Current cached copy of a post, from its detail entry or any loaded
  /// collection.
  fn find_post(&self, post_id: &str) -> Option<Post> {
    if let Some(entry) = self.store.get(&CacheKey::post_detail(post_id.to_string())) {
      if let Some(Item::Post(post)) = entry.item() {
        return Some(post.clone());
      }
    }
    for key in self.store.keys() {
      if let Some(entry) = self.store.get(&key) {
        if let Some(page) = entry.page() {
          if let Some(Item::Post(post)) = page.get(post_id) {
            return Some(post.clone());
          }
        }
      }
    }
    None
  }
}

// ============================================================================
// Patch helpers
// ============================================================================

/// Optimistic patch that edits one post wherever the key holds it.
fn patch_post<F>(id: String, f: F) -> OptimisticFn
where
  F: Fn(&mut Post) + Send + Sync + 'static,
{
  Arc::new(move |_key, data| match data {
    CacheData::Page(mut page) => {
      page.patch_item(&id, |item| {
        if let Item::Post(post) = item {
          f(post);
        }
      });
      CacheData::Page(page)
    }
    CacheData::Item(mut item) => {
      if item.id() == id {
        if let Item::Post(post) = &mut item {
          f(post);
        }
      }
      CacheData::Item(item)
    }
  })
}

fn insert_into_page(data: CacheData, item: Item) -> CacheData {
  match data {
    CacheData::Page(mut page) => {
      page.insert_sorted(item);
      CacheData::Page(page)
    }
    other => other,
  }
}

fn remove_from_page(data: CacheData, id: &str) -> CacheData {
  match data {
    CacheData::Page(mut page) => {
      page.remove(id);
      CacheData::Page(page)
    }
    other => other,
  }
}

fn patch_conversation_in<F>(data: CacheData, conversation_id: &str, f: F) -> CacheData
where
  F: Fn(&mut Conversation),
{
  match data {
    CacheData::Page(mut page) => {
      page.patch_item(conversation_id, |item| {
        if let Item::Conversation(conv) = item {
          f(conv);
        }
      });
      CacheData::Page(page)
    }
    CacheData::Item(mut item) => {
      if item.id() == conversation_id {
        if let Item::Conversation(conv) = &mut item {
          f(conv);
        }
      }
      CacheData::Item(item)
    }
  }
}

fn mark_messages_read(data: CacheData) -> CacheData {
  match data {
    CacheData::Page(mut page) => {
      for item in &mut page.items {
        if let Item::Message(message) = item {
          message.read = true;
        }
      }
      CacheData::Page(page)
    }
    other => other,
  }
}
