//! Shared fixtures and scripted collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use crate::error::SyncError;
use crate::keys::CacheKey;
use crate::model::{Conversation, EntityKind, EntityRef, Item, Message, Post};
use crate::page::{Cursor, Page, PageOrdering};
use crate::realtime::{EventKind, RealtimeEvent, RealtimeTransport, TransportHandle};
use crate::remote::{
  ApiConversation, ApiError, ApiItem, ApiMessage, ApiPost, MutationRequest, MutationResponse,
  PageRequest, PageResponse, RemoteApi,
};
use crate::store::CacheData;

/// Fixed base instant so test timestamps are stable and comparable.
pub fn ts(secs: i64) -> DateTime<Utc> {
  DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

// ============================================================================
// Domain fixtures
// ============================================================================

pub fn post_record(id: &str, secs: i64) -> Post {
  Post {
    id: id.to_string(),
    author_id: "user-2".to_string(),
    body: format!("post {}", id),
    created_at: ts(secs),
    updated_at: ts(secs),
    like_count: 0,
    comment_count: 0,
    is_liked: false,
    is_saved: false,
    is_mine: false,
  }
}

pub fn post(id: &str, secs: i64) -> Item {
  Item::Post(post_record(id, secs))
}

pub fn message_record(id: &str, conversation_id: &str, secs: i64) -> Message {
  Message {
    id: id.to_string(),
    conversation_id: conversation_id.to_string(),
    sender_id: "user-2".to_string(),
    body: format!("message {}", id),
    created_at: ts(secs),
    updated_at: ts(secs),
    read: false,
    is_mine: false,
  }
}

pub fn message(id: &str, conversation_id: &str, secs: i64) -> Item {
  Item::Message(message_record(id, conversation_id, secs))
}

pub fn conversation_record(id: &str, secs: i64) -> Conversation {
  Conversation {
    id: id.to_string(),
    title: format!("conversation {}", id),
    created_at: ts(secs),
    updated_at: ts(secs),
    last_message: None,
    unread_count: 0,
  }
}

pub fn conversation(id: &str, secs: i64) -> Item {
  Item::Conversation(conversation_record(id, secs))
}

/// Newest-first page wrapped as cache data.
pub fn page_data(items: Vec<Item>, cursor: Option<&str>) -> CacheData {
  CacheData::Page(Page::from_fetch(
    items,
    cursor.map(Cursor::new),
    PageOrdering::NewestFirst,
  ))
}

/// Chronological page wrapped as cache data.
pub fn message_page(items: Vec<Item>, cursor: Option<&str>) -> CacheData {
  CacheData::Page(Page::from_fetch(
    items,
    cursor.map(Cursor::new),
    PageOrdering::Chronological,
  ))
}

// ============================================================================
// Wire fixtures
// ============================================================================

pub fn api_post(id: &str, secs: i64) -> ApiItem {
  ApiItem::Post(ApiPost {
    id: id.to_string(),
    author_id: "user-2".to_string(),
    body: Some(format!("post {}", id)),
    created_at: Some(ts(secs).to_rfc3339()),
    updated_at: None,
    like_count: Some(0),
    comment_count: Some(0),
    liked_user_ids: vec![],
    saved_user_ids: vec![],
  })
}

pub fn api_message(id: &str, conversation_id: &str, secs: i64) -> ApiItem {
  ApiItem::Message(ApiMessage {
    id: id.to_string(),
    conversation_id: conversation_id.to_string(),
    sender_id: "user-2".to_string(),
    body: Some(format!("message {}", id)),
    created_at: Some(ts(secs).to_rfc3339()),
    updated_at: None,
    read_user_ids: vec![],
  })
}

pub fn api_conversation(id: &str, secs: i64) -> ApiItem {
  ApiItem::Conversation(ApiConversation {
    id: id.to_string(),
    title: Some(format!("conversation {}", id)),
    created_at: Some(ts(secs).to_rfc3339()),
    updated_at: None,
    last_message: None,
    unread_count: Some(0),
  })
}

pub fn page_response(items: Vec<ApiItem>, next_cursor: Option<&str>) -> PageResponse {
  PageResponse {
    items,
    next_cursor: next_cursor.map(String::from),
  }
}

pub fn mutation_response(item: Option<ApiItem>) -> MutationResponse {
  MutationResponse { item }
}

// ============================================================================
// Realtime fixtures
// ============================================================================

pub fn entity_of(api: &ApiItem) -> EntityRef {
  match api {
    ApiItem::Post(p) => EntityRef::new(EntityKind::Post, p.id.clone()),
    ApiItem::Message(m) => {
      EntityRef::child(EntityKind::Message, m.id.clone(), m.conversation_id.clone())
    }
    ApiItem::Conversation(c) => EntityRef::new(EntityKind::Conversation, c.id.clone()),
  }
}

pub fn insert_event(payload: ApiItem, secs: i64) -> RealtimeEvent {
  event(EventKind::Insert, payload, secs)
}

pub fn update_event(payload: ApiItem, secs: i64) -> RealtimeEvent {
  event(EventKind::Update, payload, secs)
}

pub fn delete_event(entity: EntityRef, secs: i64) -> RealtimeEvent {
  RealtimeEvent {
    channel: "test".to_string(),
    kind: EventKind::Delete,
    entity,
    payload: Value::Null,
    server_timestamp: ts(secs),
  }
}

fn event(kind: EventKind, payload: ApiItem, secs: i64) -> RealtimeEvent {
  RealtimeEvent {
    channel: "test".to_string(),
    kind,
    entity: entity_of(&payload),
    payload: serde_json::to_value(&payload).unwrap(),
    server_timestamp: ts(secs),
  }
}

// ============================================================================
// Scripted remote API
// ============================================================================

#[derive(Default)]
pub struct MockRemote {
  pages: Mutex<HashMap<CacheKey, VecDeque<Result<PageResponse, ApiError>>>>,
  mutations: Mutex<VecDeque<Result<MutationResponse, ApiError>>>,
  page_requests: Mutex<Vec<PageRequest>>,
  mutation_requests: Mutex<Vec<MutationRequest>>,
  fetch_gate: Mutex<Option<Arc<Semaphore>>>,
  mutation_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn queue_page(&self, key: &CacheKey, response: Result<PageResponse, ApiError>) {
    self
      .pages
      .lock()
      .unwrap()
      .entry(key.clone())
      .or_default()
      .push_back(response);
  }

  pub fn queue_mutation(&self, response: Result<MutationResponse, ApiError>) {
    self.mutations.lock().unwrap().push_back(response);
  }

  /// Park the next fetch until a permit is added to the returned semaphore.
  /// The scripted response is claimed before parking.
  pub fn gate_next_fetch(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.fetch_gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }

  /// Park the next mutation until a permit is added.
  pub fn gate_next_mutation(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.mutation_gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }

  pub fn fetch_count(&self) -> usize {
    self.page_requests.lock().unwrap().len()
  }

  pub fn page_requests(&self) -> Vec<PageRequest> {
    self.page_requests.lock().unwrap().clone()
  }

  pub fn mutation_requests(&self) -> Vec<MutationRequest> {
    self.mutation_requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl RemoteApi for MockRemote {
  async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError> {
    self.page_requests.lock().unwrap().push(request.clone());
    let response = self
      .pages
      .lock()
      .unwrap()
      .get_mut(&request.key)
      .and_then(|queue| queue.pop_front())
      .unwrap_or_else(|| Err(ApiError::network("no scripted page response")));
    let gate = self.fetch_gate.lock().unwrap().take();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }
    response
  }

  async fn mutate(&self, request: MutationRequest) -> Result<MutationResponse, ApiError> {
    self.mutation_requests.lock().unwrap().push(request);
    let response = self
      .mutations
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(ApiError::network("no scripted mutation response")));
    let gate = self.mutation_gate.lock().unwrap().take();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }
    response
  }
}

// ============================================================================
// Scripted realtime transport
// ============================================================================

#[derive(Default)]
pub struct MockTransport {
  inner: Mutex<TransportInner>,
}

#[derive(Default)]
struct TransportInner {
  next_handle: u64,
  sinks: HashMap<u64, (String, mpsc::UnboundedSender<RealtimeEvent>)>,
  unsubscribed: Vec<u64>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deliver an event to every subscriber of `channel`.
  pub fn emit(&self, channel: &str, event: RealtimeEvent) {
    let inner = self.inner.lock().unwrap();
    for (subscribed_channel, sink) in inner.sinks.values() {
      if subscribed_channel == channel {
        let _ = sink.send(event.clone());
      }
    }
  }

  pub fn active_subscriptions(&self) -> usize {
    self.inner.lock().unwrap().sinks.len()
  }

  pub fn unsubscribed_handles(&self) -> Vec<u64> {
    self.inner.lock().unwrap().unsubscribed.clone()
  }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
  async fn subscribe(
    &self,
    channel: &str,
    sink: mpsc::UnboundedSender<RealtimeEvent>,
  ) -> Result<TransportHandle, SyncError> {
    let mut inner = self.inner.lock().unwrap();
    inner.next_handle += 1;
    let handle = inner.next_handle;
    inner.sinks.insert(handle, (channel.to_string(), sink));
    Ok(TransportHandle(handle))
  }

  async fn unsubscribe(&self, handle: TransportHandle) -> Result<(), SyncError> {
    let mut inner = self.inner.lock().unwrap();
    inner.sinks.remove(&handle.0);
    inner.unsubscribed.push(handle.0);
    Ok(())
  }
}
