//! Merging push events into cached state.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::invalidation::{ChangeKind, InvalidationGraph};
use crate::keys::CacheKey;
use crate::model::{EntityKind, Identity, Item};
use crate::remote::{normalize_item, ApiItem};
use crate::store::{CacheData, CacheStore};

use super::transport::{EventKind, RealtimeEvent};

/// Apply one push event to the store. Tolerates duplicate and out-of-order
/// delivery: an event whose entity already exists with a timestamp at least
/// as new is dropped, inserts land at the order-correct position, and
/// re-applying an event is a no-op.
pub(crate) fn merge_event(
  store: &CacheStore,
  graph: &InvalidationGraph,
  identity: &Identity,
  event: RealtimeEvent,
) {
  match event.kind {
    EventKind::Delete => merge_delete(store, graph, &event),
    EventKind::Insert | EventKind::Update => merge_upsert(store, graph, identity, event),
  }
}

fn merge_delete(store: &CacheStore, graph: &InvalidationGraph, event: &RealtimeEvent) {
  let keys = graph.affected_keys(&event.entity, ChangeKind::Deleted, store);
  if keys.is_empty() {
    debug!(entity = %event.entity, "delete event for uncached entity; no-op");
    return;
  }
  let id = event.entity.id.clone();
  for key in keys {
    match (&key, event.entity.kind) {
      // A deleted conversation tears down its loaded history wholesale.
      (CacheKey::ConversationMessages { .. }, EntityKind::Conversation) => {
        store.evict(&key);
      }
      // Deleting a message leaves the list preview alone; the server sends
      // a conversation update with the new preview separately.
      (CacheKey::Conversations, EntityKind::Message) => {}
      (CacheKey::PostDetail { .. }, _) => {
        store.evict(&key);
      }
      _ => {
        let id = id.clone();
        store.patch_page(&key, move |page| {
          page.remove(&id);
        });
      }
    }
  }
}

fn merge_upsert(
  store: &CacheStore,
  graph: &InvalidationGraph,
  identity: &Identity,
  event: RealtimeEvent,
) {
  let raw: ApiItem = match serde_json::from_value(event.payload.clone()) {
    Ok(raw) => raw,
    Err(err) => {
      warn!(entity = %event.entity, error = %err, "undecodable event payload");
      return;
    }
  };
  let mut item = match normalize_item(raw, identity) {
    Ok(item) => item,
    Err(err) => {
      warn!(entity = %event.entity, error = %err, "malformed event payload");
      return;
    }
  };
  stamp(&mut item, event.server_timestamp);

  // Drop the event if the cached copy is at least as new.
  if let Some(cached_at) = cached_timestamp(store, item.id()) {
    if event.server_timestamp <= cached_at {
      debug!(entity = %event.entity, "stale event dropped");
      return;
    }
  }

  let change = match event.kind {
    EventKind::Insert => ChangeKind::Created,
    _ => ChangeKind::Updated,
  };
  let keys = graph.affected_keys(&event.entity, change, store);

  for key in &keys {
    match (&item, key) {
      // A message event reaching the conversation list patches the owning
      // conversation's preview, not the page itself.
      (Item::Message(message), CacheKey::Conversations) => {
        let message = message.clone();
        let is_insert = event.kind == EventKind::Insert;
        let ts = event.server_timestamp;
        store.patch_page(key, move |page| {
          page.patch_item(&message.conversation_id, |cached| {
            if let Item::Conversation(conv) = cached {
              if is_insert {
                conv.last_message = Some(message.body.clone());
                conv.updated_at = ts;
                if !message.is_mine && !message.read {
                  conv.unread_count += 1;
                }
              }
            }
          });
        });
      }
      _ => {
        upsert(store, key, &item, event.kind);
      }
    }
  }

  // Read-state changes invalidate the counted unread total; recompute it
  // from the loaded history when we have one.
  if let Item::Message(message) = &item {
    if event.kind == EventKind::Update && keys.contains(&CacheKey::Conversations) {
      recount_unread(store, &message.conversation_id);
    }
  }
}

/// Insert-or-replace `item` under `key`.
fn upsert(store: &CacheStore, key: &CacheKey, item: &Item, kind: EventKind) {
  let item = item.clone();
  let is_insert = kind == EventKind::Insert;
  store.patch(key, move |data| match data {
    CacheData::Page(mut page) => {
      let id = item.id().to_string();
      if page.contains(&id) {
        page.replace_item(&id, item);
      } else if is_insert {
        page.insert_sorted(item);
      }
      CacheData::Page(page)
    }
    CacheData::Item(cached) if cached.id() == item.id() => CacheData::Item(item),
    other => other,
  });
}

fn recount_unread(store: &CacheStore, conversation_id: &str) {
  let history = CacheKey::conversation_messages(conversation_id.to_string());
  let Some(entry) = store.get(&history) else {
    return;
  };
  let Some(page) = entry.page() else {
    return;
  };
  let unread = page
    .items
    .iter()
    .filter_map(Item::as_message)
    .filter(|m| !m.read && !m.is_mine)
    .count() as u64;
  let conversation_id = conversation_id.to_string();
  store.patch_page(&CacheKey::Conversations, move |page| {
    page.patch_item(&conversation_id, |item| {
      if let Item::Conversation(conv) = item {
        conv.unread_count = unread;
      }
    });
  });
}

/// Last-known server timestamp for an entity anywhere in the store.
fn cached_timestamp(store: &CacheStore, id: &str) -> Option<DateTime<Utc>> {
  let mut newest: Option<DateTime<Utc>> = None;
  for key in store.keys() {
    let Some(entry) = store.get(&key) else {
      continue;
    };
    let cached = match entry.data.as_ref() {
      Some(CacheData::Page(page)) => page.get(id).map(Item::updated_at),
      Some(CacheData::Item(item)) if item.id() == id => Some(item.updated_at()),
      _ => None,
    };
    if let Some(at) = cached {
      newest = Some(newest.map_or(at, |n| n.max(at)));
    }
  }
  newest
}

/// Advance the record's timestamp to the event's, never backwards.
fn stamp(item: &mut Item, server_timestamp: DateTime<Utc>) {
  match item {
    Item::Post(post) => post.updated_at = post.updated_at.max(server_timestamp),
    Item::Message(message) => message.updated_at = message.updated_at.max(server_timestamp),
    Item::Conversation(conv) => conv.updated_at = conv.updated_at.max(server_timestamp),
  }
}
