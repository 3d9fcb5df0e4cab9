//! Wire-shaped records and their normalization into engine types.
//!
//! The backend is loosely typed: optional fields, stringly timestamps,
//! counters that may be absent or derived. Nothing in wire shape ever enters
//! the store. Everything passes through `normalize_item` first, which
//! validates, narrows, and computes the viewer-relative flags (`is_mine`,
//! `is_liked`, `read`) from the identity context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::model::{Conversation, Identity, Item, Message, Post};

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApiItem {
  Post(ApiPost),
  Message(ApiMessage),
  Conversation(ApiConversation),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPost {
  pub id: String,
  pub author_id: String,
  #[serde(default)]
  pub body: Option<String>,
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
  #[serde(default)]
  pub like_count: Option<i64>,
  #[serde(default)]
  pub comment_count: Option<i64>,
  /// User ids that liked this post, as far as the backend sends them.
  /// `like_count` is authoritative when present.
  #[serde(default)]
  pub liked_user_ids: Vec<String>,
  #[serde(default)]
  pub saved_user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
  pub id: String,
  pub conversation_id: String,
  pub sender_id: String,
  #[serde(default)]
  pub body: Option<String>,
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
  #[serde(default)]
  pub read_user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConversation {
  pub id: String,
  #[serde(default)]
  pub title: Option<String>,
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
  #[serde(default)]
  pub last_message: Option<String>,
  #[serde(default)]
  pub unread_count: Option<i64>,
}

// ============================================================================
// Normalization
// ============================================================================

/// Validate and narrow one wire record into an engine record.
pub fn normalize_item(raw: ApiItem, identity: &Identity) -> Result<Item, SyncError> {
  match raw {
    ApiItem::Post(post) => normalize_post(post, identity).map(Item::Post),
    ApiItem::Message(message) => normalize_message(message, identity).map(Item::Message),
    ApiItem::Conversation(conversation) => {
      normalize_conversation(conversation).map(Item::Conversation)
    }
  }
}

/// Normalize a batch, skipping malformed records. A single bad record must
/// not poison an otherwise usable page.
pub fn normalize_items(raw: Vec<ApiItem>, identity: &Identity) -> Vec<Item> {
  raw
    .into_iter()
    .filter_map(|item| match normalize_item(item, identity) {
      Ok(item) => Some(item),
      Err(err) => {
        warn!(error = %err, "skipping malformed item");
        None
      }
    })
    .collect()
}

fn normalize_post(raw: ApiPost, identity: &Identity) -> Result<Post, SyncError> {
  let id = require_id(&raw.id, "post")?;
  let created_at = parse_timestamp(raw.created_at.as_deref(), &id)?;
  let updated_at = optional_timestamp(raw.updated_at.as_deref()).unwrap_or(created_at);
  let like_count = normalize_count(raw.like_count, raw.liked_user_ids.len(), &id)?;
  let comment_count = normalize_count(raw.comment_count, 0, &id)?;
  let me = &identity.current_user_id;

  Ok(Post {
    is_liked: raw.liked_user_ids.iter().any(|u| u == me),
    is_saved: raw.saved_user_ids.iter().any(|u| u == me),
    is_mine: &raw.author_id == me,
    id,
    author_id: raw.author_id,
    body: raw.body.unwrap_or_default(),
    created_at,
    updated_at,
    like_count,
    comment_count,
  })
}

fn normalize_message(raw: ApiMessage, identity: &Identity) -> Result<Message, SyncError> {
  let id = require_id(&raw.id, "message")?;
  if raw.conversation_id.is_empty() {
    return Err(SyncError::Normalization(format!(
      "message {} has no conversation",
      id
    )));
  }
  let created_at = parse_timestamp(raw.created_at.as_deref(), &id)?;
  let updated_at = optional_timestamp(raw.updated_at.as_deref()).unwrap_or(created_at);
  let me = &identity.current_user_id;
  let is_mine = &raw.sender_id == me;

  Ok(Message {
    // Own messages are read by definition.
    read: is_mine || raw.read_user_ids.iter().any(|u| u == me),
    is_mine,
    id,
    conversation_id: raw.conversation_id,
    sender_id: raw.sender_id,
    body: raw.body.unwrap_or_default(),
    created_at,
    updated_at,
  })
}

fn normalize_conversation(raw: ApiConversation) -> Result<Conversation, SyncError> {
  let id = require_id(&raw.id, "conversation")?;
  let created_at = parse_timestamp(raw.created_at.as_deref(), &id)?;
  let updated_at = optional_timestamp(raw.updated_at.as_deref()).unwrap_or(created_at);
  let unread_count = normalize_count(raw.unread_count, 0, &id)?;

  Ok(Conversation {
    id,
    title: raw.title.unwrap_or_default(),
    created_at,
    updated_at,
    last_message: raw.last_message,
    unread_count,
  })
}

fn require_id(id: &str, kind: &str) -> Result<String, SyncError> {
  if id.is_empty() {
    return Err(SyncError::Normalization(format!("{} with empty id", kind)));
  }
  Ok(id.to_string())
}

fn parse_timestamp(raw: Option<&str>, id: &str) -> Result<DateTime<Utc>, SyncError> {
  let raw = raw.ok_or_else(|| {
    SyncError::Normalization(format!("{} missing created_at", id))
  })?;
  DateTime::parse_from_rfc3339(raw)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| SyncError::Normalization(format!("{}: bad timestamp '{}': {}", id, raw, e)))
}

fn optional_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
  raw
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map(|dt| dt.with_timezone(&Utc))
}

fn normalize_count(raw: Option<i64>, fallback: usize, id: &str) -> Result<u64, SyncError> {
  match raw {
    None => Ok(fallback as u64),
    Some(n) if n < 0 => Err(SyncError::Normalization(format!(
      "{}: negative counter {}",
      id, n
    ))),
    Some(n) => Ok(n as u64),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn me() -> Identity {
    Identity::new("user-1")
  }

  fn raw_post(id: &str) -> ApiPost {
    ApiPost {
      id: id.into(),
      author_id: "user-2".into(),
      body: Some("hello".into()),
      created_at: Some("2026-03-01T10:00:00Z".into()),
      updated_at: None,
      like_count: Some(4),
      comment_count: None,
      liked_user_ids: vec!["user-1".into(), "user-3".into()],
      saved_user_ids: vec![],
    }
  }

  #[test]
  fn test_post_flags_computed_from_identity() {
    let item = normalize_item(ApiItem::Post(raw_post("p1")), &me()).unwrap();
    let post = item.as_post().unwrap();
    assert!(post.is_liked);
    assert!(!post.is_saved);
    assert!(!post.is_mine);
    assert_eq!(post.like_count, 4);
    assert_eq!(post.updated_at, post.created_at);
  }

  #[test]
  fn test_like_count_falls_back_to_id_list() {
    let mut raw = raw_post("p1");
    raw.like_count = None;
    let item = normalize_item(ApiItem::Post(raw), &me()).unwrap();
    assert_eq!(item.as_post().unwrap().like_count, 2);
  }

  #[test]
  fn test_missing_created_at_rejected() {
    let mut raw = raw_post("p1");
    raw.created_at = None;
    let err = normalize_item(ApiItem::Post(raw), &me()).unwrap_err();
    assert!(matches!(err, SyncError::Normalization(_)));
  }

  #[test]
  fn test_negative_counter_rejected() {
    let mut raw = raw_post("p1");
    raw.like_count = Some(-2);
    let err = normalize_item(ApiItem::Post(raw), &me()).unwrap_err();
    assert!(matches!(err, SyncError::Normalization(_)));
  }

  #[test]
  fn test_own_message_reads_as_read() {
    let raw = ApiMessage {
      id: "m1".into(),
      conversation_id: "c1".into(),
      sender_id: "user-1".into(),
      body: None,
      created_at: Some("2026-03-01T10:00:00Z".into()),
      updated_at: None,
      read_user_ids: vec![],
    };
    let item = normalize_item(ApiItem::Message(raw), &me()).unwrap();
    let message = item.as_message().unwrap();
    assert!(message.is_mine);
    assert!(message.read);
  }

  #[test]
  fn test_batch_skips_malformed_records() {
    let mut bad = raw_post("p2");
    bad.created_at = Some("not-a-timestamp".into());
    let items = normalize_items(
      vec![ApiItem::Post(raw_post("p1")), ApiItem::Post(bad)],
      &me(),
    );
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id(), "p1");
  }
}
