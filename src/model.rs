//! Domain records synchronized by the engine.
//!
//! Identity (the `id` field) is immutable for every record; counters and
//! flags are the only fields mutated in place. The ordering key for every
//! record is `(created_at, id)` so ties on equal timestamps are broken
//! deterministically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Feed tabs backed by separate remote collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedTab {
  ForYou,
  Following,
}

impl FeedTab {
  pub fn as_str(&self) -> &'static str {
    match self {
      FeedTab::ForYou => "for-you",
      FeedTab::Following => "following",
    }
  }
}

/// A post in a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
  pub id: String,
  pub author_id: String,
  pub body: String,
  pub created_at: DateTime<Utc>,
  /// Last server-declared modification time; used to decide whether a push
  /// event is newer than the cached record.
  pub updated_at: DateTime<Utc>,
  pub like_count: u64,
  pub comment_count: u64,
  pub is_liked: bool,
  pub is_saved: bool,
  pub is_mine: bool,
}

/// A message inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: String,
  pub conversation_id: String,
  pub sender_id: String,
  pub body: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub read: bool,
  pub is_mine: bool,
}

/// A conversation summary for the chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
  pub id: String,
  pub title: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub last_message: Option<String>,
  pub unread_count: u64,
}

/// Any record that can live in a cached page or detail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Item {
  Post(Post),
  Message(Message),
  Conversation(Conversation),
}

impl Item {
  pub fn id(&self) -> &str {
    match self {
      Item::Post(p) => &p.id,
      Item::Message(m) => &m.id,
      Item::Conversation(c) => &c.id,
    }
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    match self {
      Item::Post(p) => p.created_at,
      Item::Message(m) => m.created_at,
      Item::Conversation(c) => c.created_at,
    }
  }

  pub fn updated_at(&self) -> DateTime<Utc> {
    match self {
      Item::Post(p) => p.updated_at,
      Item::Message(m) => m.updated_at,
      Item::Conversation(c) => c.updated_at,
    }
  }

  pub fn kind(&self) -> EntityKind {
    match self {
      Item::Post(_) => EntityKind::Post,
      Item::Message(_) => EntityKind::Message,
      Item::Conversation(_) => EntityKind::Conversation,
    }
  }

  /// Entity reference for this record. Messages carry their owning
  /// conversation so invalidation can reach the right message history.
  pub fn entity_ref(&self) -> EntityRef {
    match self {
      Item::Message(m) => EntityRef::child(
        EntityKind::Message,
        m.id.clone(),
        m.conversation_id.clone(),
      ),
      other => EntityRef::new(other.kind(), other.id().to_string()),
    }
  }

  pub fn as_post(&self) -> Option<&Post> {
    match self {
      Item::Post(p) => Some(p),
      _ => None,
    }
  }

  pub fn as_message(&self) -> Option<&Message> {
    match self {
      Item::Message(m) => Some(m),
      _ => None,
    }
  }

  pub fn as_conversation(&self) -> Option<&Conversation> {
    match self {
      Item::Conversation(c) => Some(c),
      _ => None,
    }
  }
}

/// Kinds of entities the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Post,
  Message,
  Conversation,
}

/// Reference to a single entity, with an optional parent scope
/// (a message's conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
  pub kind: EntityKind,
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_id: Option<String>,
}

impl EntityRef {
  pub fn new(kind: EntityKind, id: String) -> Self {
    Self {
      kind,
      id,
      parent_id: None,
    }
  }

  pub fn child(kind: EntityKind, id: String, parent_id: String) -> Self {
    Self {
      kind,
      id,
      parent_id: Some(parent_id),
    }
  }

  /// Pending-operation registry keys ignore the parent scope: a toggle on a
  /// message and a push for the same message must collide on id alone.
  pub fn target_key(&self) -> (EntityKind, &str) {
    (self.kind, &self.id)
  }
}

impl std::fmt::Display for EntityRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.kind {
      EntityKind::Post => write!(f, "post:{}", self.id),
      EntityKind::Message => write!(f, "message:{}", self.id),
      EntityKind::Conversation => write!(f, "conversation:{}", self.id),
    }
  }
}

/// Read-only identity context. The engine uses it to compute `is_mine` and
/// `is_liked` flags during normalization and never mutates it.
#[derive(Debug, Clone)]
pub struct Identity {
  pub current_user_id: String,
}

impl Identity {
  pub fn new(current_user_id: impl Into<String>) -> Self {
    Self {
      current_user_id: current_user_id.into(),
    }
  }
}
