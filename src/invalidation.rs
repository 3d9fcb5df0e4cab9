//! Maps an entity change to the cache keys that must be refreshed or patched.
//!
//! Rules are declared once, centrally: entity kind × change kinds → a key
//! generator evaluated against the store's live key set. A new view that
//! includes an entity participates by registering a pattern here, not by
//! editing mutation call sites. An unregistered pattern means a view silently
//! goes stale, so the default table is covered pairwise by tests.

use crate::keys::CacheKey;
use crate::model::{EntityKind, EntityRef, FeedTab};
use crate::store::KeyIndex;

/// What changed about an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
  Created,
  Updated,
  Deleted,
  LikeChanged,
  SaveChanged,
  ReadChanged,
}

type KeyGen = Box<dyn Fn(&EntityRef, &dyn KeyIndex) -> Vec<CacheKey> + Send + Sync>;

struct Rule {
  entity: EntityKind,
  changes: &'static [ChangeKind],
  keys: KeyGen,
}

/// Declarative change → affected-keys table.
pub struct InvalidationGraph {
  rules: Vec<Rule>,
}

impl InvalidationGraph {
  /// Empty graph; only useful as a base for custom registrations.
  pub fn new() -> Self {
    Self { rules: Vec::new() }
  }

  /// The full rule table for the feed and chat surfaces.
  pub fn with_default_rules() -> Self {
    let mut graph = Self::new();

    // A new post lands in every loaded feed.
    graph.register(EntityKind::Post, &[ChangeKind::Created], |_, index| {
      live_feed_keys(index)
    });

    // Post changes reach its detail entry and every feed currently
    // holding it.
    graph.register(
      EntityKind::Post,
      &[
        ChangeKind::Updated,
        ChangeKind::Deleted,
        ChangeKind::LikeChanged,
        ChangeKind::SaveChanged,
      ],
      |entity, index| {
        let mut keys = feeds_containing(index, &entity.id);
        let detail = CacheKey::post_detail(entity.id.clone());
        if is_live(index, &detail) {
          keys.push(detail);
        }
        keys
      },
    );

    // A new message lands in its conversation's history and bumps the
    // conversation list (preview, unread count).
    graph.register(EntityKind::Message, &[ChangeKind::Created], |entity, index| {
      let mut keys = Vec::new();
      if let Some(conversation_id) = &entity.parent_id {
        let history = CacheKey::conversation_messages(conversation_id.clone());
        if is_live(index, &history) {
          keys.push(history);
        }
      }
      if is_live(index, &CacheKey::Conversations) {
        keys.push(CacheKey::Conversations);
      }
      keys
    });

    // Message edits, deletions, and read-state flips patch the history
    // that holds the message, and read state also shows on the list.
    graph.register(
      EntityKind::Message,
      &[ChangeKind::Updated, ChangeKind::Deleted, ChangeKind::ReadChanged],
      |entity, index| {
        let mut keys = Vec::new();
        if let Some(conversation_id) = &entity.parent_id {
          let history = CacheKey::conversation_messages(conversation_id.clone());
          if index.collection_contains(&history, &entity.id) {
            keys.push(history);
          }
        }
        if is_live(index, &CacheKey::Conversations) {
          keys.push(CacheKey::Conversations);
        }
        keys
      },
    );

    // Conversation-level changes show on the list. Read-state flips also
    // touch the loaded history (message read flags), and deleting a
    // conversation tears its history down.
    graph.register(
      EntityKind::Conversation,
      &[ChangeKind::Created, ChangeKind::Updated],
      |_, index| {
        if is_live(index, &CacheKey::Conversations) {
          vec![CacheKey::Conversations]
        } else {
          Vec::new()
        }
      },
    );
    graph.register(
      EntityKind::Conversation,
      &[ChangeKind::ReadChanged, ChangeKind::Deleted],
      |entity, index| {
        let mut keys = Vec::new();
        if is_live(index, &CacheKey::Conversations) {
          keys.push(CacheKey::Conversations);
        }
        let history = CacheKey::conversation_messages(entity.id.clone());
        if is_live(index, &history) {
          keys.push(history);
        }
        keys
      },
    );

    graph
  }

  /// Register a key pattern for an entity kind and a set of change kinds.
  pub fn register<F>(
    &mut self,
    entity: EntityKind,
    changes: &'static [ChangeKind],
    keys: F,
  ) where
    F: Fn(&EntityRef, &dyn KeyIndex) -> Vec<CacheKey> + Send + Sync + 'static,
  {
    self.rules.push(Rule {
      entity,
      changes,
      keys: Box::new(keys),
    });
  }

  /// Every cache key holding a view of `entity` affected by `change`,
  /// deduplicated, in registration order.
  pub fn affected_keys(
    &self,
    entity: &EntityRef,
    change: ChangeKind,
    index: &dyn KeyIndex,
  ) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = Vec::new();
    for rule in &self.rules {
      if rule.entity != entity.kind || !rule.changes.contains(&change) {
        continue;
      }
      for key in (rule.keys)(entity, index) {
        if !keys.contains(&key) {
          keys.push(key);
        }
      }
    }
    keys
  }
}

impl Default for InvalidationGraph {
  fn default() -> Self {
    Self::with_default_rules()
  }
}

fn is_live(index: &dyn KeyIndex, key: &CacheKey) -> bool {
  index.live_keys().contains(key)
}

fn live_feed_keys(index: &dyn KeyIndex) -> Vec<CacheKey> {
  [FeedTab::ForYou, FeedTab::Following]
    .into_iter()
    .map(CacheKey::feed)
    .filter(|key| is_live(index, key))
    .collect()
}

fn feeds_containing(index: &dyn KeyIndex, id: &str) -> Vec<CacheKey> {
  [FeedTab::ForYou, FeedTab::Following]
    .into_iter()
    .map(CacheKey::feed)
    .filter(|key| index.collection_contains(key, id))
    .collect()
}
