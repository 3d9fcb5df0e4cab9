//! Typed cache keys, one variant per distinct query family.

use serde::{Deserialize, Serialize};

use crate::model::FeedTab;
use crate::page::PageOrdering;

/// Identifier for one query's result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
  /// A feed tab, newest first.
  Feed { tab: FeedTab },
  /// Detail entry for a single post.
  PostDetail { post_id: String },
  /// The conversation list, newest first.
  Conversations,
  /// Message history for one conversation, chronological.
  ConversationMessages { conversation_id: String },
}

impl CacheKey {
  pub fn feed(tab: FeedTab) -> Self {
    CacheKey::Feed { tab }
  }

  pub fn post_detail(post_id: impl Into<String>) -> Self {
    CacheKey::PostDetail {
      post_id: post_id.into(),
    }
  }

  pub fn conversation_messages(conversation_id: impl Into<String>) -> Self {
    CacheKey::ConversationMessages {
      conversation_id: conversation_id.into(),
    }
  }

  /// Ordering policy for pages held under this key.
  pub fn ordering(&self) -> PageOrdering {
    match self {
      CacheKey::ConversationMessages { .. } => PageOrdering::Chronological,
      _ => PageOrdering::NewestFirst,
    }
  }

  /// Whether this key holds a paginated collection (as opposed to a single
  /// detail record).
  pub fn is_collection(&self) -> bool {
    !matches!(self, CacheKey::PostDetail { .. })
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheKey::Feed { tab } => write!(f, "feed:{}", tab.as_str()),
      CacheKey::PostDetail { post_id } => write!(f, "post:detail:{}", post_id),
      CacheKey::Conversations => write!(f, "conversations"),
      CacheKey::ConversationMessages { conversation_id } => {
        write!(f, "conversation:messages:{}", conversation_id)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display_forms() {
    assert_eq!(
      CacheKey::feed(FeedTab::ForYou).to_string(),
      "feed:for-you"
    );
    assert_eq!(
      CacheKey::post_detail("p1").to_string(),
      "post:detail:p1"
    );
    assert_eq!(CacheKey::Conversations.to_string(), "conversations");
    assert_eq!(
      CacheKey::conversation_messages("c9").to_string(),
      "conversation:messages:c9"
    );
  }

  #[test]
  fn test_ordering_policy() {
    assert_eq!(
      CacheKey::feed(FeedTab::Following).ordering(),
      PageOrdering::NewestFirst
    );
    assert_eq!(
      CacheKey::conversation_messages("c1").ordering(),
      PageOrdering::Chronological
    );
  }
}
