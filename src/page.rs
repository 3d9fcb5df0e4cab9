//! Ordered, duplicate-free page of items with cursor-based continuation.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;

use crate::model::Item;

/// Opaque pagination token returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
  pub fn new(token: impl Into<String>) -> Self {
    Cursor(token.into())
  }
}

/// Ordering policy for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageOrdering {
  /// `(created_at desc, id desc)`: feeds and the conversation list.
  NewestFirst,
  /// `(created_at asc, id asc)`: message histories.
  Chronological,
}

impl PageOrdering {
  /// Compare two items under this policy.
  pub fn cmp(&self, a: &Item, b: &Item) -> CmpOrdering {
    let forward = (a.created_at(), a.id()).cmp(&(b.created_at(), b.id()));
    match self {
      PageOrdering::Chronological => forward,
      PageOrdering::NewestFirst => forward.reverse(),
    }
  }
}

/// A loaded slice of an ordered remote collection.
///
/// Item ids are unique within the page. The cursor marks where the next
/// `load_next` continues; `has_more` is false once the collection is
/// exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
  pub items: Vec<Item>,
  pub cursor: Option<Cursor>,
  pub has_more: bool,
  pub ordering: PageOrdering,
}

impl Page {
  pub fn empty(ordering: PageOrdering) -> Self {
    Self {
      items: Vec::new(),
      cursor: None,
      has_more: true,
      ordering,
    }
  }

  pub fn from_fetch(
    items: Vec<Item>,
    cursor: Option<Cursor>,
    ordering: PageOrdering,
  ) -> Self {
    let has_more = cursor.is_some();
    let mut page = Self {
      items: Vec::new(),
      cursor,
      has_more,
      ordering,
    };
    for item in items {
      if !page.contains(item.id()) {
        page.items.push(item);
      }
    }
    page
  }

  pub fn contains(&self, id: &str) -> bool {
    self.items.iter().any(|i| i.id() == id)
  }

  pub fn position_of(&self, id: &str) -> Option<usize> {
    self.items.iter().position(|i| i.id() == id)
  }

  pub fn get(&self, id: &str) -> Option<&Item> {
    self.items.iter().find(|i| i.id() == id)
  }

  /// Append a fetched continuation, skipping ids already present (servers
  /// can overlap at page boundaries), and advance the cursor.
  pub fn append_fetch(&mut self, items: Vec<Item>, cursor: Option<Cursor>) {
    for item in items {
      if !self.contains(item.id()) {
        self.items.push(item);
      }
    }
    self.has_more = cursor.is_some();
    self.cursor = cursor;
  }

  /// Insert an item at the position consistent with the page ordering.
  /// No-op when the id is already present; returns whether it was inserted.
  pub fn insert_sorted(&mut self, item: Item) -> bool {
    if self.contains(item.id()) {
      return false;
    }
    let at = self
      .items
      .iter()
      .position(|existing| self.ordering.cmp(&item, existing) == CmpOrdering::Less)
      .unwrap_or(self.items.len());
    self.items.insert(at, item);
    true
  }

  /// Patch an item in place by id; returns whether it was found.
  pub fn patch_item<F>(&mut self, id: &str, f: F) -> bool
  where
    F: FnOnce(&mut Item),
  {
    match self.items.iter_mut().find(|i| i.id() == id) {
      Some(item) => {
        f(item);
        true
      }
      None => false,
    }
  }

  /// Replace the item with `old_id` wholesale, keeping its position.
  /// Used when a temporary id is reconciled with the authoritative record.
  /// If the replacement id already exists elsewhere in the page, the old
  /// item is removed instead so the id stays unique.
  pub fn replace_item(&mut self, old_id: &str, replacement: Item) -> bool {
    let Some(at) = self.position_of(old_id) else {
      return false;
    };
    if replacement.id() != old_id && self.contains(replacement.id()) {
      self.items.remove(at);
      return true;
    }
    self.items[at] = replacement;
    true
  }

  /// Remove an item by id; returns whether it was present.
  pub fn remove(&mut self, id: &str) -> bool {
    match self.position_of(id) {
      Some(at) => {
        self.items.remove(at);
        true
      }
      None => false,
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn ids(&self) -> Vec<&str> {
    self.items.iter().map(|i| i.id()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{message, post};

  #[test]
  fn test_newest_first_ordering() {
    let mut page = Page::empty(PageOrdering::NewestFirst);
    page.insert_sorted(post("p1", 100));
    page.insert_sorted(post("p3", 300));
    page.insert_sorted(post("p2", 200));
    assert_eq!(page.ids(), vec!["p3", "p2", "p1"]);
  }

  #[test]
  fn test_chronological_ordering() {
    let mut page = Page::empty(PageOrdering::Chronological);
    page.insert_sorted(message("m2", "c1", 200));
    page.insert_sorted(message("m1", "c1", 100));
    page.insert_sorted(message("m3", "c1", 300));
    assert_eq!(page.ids(), vec!["m1", "m2", "m3"]);
  }

  #[test]
  fn test_equal_timestamps_tie_break_on_id() {
    let mut page = Page::empty(PageOrdering::NewestFirst);
    page.insert_sorted(post("pa", 100));
    page.insert_sorted(post("pb", 100));
    // id desc under newest-first
    assert_eq!(page.ids(), vec!["pb", "pa"]);
  }

  #[test]
  fn test_insert_sorted_rejects_duplicate() {
    let mut page = Page::empty(PageOrdering::NewestFirst);
    assert!(page.insert_sorted(post("p1", 100)));
    assert!(!page.insert_sorted(post("p1", 100)));
    assert_eq!(page.len(), 1);
  }

  #[test]
  fn test_append_fetch_skips_boundary_overlap() {
    let mut page = Page::from_fetch(
      vec![post("p3", 300), post("p2", 200)],
      Some(Cursor::new("c1")),
      PageOrdering::NewestFirst,
    );
    // Server re-returns p2 at the boundary of the next page.
    page.append_fetch(vec![post("p2", 200), post("p1", 100)], None);
    assert_eq!(page.ids(), vec!["p3", "p2", "p1"]);
    assert!(!page.has_more);
    assert_eq!(page.cursor, None);
  }

  #[test]
  fn test_replace_item_keeps_position() {
    let mut page = Page::from_fetch(
      vec![post("p3", 300), post("temp-1", 250), post("p1", 100)],
      None,
      PageOrdering::NewestFirst,
    );
    assert!(page.replace_item("temp-1", post("p77", 250)));
    assert_eq!(page.ids(), vec!["p3", "p77", "p1"]);
  }

  #[test]
  fn test_replace_item_drops_old_when_replacement_already_present() {
    let mut page = Page::from_fetch(
      vec![post("p77", 250), post("temp-1", 250)],
      None,
      PageOrdering::NewestFirst,
    );
    assert!(page.replace_item("temp-1", post("p77", 250)));
    assert_eq!(page.ids(), vec!["p77"]);
  }

  #[test]
  fn test_from_fetch_derives_has_more_from_cursor() {
    let page = Page::from_fetch(vec![post("p1", 100)], None, PageOrdering::NewestFirst);
    assert!(!page.has_more);
    let page = Page::from_fetch(
      vec![post("p1", 100)],
      Some(Cursor::new("next")),
      PageOrdering::NewestFirst,
    );
    assert!(page.has_more);
  }
}
