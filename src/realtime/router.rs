//! Channel subscriptions and event dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::invalidation::InvalidationGraph;
use crate::model::Identity;
use crate::mutation::PendingOps;
use crate::store::CacheStore;

use super::merge::merge_event;
use super::transport::{RealtimeEvent, RealtimeTransport, TransportHandle};

struct ActiveSubscription {
  handle: TransportHandle,
  pump: JoinHandle<()>,
}

pub(crate) struct RouterShared {
  store: CacheStore,
  graph: Arc<InvalidationGraph>,
  identity: Arc<Identity>,
  pending: Arc<PendingOps>,
  config: SyncConfig,
  transport: Arc<dyn RealtimeTransport>,
  subscriptions: Mutex<HashMap<u64, ActiveSubscription>>,
  next_id: AtomicU64,
}

impl RouterShared {
  /// Route one event: buffer it when an optimistic operation on the same
  /// entity is pending (local intent, then confirmation, always wins the
  /// race against a stale push), otherwise merge immediately.
  fn handle_event(&self, event: RealtimeEvent) {
    if self
      .pending
      .buffer_if_pending(event.clone(), self.config.realtime_buffer_cap)
    {
      debug!(entity = %event.entity, "event buffered behind pending operation");
      return;
    }
    merge_event(&self.store, &self.graph, &self.identity, event);
  }

  /// Tear down one subscription's pump task and hand back its transport
  /// handle for the caller to release.
  fn release(&self, id: u64) -> Option<TransportHandle> {
    let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
    subscriptions.remove(&id).map(|active| {
      active.pump.abort();
      active.handle
    })
  }
}

/// Subscribes to push channels and merges their events into the store.
///
/// The router does not refcount physical channels: one `connect` is one
/// transport subscription, and the embedding layer multiplexes its own
/// logical consumers.
pub struct EventRouter {
  shared: Arc<RouterShared>,
}

impl EventRouter {
  pub fn new(
    store: CacheStore,
    graph: Arc<InvalidationGraph>,
    identity: Arc<Identity>,
    pending: Arc<PendingOps>,
    transport: Arc<dyn RealtimeTransport>,
    config: SyncConfig,
  ) -> Self {
    Self {
      shared: Arc::new(RouterShared {
        store,
        graph,
        identity,
        pending,
        config,
        transport,
        subscriptions: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  /// Open a channel subscription. Events flow into the store until the
  /// returned handle is disposed (or dropped).
  pub async fn connect(&self, channel: &str) -> Result<Subscription, SyncError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = self.shared.transport.subscribe(channel, tx).await?;

    let pump_shared = Arc::clone(&self.shared);
    let pump = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        pump_shared.handle_event(event);
      }
    });

    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .shared
      .subscriptions
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .insert(id, ActiveSubscription { handle, pump });
    debug!(channel, id, "channel connected");

    Ok(Subscription {
      id,
      shared: Arc::downgrade(&self.shared),
    })
  }

  /// Tear down one subscription by id.
  pub async fn disconnect(&self, id: u64) -> Result<(), SyncError> {
    match self.shared.release(id) {
      Some(handle) => self.shared.transport.unsubscribe(handle).await,
      None => Ok(()),
    }
  }

  /// Feed one event through the router as if it arrived on a channel.
  pub fn handle_event(&self, event: RealtimeEvent) {
    self.shared.handle_event(event);
  }

  /// Tear down every subscription. Used by engine disposal.
  pub async fn shutdown(&self) {
    let ids: Vec<u64> = {
      let subscriptions = self
        .shared
        .subscriptions
        .lock()
        .unwrap_or_else(|p| p.into_inner());
      subscriptions.keys().copied().collect()
    };
    let results = join_all(ids.iter().map(|id| self.disconnect(*id))).await;
    for (id, result) in ids.iter().zip(results) {
      if let Err(err) = result {
        warn!(id = *id, error = %err, "transport unsubscribe failed during shutdown");
      }
    }
  }

  pub fn subscription_count(&self) -> usize {
    self
      .shared
      .subscriptions
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .len()
  }
}

/// Scoped handle to one channel subscription. Explicit `dispose` releases
/// the transport subscription; dropping the handle releases it best-effort
/// so no exit path leaks a channel.
pub struct Subscription {
  id: u64,
  shared: Weak<RouterShared>,
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .finish_non_exhaustive()
  }
}

impl Subscription {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Release the subscription, waiting for the transport teardown.
  pub async fn dispose(mut self) -> Result<(), SyncError> {
    let Some(shared) = self.shared.upgrade() else {
      return Ok(());
    };
    // Drop's cleanup would race the explicit teardown.
    self.shared = Weak::new();
    match shared.release(self.id) {
      Some(handle) => shared.transport.unsubscribe(handle).await,
      None => Ok(()),
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(shared) = self.shared.upgrade() else {
      return;
    };
    if let Some(handle) = shared.release(self.id) {
      let transport = Arc::clone(&shared.transport);
      // Without a runtime there is nothing to drive the unsubscribe; the
      // pump task is already aborted either way.
      if let Ok(rt) = tokio::runtime::Handle::try_current() {
        rt.spawn(async move {
          if let Err(err) = transport.unsubscribe(handle).await {
            warn!(error = %err, "transport unsubscribe failed on drop");
          }
        });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::keys::CacheKey;
  use crate::model::{EntityKind, EntityRef, FeedTab, Item};
  use crate::store::{CacheData, EntryStatus};
  use crate::test_support::{
    api_conversation, api_message, api_post, conversation_record, delete_event, insert_event,
    message, message_page, page_data, post, update_event, MockTransport,
  };
  use pretty_assertions::assert_eq;

  fn feed_key() -> CacheKey {
    CacheKey::feed(FeedTab::ForYou)
  }

  fn router_with_store() -> (EventRouter, CacheStore, Arc<PendingOps>, Arc<MockTransport>) {
    let store = CacheStore::new();
    let pending = Arc::new(PendingOps::default());
    let transport = Arc::new(MockTransport::new());
    let router = EventRouter::new(
      store.clone(),
      Arc::new(InvalidationGraph::with_default_rules()),
      Arc::new(Identity::new("user-1")),
      Arc::clone(&pending),
      Arc::clone(&transport) as Arc<dyn RealtimeTransport>,
      SyncConfig::default(),
    );
    (router, store, pending, transport)
  }

  fn feed_ids(store: &CacheStore) -> Vec<String> {
    store
      .get(&feed_key())
      .unwrap()
      .page()
      .unwrap()
      .ids()
      .into_iter()
      .map(String::from)
      .collect()
  }

  fn history_ids(store: &CacheStore, conversation: &str) -> Vec<String> {
    store
      .get(&CacheKey::conversation_messages(conversation))
      .unwrap()
      .page()
      .unwrap()
      .ids()
      .into_iter()
      .map(String::from)
      .collect()
  }

  #[tokio::test]
  async fn test_old_message_merges_at_chronological_position() {
    let (router, store, _, _) = router_with_store();
    store.set(
      &CacheKey::conversation_messages("c1"),
      Some(message_page(
        vec![message("m1", "c1", 100), message("m3", "c1", 300)],
        None,
      )),
      EntryStatus::Fresh,
    );

    // The event's timestamp is older than the newest cached message; it
    // still lands between m1 and m3, not at the end.
    router.handle_event(insert_event(api_message("m2", "c1", 200), 200));

    assert_eq!(history_ids(&store, "c1"), vec!["m1", "m2", "m3"]);
  }

  #[tokio::test]
  async fn test_insert_event_is_idempotent() {
    let (router, store, _, _) = router_with_store();
    store.set(
      &feed_key(),
      Some(page_data(vec![post("p1", 100)], None)),
      EntryStatus::Fresh,
    );

    let event = insert_event(api_post("p2", 200), 200);
    router.handle_event(event.clone());
    let after_once = store.get(&feed_key());
    router.handle_event(event);
    assert_eq!(store.get(&feed_key()), after_once);
    assert_eq!(feed_ids(&store), vec!["p2", "p1"]);
  }

  #[tokio::test]
  async fn test_events_converge_in_any_order() {
    // Apply the same event set in two different orders; the pages must
    // converge to the same state.
    let events = |secs_offset: i64| {
      vec![
        insert_event(api_post("p2", 200), 200 + secs_offset),
        insert_event(api_post("p4", 400), 400 + secs_offset),
        insert_event(api_post("p3", 300), 300 + secs_offset),
      ]
    };

    let (router_a, store_a, _, _) = router_with_store();
    store_a.set(
      &feed_key(),
      Some(page_data(vec![post("p1", 100)], None)),
      EntryStatus::Fresh,
    );
    for event in events(0) {
      router_a.handle_event(event);
    }

    let (router_b, store_b, _, _) = router_with_store();
    store_b.set(
      &feed_key(),
      Some(page_data(vec![post("p1", 100)], None)),
      EntryStatus::Fresh,
    );
    for event in events(0).into_iter().rev() {
      router_b.handle_event(event);
    }

    assert_eq!(feed_ids(&store_a), feed_ids(&store_b));
    assert_eq!(feed_ids(&store_a), vec!["p4", "p3", "p2", "p1"]);
  }

  #[tokio::test]
  async fn test_stale_update_dropped_newer_applied() {
    let (router, store, _, _) = router_with_store();
    store.set(
      &feed_key(),
      Some(page_data(vec![post("p1", 500)], None)),
      EntryStatus::Fresh,
    );

    // Older than the cached copy: dropped.
    let crate::remote::ApiItem::Post(mut stale) = api_post("p1", 100) else {
      unreachable!()
    };
    stale.body = Some("stale body".into());
    router.handle_event(update_event(crate::remote::ApiItem::Post(stale), 100));
    let page = store.get(&feed_key()).unwrap().page().cloned().unwrap();
    assert_eq!(
      page.get("p1").unwrap().as_post().unwrap().body,
      "post p1"
    );

    // Newer: applied in place.
    let crate::remote::ApiItem::Post(mut newer) = api_post("p1", 100) else {
      unreachable!()
    };
    newer.body = Some("newer body".into());
    router.handle_event(update_event(crate::remote::ApiItem::Post(newer), 900));
    let page = store.get(&feed_key()).unwrap().page().cloned().unwrap();
    assert_eq!(
      page.get("p1").unwrap().as_post().unwrap().body,
      "newer body"
    );
  }

  #[tokio::test]
  async fn test_delete_event_removes_item_and_detail() {
    let (router, store, _, _) = router_with_store();
    store.set(
      &feed_key(),
      Some(page_data(vec![post("p2", 200), post("p1", 100)], None)),
      EntryStatus::Fresh,
    );
    store.set(
      &CacheKey::post_detail("p2"),
      Some(CacheData::Item(post("p2", 200))),
      EntryStatus::Fresh,
    );

    let entity = EntityRef::new(EntityKind::Post, "p2".into());
    router.handle_event(delete_event(entity.clone(), 900));
    assert_eq!(feed_ids(&store), vec!["p1"]);
    assert!(store.get(&CacheKey::post_detail("p2")).is_none());

    // Redelivery of the same delete is a no-op.
    router.handle_event(delete_event(entity, 900));
    assert_eq!(feed_ids(&store), vec!["p1"]);
  }

  #[tokio::test]
  async fn test_message_insert_bumps_conversation_preview_and_unread() {
    let (router, store, _, _) = router_with_store();
    store.set(
      &CacheKey::Conversations,
      Some(page_data(
        vec![Item::Conversation(conversation_record("c1", 50))],
        None,
      )),
      EntryStatus::Fresh,
    );
    store.set(
      &CacheKey::conversation_messages("c1"),
      Some(message_page(vec![message("m1", "c1", 100)], None)),
      EntryStatus::Fresh,
    );

    router.handle_event(insert_event(api_message("m2", "c1", 200), 200));

    assert_eq!(history_ids(&store, "c1"), vec!["m1", "m2"]);
    let list = store.get(&CacheKey::Conversations).unwrap();
    let page = list.page().cloned().unwrap();
    let conv = page.get("c1").unwrap().as_conversation().unwrap().clone();
    assert_eq!(conv.last_message.as_deref(), Some("message m2"));
    assert_eq!(conv.unread_count, 1);
  }

  #[tokio::test]
  async fn test_read_receipt_recounts_unread() {
    let (router, store, _, _) = router_with_store();
    let mut conv = conversation_record("c1", 50);
    conv.unread_count = 2;
    store.set(
      &CacheKey::Conversations,
      Some(page_data(vec![Item::Conversation(conv)], None)),
      EntryStatus::Fresh,
    );
    store.set(
      &CacheKey::conversation_messages("c1"),
      Some(message_page(
        vec![message("m1", "c1", 100), message("m2", "c1", 200)],
        None,
      )),
      EntryStatus::Fresh,
    );

    // m2 gets read by the viewer on another device.
    let crate::remote::ApiItem::Message(mut read_m2) = api_message("m2", "c1", 200) else {
      unreachable!()
    };
    read_m2.read_user_ids = vec!["user-1".into()];
    router.handle_event(update_event(crate::remote::ApiItem::Message(read_m2), 900));

    let list = store.get(&CacheKey::Conversations).unwrap();
    let page = list.page().cloned().unwrap();
    // m1 is still unread; the count reflects the loaded history.
    assert_eq!(
      page.get("c1").unwrap().as_conversation().unwrap().unread_count,
      1
    );
  }

  #[tokio::test]
  async fn test_conversation_insert_lands_in_list() {
    let (router, store, _, _) = router_with_store();
    store.set(
      &CacheKey::Conversations,
      Some(page_data(
        vec![Item::Conversation(conversation_record("c1", 50))],
        None,
      )),
      EntryStatus::Fresh,
    );

    router.handle_event(insert_event(api_conversation("c2", 80), 80));

    let list = store.get(&CacheKey::Conversations).unwrap();
    assert_eq!(list.page().unwrap().ids(), vec!["c2", "c1"]);
  }

  #[tokio::test]
  async fn test_event_buffered_while_operation_pending() {
    let (router, store, pending, _) = router_with_store();
    store.set(
      &feed_key(),
      Some(page_data(vec![post("p1", 100)], None)),
      EntryStatus::Fresh,
    );

    let entity = EntityRef::new(EntityKind::Post, "p1".into());
    assert!(pending.begin(&entity));

    let crate::remote::ApiItem::Post(mut pushed) = api_post("p1", 100) else {
      unreachable!()
    };
    pushed.like_count = Some(7);
    router.handle_event(update_event(crate::remote::ApiItem::Post(pushed), 900));

    // Not applied: the pending operation owns the entity.
    let page = store.get(&feed_key()).unwrap().page().cloned().unwrap();
    assert_eq!(page.get("p1").unwrap().as_post().unwrap().like_count, 0);
    assert!(pending.is_pending(&entity));
  }

  #[tokio::test]
  async fn test_connect_and_dispose_release_transport() {
    let (router, store, _, transport) = router_with_store();
    store.set(
      &feed_key(),
      Some(page_data(vec![], None)),
      EntryStatus::Fresh,
    );

    let subscription = router.connect("feed").await.unwrap();
    assert_eq!(transport.active_subscriptions(), 1);

    transport.emit("feed", insert_event(api_post("p1", 100), 100));
    tokio::task::yield_now().await;
    assert_eq!(feed_ids(&store), vec!["p1"]);

    subscription.dispose().await.unwrap();
    assert_eq!(transport.active_subscriptions(), 0);
    assert_eq!(transport.unsubscribed_handles().len(), 1);
    assert_eq!(router.subscription_count(), 0);
  }

  #[tokio::test]
  async fn test_dropped_subscription_releases_transport() {
    let (router, _, _, transport) = router_with_store();
    {
      let _subscription = router.connect("feed").await.unwrap();
      assert_eq!(transport.active_subscriptions(), 1);
    }
    // Drop schedules the unsubscribe on the runtime.
    tokio::task::yield_now().await;
    assert_eq!(router.subscription_count(), 0);
    assert_eq!(transport.active_subscriptions(), 0);
  }

  #[tokio::test]
  async fn test_shutdown_disconnects_everything() {
    let (router, _, _, transport) = router_with_store();
    router.connect("feed").await.unwrap();
    router.connect("conversation:c1").await.unwrap();
    assert_eq!(transport.active_subscriptions(), 2);

    router.shutdown().await;
    assert_eq!(transport.active_subscriptions(), 0);
    assert_eq!(router.subscription_count(), 0);
  }
}
