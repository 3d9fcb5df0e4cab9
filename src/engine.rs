//! Engine assembly and lifecycle.
//!
//! `SyncEngine` wires the store, paginator, mutation executor, and event
//! router around one identity and one pair of collaborators. It is an
//! explicit instance with an explicit lifecycle: created by the embedding
//! app, injected into views, and disposed when the session ends. Never an
//! ambient global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::invalidation::InvalidationGraph;
use crate::keys::CacheKey;
use crate::model::Identity;
use crate::mutation::{MutationExecutor, PendingOps};
use crate::pagination::Paginator;
use crate::query::{MutationHandle, QueryHandle};
use crate::realtime::{EventRouter, RealtimeTransport, Subscription};
use crate::remote::RemoteApi;
use crate::store::CacheStore;

/// The synchronization engine: one per signed-in session.
pub struct SyncEngine {
  store: CacheStore,
  config: SyncConfig,
  paginator: Arc<Paginator>,
  executor: Arc<MutationExecutor>,
  router: EventRouter,
  disposed: Arc<AtomicBool>,
}

impl SyncEngine {
  /// Assemble an engine around the remote API and realtime transport
  /// collaborators. The default invalidation rules cover the feed and chat
  /// surfaces; use [`SyncEngine::create_with_graph`] to extend them.
  pub fn create(
    remote: Arc<dyn RemoteApi>,
    transport: Arc<dyn RealtimeTransport>,
    identity: Identity,
    config: SyncConfig,
  ) -> Self {
    Self::create_with_graph(
      remote,
      transport,
      identity,
      config,
      InvalidationGraph::with_default_rules(),
    )
  }

  pub fn create_with_graph(
    remote: Arc<dyn RemoteApi>,
    transport: Arc<dyn RealtimeTransport>,
    identity: Identity,
    config: SyncConfig,
    graph: InvalidationGraph,
  ) -> Self {
    let store = CacheStore::new();
    let identity = Arc::new(identity);
    let graph = Arc::new(graph);
    let pending = Arc::new(PendingOps::default());

    let paginator = Arc::new(Paginator::new(
      store.clone(),
      Arc::clone(&remote),
      Arc::clone(&identity),
      config.clone(),
    ));
    let executor = Arc::new(MutationExecutor::new(
      store.clone(),
      remote,
      Arc::clone(&identity),
      Arc::clone(&graph),
      Arc::clone(&pending),
    ));
    let router = EventRouter::new(
      store.clone(),
      graph,
      identity,
      pending,
      transport,
      config.clone(),
    );

    Self {
      store,
      config,
      paginator,
      executor,
      router,
      disposed: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Handle for reading and paginating one cached query.
  pub fn query(&self, key: CacheKey) -> QueryHandle {
    QueryHandle::new(
      key,
      self.store.clone(),
      Arc::clone(&self.paginator),
      self.config.clone(),
      Arc::clone(&self.disposed),
    )
  }

  /// Handle for running optimistic mutations.
  pub fn mutation(&self) -> MutationHandle {
    MutationHandle::new(Arc::clone(&self.executor), Arc::clone(&self.disposed))
  }

  /// Subscribe to a push channel. The subscription must be disposed by the
  /// consumer that opened it.
  pub async fn connect(&self, channel: &str) -> Result<Subscription, SyncError> {
    if self.is_disposed() {
      return Err(SyncError::Disposed);
    }
    self.router.connect(channel).await
  }

  /// Feed one realtime event directly into the router, bypassing the
  /// transport. Useful for replays and tests.
  pub fn inject_event(&self, event: crate::realtime::RealtimeEvent) {
    self.router.handle_event(event);
  }

  /// The shared store. Clones observe the same table.
  pub fn store(&self) -> CacheStore {
    self.store.clone()
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::SeqCst)
  }

  /// Tear down every channel subscription and refuse further work. Handles
  /// created earlier return [`SyncError::Disposed`] from their fetch and
  /// mutation calls; cached reads keep working so views can unwind calmly.
  pub async fn dispose(&self) {
    if self.disposed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.router.shutdown().await;
    info!("sync engine disposed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::FeedTab;
  use crate::query::MutationStatus;
  use crate::remote::ApiError;
  use crate::store::EntryStatus;
  use crate::test_support::{
    api_post, insert_event, mutation_response, page_response, MockRemote, MockTransport,
  };
  use pretty_assertions::assert_eq;
  use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

  fn feed_key() -> CacheKey {
    CacheKey::feed(FeedTab::ForYou)
  }

  fn engine_with(remote: Arc<MockRemote>, transport: Arc<MockTransport>) -> SyncEngine {
    SyncEngine::create(
      remote,
      transport,
      Identity::new("user-1"),
      SyncConfig::default(),
    )
  }

  #[tokio::test]
  async fn test_query_handle_drives_fetch_and_notifies() {
    let remote = Arc::new(MockRemote::new());
    remote.queue_page(
      &feed_key(),
      Ok(page_response(vec![api_post("p2", 200), api_post("p1", 100)], None)),
    );
    let engine = engine_with(Arc::clone(&remote), Arc::new(MockTransport::new()));

    let query = engine.query(feed_key());
    assert_eq!(query.status(), EntryStatus::Idle);

    let notified = Arc::new(AtomicUsize::new(0));
    let notified_in_listener = Arc::clone(&notified);
    let _guard = query.subscribe(move |_entry| {
      notified_in_listener.fetch_add(1, AtomicOrdering::SeqCst);
    });

    query.ensure().await.unwrap();
    assert_eq!(query.status(), EntryStatus::Fresh);
    assert_eq!(query.page().unwrap().ids(), vec!["p2", "p1"]);
    // Loading transition plus the fetched write.
    assert_eq!(notified.load(AtomicOrdering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_mutation_handle_tracks_lifecycle() {
    let remote = Arc::new(MockRemote::new());
    remote.queue_page(
      &feed_key(),
      Ok(page_response(vec![api_post("p1", 100)], None)),
    );
    let engine = engine_with(Arc::clone(&remote), Arc::new(MockTransport::new()));
    engine.query(feed_key()).ensure().await.unwrap();

    let mutation = engine.mutation();
    assert_eq!(mutation.status(), MutationStatus::Idle);

    remote.queue_mutation(Ok(mutation_response(None)));
    mutation.toggle_like("p1").await.unwrap();
    assert_eq!(mutation.status(), MutationStatus::Confirmed);

    remote.queue_mutation(Err(ApiError::network("offline")));
    mutation.toggle_like("p1").await.unwrap_err();
    assert_eq!(mutation.status(), MutationStatus::RolledBack);
  }

  #[tokio::test]
  async fn test_realtime_events_reach_subscribed_views() {
    let remote = Arc::new(MockRemote::new());
    remote.queue_page(&feed_key(), Ok(page_response(vec![api_post("p1", 100)], None)));
    let transport = Arc::new(MockTransport::new());
    let engine = engine_with(Arc::clone(&remote), Arc::clone(&transport));

    let query = engine.query(feed_key());
    query.ensure().await.unwrap();

    let subscription = engine.connect("feed").await.unwrap();
    transport.emit("feed", insert_event(api_post("p2", 200), 200));
    tokio::task::yield_now().await;

    assert_eq!(query.page().unwrap().ids(), vec!["p2", "p1"]);
    subscription.dispose().await.unwrap();
  }

  #[tokio::test]
  async fn test_dispose_tears_down_and_refuses_work() {
    let remote = Arc::new(MockRemote::new());
    remote.queue_page(&feed_key(), Ok(page_response(vec![api_post("p1", 100)], None)));
    let transport = Arc::new(MockTransport::new());
    let engine = engine_with(Arc::clone(&remote), Arc::clone(&transport));

    let query = engine.query(feed_key());
    query.ensure().await.unwrap();
    let _subscription = engine.connect("feed").await.unwrap();
    assert_eq!(transport.active_subscriptions(), 1);

    engine.dispose().await;
    assert!(engine.is_disposed());
    assert_eq!(transport.active_subscriptions(), 0);

    // Fetch and mutation calls refuse; cached reads keep working.
    assert_eq!(query.refresh().await.unwrap_err(), SyncError::Disposed);
    assert_eq!(
      engine.mutation().toggle_like("p1").await.unwrap_err(),
      SyncError::Disposed
    );
    assert_eq!(engine.connect("feed").await.unwrap_err(), SyncError::Disposed);
    assert_eq!(query.page().unwrap().ids(), vec!["p1"]);

    // Disposing twice is harmless.
    engine.dispose().await;
  }
}
