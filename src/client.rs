//! The cache context object.
//!
//! [`SyncCache`] wires every component over one shared store. It is
//! explicitly constructed and passed by reference (or cheaply cloned); there
//! is no ambient global cache, so tests can run independent instances side
//! by side.

use std::future::Future;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, RemoteError};
use crate::fetch::{FetchCoordinator, FetchOutcome};
use crate::invalidation::InvalidationBus;
use crate::key::QueryKey;
use crate::mutation::{MutationCoordinator, MutationOptions};
use crate::page::{InfiniteResult, Page};
use crate::pagination::{NextPageOutcome, PaginationEngine};
use crate::source::{RemoteCollection, page_fetcher};
use crate::store::{CacheStore, Listener, Subscription};

/// One fully wired cache: store, fetch coordination, pagination, mutations
/// and invalidation sharing a single keyed store.
#[derive(Clone)]
pub struct SyncCache {
    store: Arc<CacheStore>,
    coordinator: Arc<FetchCoordinator>,
    pagination: Arc<PaginationEngine>,
    mutations: Arc<MutationCoordinator>,
    bus: Arc<InvalidationBus>,
    config: CacheConfig,
}

impl SyncCache {
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new());
        let coordinator = Arc::new(FetchCoordinator::new(Arc::clone(&store), config.clone()));
        let bus = Arc::new(InvalidationBus::new(Arc::clone(&coordinator), &config));
        let pagination = Arc::new(PaginationEngine::new(Arc::clone(&coordinator)));
        let mutations = Arc::new(MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
        ));
        Self {
            store,
            coordinator,
            pagination,
            mutations,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Reads and subscriptions
    // ------------------------------------------------------------------

    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.store.get(key)
    }

    /// Typed read of a key's data.
    pub fn data<T: Clone + Send + Sync + 'static>(&self, key: &QueryKey) -> Option<T> {
        self.store.get(key).and_then(|entry| entry.data_as::<T>())
    }

    pub fn subscribe(&self, key: QueryKey, listener: Listener) -> Subscription {
        Arc::clone(&self.store).subscribe(key, listener)
    }

    /// Seed a key with known-good data without a fetch.
    pub fn prime<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        self.store.prime(key, value);
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    /// Serve from cache when fresh, fetch otherwise; concurrent callers for
    /// the same key share one remote call.
    pub async fn ensure_fresh<T, F, Fut>(
        &self,
        key: &QueryKey,
        fetch: F,
    ) -> Result<FetchOutcome, CacheError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        self.coordinator.ensure_fresh(key, fetch).await
    }

    /// Forced refresh, bypassing freshness and deduplication.
    pub async fn refetch<T, F, Fut>(&self, key: &QueryKey, fetch: F) -> Result<(), CacheError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        self.coordinator.refetch(key, fetch).await
    }

    // ------------------------------------------------------------------
    // Pagination
    // ------------------------------------------------------------------

    pub async fn fetch_first_page<T, F, Fut>(
        &self,
        key: &QueryKey,
        fetch_page: F,
    ) -> Result<(), CacheError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Page<T>, RemoteError>> + Send + 'static,
    {
        self.pagination.fetch_first_page(key, fetch_page).await
    }

    pub async fn fetch_next_page<T, F, Fut>(
        &self,
        key: &QueryKey,
        fetch_page: F,
    ) -> Result<NextPageOutcome, CacheError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(u32) -> Fut + Send,
        Fut: Future<Output = Result<Page<T>, RemoteError>> + Send,
    {
        self.pagination.fetch_next_page(key, fetch_page).await
    }

    /// Typed read of a key's stored page sequence.
    pub fn sequence<T: Clone + Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> Option<InfiniteResult<T>> {
        self.pagination.sequence(key)
    }

    /// First page via a wired [`RemoteCollection`] source.
    pub async fn fetch_first_page_from<S: RemoteCollection>(
        &self,
        key: &QueryKey,
        source: &Arc<S>,
    ) -> Result<(), CacheError> {
        let fetch = page_fetcher(Arc::clone(source), key.clone());
        self.pagination.fetch_first_page(key, fetch).await
    }

    /// Next page via a wired [`RemoteCollection`] source.
    pub async fn fetch_next_page_from<S: RemoteCollection>(
        &self,
        key: &QueryKey,
        source: &Arc<S>,
    ) -> Result<NextPageOutcome, CacheError> {
        let fetch = page_fetcher(Arc::clone(source), key.clone());
        self.pagination.fetch_next_page(key, fetch).await
    }

    // ------------------------------------------------------------------
    // Mutations and invalidation
    // ------------------------------------------------------------------

    /// Execute a write with optional optimistic update, rollback on failure
    /// and settlement invalidation. See [`MutationCoordinator::mutate`].
    pub async fn mutate<I, R, F, Fut>(
        &self,
        input: I,
        remote: F,
        options: MutationOptions<I, R>,
    ) -> Result<R, CacheError>
    where
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<R, RemoteError>>,
    {
        self.mutations.mutate(input, remote, options).await
    }

    /// Mark matching entries stale and refresh the subscribed ones.
    pub async fn invalidate(&self, prefix: &QueryKey) -> usize {
        self.bus.invalidate(prefix).await
    }

    pub async fn invalidate_many(&self, prefixes: &[QueryKey]) -> usize {
        self.bus.invalidate_many(prefixes).await
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Remove entries whose last subscriber left more than the configured
    /// grace period ago.
    pub fn sweep_detached(&self) -> usize {
        self.store.sweep_detached(self.config.gc_grace())
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for SyncCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
