//! Fetch coordination.
//!
//! One in-flight remote call per key: concurrent readers attach to the
//! existing call instead of re-issuing it. Resolutions are applied in issue
//! order via per-key sequence numbers, so a slow stale response can never
//! overwrite a newer one.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use metrics::{counter, histogram};
use time::Duration;
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::config::CacheConfig;
use crate::entry::CachedValue;
use crate::error::{CacheError, RemoteError};
use crate::key::QueryKey;
use crate::store::{CacheStore, Refetcher};
use crate::telemetry::{
    METRIC_FETCH_DISCARD_TOTAL, METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_JOIN_TOTAL, METRIC_FETCH_MS,
    METRIC_HIT_TOTAL, METRIC_MISS_TOTAL,
};

/// How an [`ensure_fresh`](FetchCoordinator::ensure_fresh) call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Fresh cached data, no network call.
    Hit,
    /// This caller drove a remote fetch to resolution.
    Fetched,
    /// Attached to a fetch another caller already had in flight.
    Joined,
}

pub struct FetchCoordinator {
    store: Arc<CacheStore>,
    config: CacheConfig,
    in_flight: DashMap<QueryKey, watch::Receiver<bool>>,
}

impl FetchCoordinator {
    pub fn new(store: Arc<CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            in_flight: DashMap::new(),
        }
    }

    pub(crate) fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Serve `key` from cache when fresh, otherwise fetch.
    ///
    /// Stale entries keep their data visible while the refetch runs in the
    /// caller's own await (stale-while-revalidate). Concurrent callers for
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
        self.ensure_fresh_with(key, fetch, self.config.stale_after())
            .await
    }

    /// [`ensure_fresh`](Self::ensure_fresh) with a per-call stale window.
    #[instrument(skip(self, fetch), fields(key = %key))]
    pub async fn ensure_fresh_with<T, F, Fut>(
        &self,
        key: &QueryKey,
        fetch: F,
        stale_after: Duration,
    ) -> Result<FetchOutcome, CacheError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let now = time::OffsetDateTime::now_utc();
        if let Some(entry) = self.store.get(key)
            && entry.is_fresh(stale_after, now)
        {
            counter!(METRIC_HIT_TOTAL).increment(1);
            trace!("cache hit");
            return Ok(FetchOutcome::Hit);
        }

        let refetcher = erase(Arc::new(fetch));
        self.store.register_refetcher(key, Arc::clone(&refetcher));

        match self.try_begin(key) {
            Err(done) => {
                counter!(METRIC_FETCH_JOIN_TOTAL).increment(1);
                trace!("joined in-flight fetch");
                join(done).await;
                Ok(FetchOutcome::Joined)
            }
            Ok(guard) => {
                counter!(METRIC_MISS_TOTAL).increment(1);
                let result = self.drive(key, &refetcher).await;
                drop(guard);
                result.map(|()| FetchOutcome::Fetched)
            }
        }
    }

    /// Forced refresh: skips the freshness check and never joins an existing
    /// in-flight fetch. The new call gets a later sequence number, so if an
    /// older request resolves afterwards it is discarded.
    pub async fn refetch<T, F, Fut>(&self, key: &QueryKey, fetch: F) -> Result<(), CacheError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let refetcher = erase(Arc::new(fetch));
        self.store.register_refetcher(key, Arc::clone(&refetcher));
        self.drive(key, &refetcher).await
    }

    /// Forced refresh through a key's registered refetcher. Used by the
    /// invalidation fan-out, which does not know item types.
    pub(crate) async fn refetch_registered(&self, key: &QueryKey) -> Result<(), CacheError> {
        let Some(refetcher) = self.store.refetcher(key) else {
            debug!(key = %key, "no refetcher registered; entry stays flagged stale");
            return Ok(());
        };
        self.drive(key, &refetcher).await
    }

    /// True when a deduplicated fetch for the key is currently in flight.
    pub(crate) fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Claim the in-flight slot for `key`, or return the channel to wait on.
    pub(crate) fn try_begin(&self, key: &QueryKey) -> Result<InFlightGuard<'_>, watch::Receiver<bool>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => Err(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(false);
                vacant.insert(rx);
                Ok(InFlightGuard {
                    coordinator: self,
                    key: key.clone(),
                    tx: Some(tx),
                })
            }
        }
    }

    /// Issue one fetch and apply its resolution under the sequence guard.
    #[instrument(skip(self, refetcher), fields(key = %key))]
    pub(crate) async fn drive(&self, key: &QueryKey, refetcher: &Refetcher) -> Result<(), CacheError> {
        let seq = self.store.begin_fetch(key);
        let started = Instant::now();
        let result = refetcher().await;
        histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(value) => {
                if !self.store.apply_fetch_success(key, seq, value) {
                    counter!(METRIC_FETCH_DISCARD_TOTAL).increment(1);
                    debug!(seq, "discarded stale fetch resolution");
                }
                Ok(())
            }
            Err(err) => {
                counter!(METRIC_FETCH_ERROR_TOTAL).increment(1);
                if !self.store.apply_fetch_failure(key, seq, &err) {
                    counter!(METRIC_FETCH_DISCARD_TOTAL).increment(1);
                    debug!(seq, "discarded stale fetch failure");
                }
                Err(err)
            }
        }
    }
}

/// Releases the in-flight slot and wakes joined callers on drop, including
/// when the driving future is cancelled mid-fetch.
pub(crate) struct InFlightGuard<'a> {
    coordinator: &'a FetchCoordinator,
    key: QueryKey,
    tx: Option<watch::Sender<bool>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.in_flight.remove(&self.key);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(true);
        }
    }
}

async fn join(mut done: watch::Receiver<bool>) {
    let finished = *done.borrow();
    // A closed sender also means the in-flight fetch is gone.
    if !finished {
        let _ = done.changed().await;
    }
}

fn erase<T, F, Fut>(fetch: Arc<F>) -> Refetcher
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
{
    Arc::new(move || {
        let fut = fetch();
        async move { fut.await.map(CachedValue::new).map_err(CacheError::Remote) }.boxed()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::entry::QueryStatus;

    fn coordinator() -> Arc<FetchCoordinator> {
        let store = Arc::new(CacheStore::new());
        Arc::new(FetchCoordinator::new(store, CacheConfig::default()))
    }

    fn key() -> QueryKey {
        QueryKey::root("dues").with(2024i64)
    }

    #[tokio::test]
    async fn fresh_entries_skip_the_network() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RemoteError>(vec!["paid"])
                }
            }
        };

        let outcome = coordinator
            .ensure_fresh(&key(), fetch.clone())
            .await
            .expect("first fetch");
        assert_eq!(outcome, FetchOutcome::Fetched);

        let outcome = coordinator
            .ensure_fresh(&key(), fetch)
            .await
            .expect("cache hit");
        assert_eq!(outcome, FetchOutcome::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_network_call() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = watch::channel(false);

        let fetch = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                let mut gate = gate.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let released = *gate.borrow();
                    if !released {
                        let _ = gate.changed().await;
                    }
                    Ok::<_, RemoteError>(1u32)
                }
            }
        };

        let first = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            let fetch = fetch.clone();
            async move { coordinator.ensure_fresh(&key(), fetch).await }
        });
        let second = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.ensure_fresh(&key(), fetch).await }
        });

        // Let both callers reach the coordinator before the remote resolves.
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        release.send(true).expect("release gate");

        let outcomes = [
            first.await.expect("join").expect("fetch ok"),
            second.await.expect("join").expect("fetch ok"),
        ];

        assert_eq!(calls.load(Ordering::SeqCst), 1, "deduplicated to one call");
        assert!(outcomes.contains(&FetchOutcome::Fetched));
        assert!(outcomes.contains(&FetchOutcome::Joined));
    }

    #[tokio::test]
    async fn slow_stale_resolution_never_overwrites_newer_data() {
        let coordinator = coordinator();
        let (release, gate) = watch::channel(false);

        let slow_fetch = {
            move || {
                let mut gate = gate.clone();
                async move {
                    let released = *gate.borrow();
                    if !released {
                        let _ = gate.changed().await;
                    }
                    Ok::<_, RemoteError>("old")
                }
            }
        };

        let slow = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.ensure_fresh(&key(), slow_fetch).await }
        });
        // Make sure the slow fetch claimed its sequence number first.
        while !coordinator.is_in_flight(&key()) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        // A forced refetch issues a later sequence number and resolves first.
        coordinator
            .refetch(&key(), || async { Ok::<_, RemoteError>("new") })
            .await
            .expect("forced refetch");

        release.send(true).expect("release gate");
        slow.await.expect("join").expect("slow fetch completes");

        let entry = coordinator.store().get(&key()).expect("entry");
        assert_eq!(entry.data_as::<&str>(), Some("new"));
    }

    #[tokio::test]
    async fn failures_are_recorded_and_returned() {
        let coordinator = coordinator();

        let err = coordinator
            .ensure_fresh(&key(), || async {
                Err::<u32, _>(RemoteError::server(502, "bad gateway"))
            })
            .await
            .expect_err("propagated");
        assert!(matches!(
            err,
            CacheError::Remote(RemoteError::Server { status: 502, .. })
        ));

        let entry = coordinator.store().get(&key()).expect("entry");
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.error.as_ref().and_then(|e| e.status), Some(502));
    }

    #[tokio::test]
    async fn stale_entries_revalidate_but_keep_data_visible() {
        let store = Arc::new(CacheStore::new());
        let config = CacheConfig {
            stale_after_ms: 0,
            ..Default::default()
        };
        let coordinator = FetchCoordinator::new(Arc::clone(&store), config);
        store.prime(&key(), 1u32);

        let outcome = coordinator
            .ensure_fresh(&key(), || async { Ok::<_, RemoteError>(2u32) })
            .await
            .expect("revalidated");
        assert_eq!(outcome, FetchOutcome::Fetched);
        assert_eq!(store.get(&key()).expect("entry").data_as::<u32>(), Some(2));
    }
}
