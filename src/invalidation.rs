//! Invalidation fan-out.
//!
//! Invalidation is declared, never inferred: the caller names the prefixes a
//! write affected and the bus marks every matching entry stale. Entries that
//! still have subscribers are re-fetched immediately through their registered
//! refetcher; the rest stay flagged so the next subscription fetches instead
//! of serving stale data.

use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::fetch::FetchCoordinator;
use crate::key::QueryKey;
use crate::telemetry::METRIC_INVALIDATED_KEYS_TOTAL;

pub struct InvalidationBus {
    coordinator: Arc<FetchCoordinator>,
    refetch_on_invalidate: bool,
}

impl InvalidationBus {
    pub fn new(coordinator: Arc<FetchCoordinator>, config: &CacheConfig) -> Self {
        Self {
            coordinator,
            refetch_on_invalidate: config.refetch_on_invalidate,
        }
    }

    /// Mark every entry whose key equals or extends `prefix` stale and
    /// re-fetch the ones with active subscribers. Returns how many entries
    /// were invalidated.
    ///
    /// Refetch failures are recorded on their entries and logged; they do not
    /// fail the invalidation itself.
    pub async fn invalidate(&self, prefix: &QueryKey) -> usize {
        let store = self.coordinator.store();
        let matched = store.keys_matching(prefix);
        if matched.is_empty() {
            debug!(prefix = %prefix, "invalidation matched no entries");
            return 0;
        }

        let mut refetch_keys = Vec::new();
        for key in &matched {
            store.mark_stale(key);
            if self.refetch_on_invalidate && store.subscriber_count(key) > 0 {
                refetch_keys.push(key.clone());
            }
        }

        counter!(METRIC_INVALIDATED_KEYS_TOTAL).increment(matched.len() as u64);
        info!(
            prefix = %prefix,
            matched = matched.len(),
            refetching = refetch_keys.len(),
            "invalidation fan-out"
        );

        let results = join_all(
            refetch_keys
                .iter()
                .map(|key| self.coordinator.refetch_registered(key)),
        )
        .await;
        for (key, result) in refetch_keys.iter().zip(results) {
            if let Err(err) = result {
                warn!(key = %key, error = %err, "refetch after invalidation failed");
            }
        }

        matched.len()
    }

    /// Invalidate several unrelated prefixes, e.g. a reply write touching
    /// both the reply list and the parent comment list.
    pub async fn invalidate_many(&self, prefixes: &[QueryKey]) -> usize {
        let mut total = 0;
        for prefix in prefixes {
            total += self.invalidate(prefix).await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::entry::QueryStatus;
    use crate::error::RemoteError;
    use crate::store::CacheStore;

    fn setup() -> (Arc<CacheStore>, Arc<FetchCoordinator>, InvalidationBus) {
        let store = Arc::new(CacheStore::new());
        let config = CacheConfig::default();
        let coordinator = Arc::new(FetchCoordinator::new(Arc::clone(&store), config.clone()));
        let bus = InvalidationBus::new(Arc::clone(&coordinator), &config);
        (store, coordinator, bus)
    }

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl Fn() -> futures::future::Ready<Result<u32, RemoteError>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(value))
        }
    }

    #[tokio::test]
    async fn invalidation_respects_the_prefix_boundary() {
        let (store, coordinator, bus) = setup();

        let a1 = QueryKey::root("comments").with("a1");
        let b2 = QueryKey::root("comments").with("b2");

        let a1_calls = Arc::new(AtomicUsize::new(0));
        let b2_calls = Arc::new(AtomicUsize::new(0));

        let _sub_a1 = Arc::clone(&store).subscribe(a1.clone(), Arc::new(|_| {}));
        let _sub_b2 = Arc::clone(&store).subscribe(b2.clone(), Arc::new(|_| {}));

        coordinator
            .ensure_fresh(&a1, counting_fetch(&a1_calls, 1))
            .await
            .expect("a1 fetched");
        coordinator
            .ensure_fresh(&b2, counting_fetch(&b2_calls, 2))
            .await
            .expect("b2 fetched");

        let invalidated = bus.invalidate(&a1).await;
        assert_eq!(invalidated, 1);

        // a1 was re-fetched, b2 was left alone.
        assert_eq!(a1_calls.load(Ordering::SeqCst), 2);
        assert_eq!(b2_calls.load(Ordering::SeqCst), 1);
        assert!(!store.get(&a1).expect("a1 entry").stale);
        assert!(!store.get(&b2).expect("b2 entry").stale);
    }

    #[tokio::test]
    async fn prefix_invalidation_fans_out_to_all_extensions() {
        let (store, coordinator, bus) = setup();

        let a1 = QueryKey::root("comments").with("a1");
        let b2 = QueryKey::root("comments").with("b2");
        let other = QueryKey::root("replies").with("a1");

        let calls = Arc::new(AtomicUsize::new(0));
        let _sub_a1 = Arc::clone(&store).subscribe(a1.clone(), Arc::new(|_| {}));
        let _sub_b2 = Arc::clone(&store).subscribe(b2.clone(), Arc::new(|_| {}));
        let _sub_other = Arc::clone(&store).subscribe(other.clone(), Arc::new(|_| {}));

        for key in [&a1, &b2, &other] {
            coordinator
                .ensure_fresh(key, counting_fetch(&calls, 0))
                .await
                .expect("fetched");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let invalidated = bus.invalidate(&QueryKey::root("comments")).await;
        assert_eq!(invalidated, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 5, "both comment keys re-fetched");
    }

    #[tokio::test]
    async fn subscriber_less_entries_are_only_flagged() {
        let (store, coordinator, bus) = setup();

        let key = QueryKey::root("audit");
        let calls = Arc::new(AtomicUsize::new(0));
        coordinator
            .ensure_fresh(&key, counting_fetch(&calls, 9))
            .await
            .expect("fetched");

        bus.invalidate(&key).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1, "no refetch without subscribers");
        let entry = store.get(&key).expect("entry");
        assert!(entry.stale);
        // Data is still there for the next subscriber, just no longer fresh.
        assert_eq!(entry.data_as::<u32>(), Some(9));
        assert_eq!(entry.status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn refetch_failures_stay_on_the_entry() {
        let (store, coordinator, bus) = setup();

        let key = QueryKey::root("dues");
        let attempts = Arc::new(AtomicUsize::new(0));
        let _sub = Arc::clone(&store).subscribe(key.clone(), Arc::new(|_| {}));

        let fetch = {
            let attempts = Arc::clone(&attempts);
            move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Ok(1u32)
                    } else {
                        Err(RemoteError::server(500, "flaky"))
                    }
                }
            }
        };
        coordinator.ensure_fresh(&key, fetch).await.expect("seeded");

        bus.invalidate(&key).await;

        let entry = store.get(&key).expect("entry");
        assert_eq!(entry.status, QueryStatus::Error);
        // The previous data survives the failed refetch.
        assert_eq!(entry.data_as::<u32>(), Some(1));
    }
}
