//! Infinite pagination over cached sequences.
//!
//! The stored value for a paginated key is an [`InfiniteResult<T>`]. Page 1
//! restarts the sequence; later pages are appended strictly in order through
//! the store's sequence-guarded update path, so a late or out-of-order
//! response can neither clobber a restart nor splice into the wrong spot.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use tracing::{debug, instrument, trace};

use crate::entry::CachedValue;
use crate::error::{CacheError, RemoteError};
use crate::fetch::FetchCoordinator;
use crate::key::QueryKey;
use crate::page::{InfiniteResult, Page};
use crate::store::Refetcher;
use crate::telemetry::{METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_MS};

/// Result of a [`fetch_next_page`](PaginationEngine::fetch_next_page) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPageOutcome {
    /// The next page was fetched and appended.
    Appended,
    /// The last page reported no further page; nothing was fetched.
    NoMorePages,
    /// A fetch for this key is already in flight; nothing was fetched.
    InFlight,
    /// The page arrived but a newer resolution (e.g. a restart) had already
    /// been applied, so it was discarded.
    Superseded,
}

pub struct PaginationEngine {
    coordinator: Arc<FetchCoordinator>,
}

impl PaginationEngine {
    pub fn new(coordinator: Arc<FetchCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Fetch page 1 and store a fresh single-page sequence, discarding any
    /// previously appended pages. Restartable at any time; also registers
    /// page 1 as the key's refetcher so invalidation resets the sequence.
    #[instrument(skip(self, fetch_page), fields(key = %key))]
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
        let refetcher = first_page_refetcher(Arc::new(fetch_page));
        let store = self.coordinator.store();
        store.register_refetcher(key, Arc::clone(&refetcher));

        // Claim the in-flight slot when free so fetch_next_page no-ops, but
        // never block a restart behind someone else's fetch.
        let guard = self.coordinator.try_begin(key).ok();
        let result = self.coordinator.drive(key, &refetcher).await;
        drop(guard);
        result
    }

    /// Fetch and append the page after the stored sequence's last page.
    ///
    /// No-ops (without a network call) when the sequence is complete or a
    /// fetch for this key is already in flight. A response that does not
    /// continue the sequence fails with [`CacheError::SequenceConflict`].
    #[instrument(skip(self, fetch_page), fields(key = %key))]
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
        let store = Arc::clone(self.coordinator.store());
        let sequence = store
            .get(key)
            .and_then(|entry| entry.data_as::<InfiniteResult<T>>())
            .ok_or_else(|| {
                CacheError::validation(format!(
                    "no stored sequence for `{key}`; fetch_first_page must run first"
                ))
            })?;

        let Some(page_param) = sequence.next_page_param() else {
            trace!("sequence complete; skipping fetch");
            return Ok(NextPageOutcome::NoMorePages);
        };

        let Ok(guard) = self.coordinator.try_begin(key) else {
            trace!("fetch already in flight; skipping");
            return Ok(NextPageOutcome::InFlight);
        };

        let seq = store.begin_fetch(key);
        let started = Instant::now();
        let fetched = fetch_page(page_param).await;
        histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        let outcome = match fetched {
            Ok(page) => store
                .apply_fetch_update(key, seq, |current| {
                    let mut sequence = current
                        .and_then(|value| value.downcast_ref::<InfiniteResult<T>>())
                        .cloned()
                        .ok_or_else(|| {
                            CacheError::validation(format!(
                                "stored sequence for `{key}` disappeared during next-page fetch"
                            ))
                        })?;
                    sequence.try_append(page)?;
                    Ok(CachedValue::new(sequence))
                })
                .map(|applied| {
                    if applied {
                        NextPageOutcome::Appended
                    } else {
                        debug!(seq, "next page superseded by a newer resolution");
                        NextPageOutcome::Superseded
                    }
                }),
            Err(err) => {
                let err = CacheError::Remote(err);
                counter!(METRIC_FETCH_ERROR_TOTAL).increment(1);
                store.apply_fetch_failure(key, seq, &err);
                Err(err)
            }
        };
        drop(guard);
        outcome
    }

    /// Typed read of a key's stored sequence.
    pub fn sequence<T: Clone + Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> Option<InfiniteResult<T>> {
        self.coordinator
            .store()
            .get(key)
            .and_then(|entry| entry.data_as::<InfiniteResult<T>>())
    }
}

fn first_page_refetcher<T, F, Fut>(fetch_page: Arc<F>) -> Refetcher
where
    T: Clone + Send + Sync + 'static,
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Page<T>, RemoteError>> + Send + 'static,
{
    Arc::new(move || {
        let fut = fetch_page(1);
        async move {
            let page = fut.await.map_err(CacheError::Remote)?;
            let sequence = InfiniteResult::first(page)?;
            Ok(CachedValue::new(sequence))
        }
        .boxed()
    })
}
