//! Mutation coordination.
//!
//! A mutation runs `Pending -> {Success, Error}` with a settlement phase that
//! always executes. Optimistic updates snapshot every touched key from the
//! *current* cache state, apply synchronously before the remote call is
//! awaited, and roll back whole on failure. Settlement invalidates the
//! declared prefixes so real data eventually replaces the optimistic guess.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::CachedValue;
use crate::error::{CacheError, RemoteError};
use crate::invalidation::InvalidationBus;
use crate::key::QueryKey;
use crate::store::CacheStore;
use crate::telemetry::{
    METRIC_MUTATION_MS, METRIC_OPTIMISTIC_APPLY_TOTAL, METRIC_ROLLBACK_TOTAL,
};

type PatchFn = Box<dyn FnOnce(Option<&CachedValue>) -> CachedValue + Send>;

/// Declarative optimistic patch set: one atomic transform per touched key.
///
/// A patch sees the key's current value and returns the replacement, so
/// related fields (a flag and its counter, say) change together or not at
/// all.
#[derive(Default)]
pub struct OptimisticUpdate {
    patches: Vec<(QueryKey, PatchFn)>,
}

impl OptimisticUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed patch: receives the current value when the key holds a `T`.
    pub fn patch<T, F>(mut self, key: QueryKey, patch: F) -> Self
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        self.patches.push((
            key,
            Box::new(move |current| {
                let current = current.and_then(CachedValue::get::<T>);
                CachedValue::new(patch(current))
            }),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    fn keys(&self) -> Vec<QueryKey> {
        self.patches.iter().map(|(key, _)| key.clone()).collect()
    }

    fn apply(self, store: &CacheStore) {
        for (key, patch) in self.patches {
            store.set_data(&key, patch);
        }
    }
}

/// Pre-mutation copy of every touched entry's data, captured immediately
/// before the optimistic write and retained for the lifetime of one in-flight
/// mutation. Values are immutable, so the handle clones are deep enough.
pub struct MutationSnapshot {
    entries: Vec<(QueryKey, Option<CachedValue>, Option<OffsetDateTime>)>,
}

impl MutationSnapshot {
    fn capture(store: &CacheStore, keys: &[QueryKey]) -> Self {
        let entries = keys
            .iter()
            .map(|key| match store.get(key) {
                Some(entry) => (key.clone(), entry.data, entry.last_updated_at),
                None => (key.clone(), None, None),
            })
            .collect();
        Self { entries }
    }

    /// Restore every touched key exactly to its pre-mutation value.
    ///
    /// A key whose entry was destroyed mid-flight cannot be restored
    /// faithfully; it is evicted and reported as a [`CacheError::RollbackFailure`].
    fn restore(self, store: &CacheStore) -> Result<(), CacheError> {
        let mut failure = None;
        for (key, data, last_updated_at) in self.entries {
            if store.restore(&key, data, last_updated_at).is_err() {
                store.evict(&key);
                warn!(key = %key, "rollback target destroyed mid-flight; entry evicted");
                failure.get_or_insert(CacheError::RollbackFailure {
                    key,
                    reason: "entry destroyed while the mutation was in flight".into(),
                });
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Hooks and policy for one [`MutationCoordinator::mutate`] invocation.
pub struct MutationOptions<I, R> {
    validate: Option<Box<dyn FnOnce(&I) -> Result<(), String> + Send>>,
    optimistic: Option<OptimisticUpdate>,
    invalidates: Vec<QueryKey>,
    on_success: Option<Box<dyn FnOnce(&R) + Send>>,
    on_error: Option<Box<dyn FnOnce(&CacheError) + Send>>,
    on_settled: Option<Box<dyn FnOnce() + Send>>,
}

impl<I, R> Default for MutationOptions<I, R> {
    fn default() -> Self {
        Self {
            validate: None,
            optimistic: None,
            invalidates: Vec::new(),
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<I, R> MutationOptions<I, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject bad input before dispatch; the remote call is never issued.
    pub fn validate<F>(mut self, validate: F) -> Self
    where
        F: FnOnce(&I) -> Result<(), String> + Send + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }

    pub fn optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic = Some(update);
        self
    }

    /// Declare a prefix to invalidate at settlement. May be called multiple
    /// times; one write often fans out to several unrelated prefixes.
    pub fn invalidates(mut self, prefix: QueryKey) -> Self {
        self.invalidates.push(prefix);
        self
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&R) + Send + 'static,
    {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&CacheError) + Send + 'static,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Runs last, regardless of which terminal state was reached.
    pub fn on_settled<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_settled = Some(Box::new(hook));
        self
    }
}

pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    bus: Arc<InvalidationBus>,
}

impl MutationCoordinator {
    pub fn new(store: Arc<CacheStore>, bus: Arc<InvalidationBus>) -> Self {
        Self { store, bus }
    }

    /// Execute one mutation against the remote source.
    ///
    /// The remote call runs exactly once; retries, if wanted, belong to the
    /// remote source. Errors are forwarded to `on_error` and returned, never
    /// swallowed. Overlapping mutations are allowed: each snapshot is taken
    /// from the cache state at its own start, so a later rollback never
    /// rewinds an earlier mutation's patch.
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
        let mutation_id = Uuid::new_v4();
        let started = Instant::now();

        if let Some(validate) = options.validate
            && let Err(message) = validate(&input)
        {
            let err = CacheError::Validation(message);
            debug!(%mutation_id, error = %err, "mutation rejected before dispatch");
            if let Some(on_error) = options.on_error {
                on_error(&err);
            }
            return Err(err);
        }

        debug!(%mutation_id, state = "pending", "mutation dispatched");

        // Optimistic phase: snapshot, then apply, all before the first await
        // so subscribers see the change before control returns to the caller.
        let snapshot = options.optimistic.map(|update| {
            let snapshot = MutationSnapshot::capture(&self.store, &update.keys());
            update.apply(&self.store);
            counter!(METRIC_OPTIMISTIC_APPLY_TOTAL).increment(1);
            snapshot
        });

        let outcome = remote(input).await.map_err(CacheError::Remote);

        let result = match outcome {
            Ok(value) => {
                debug!(%mutation_id, state = "success", "mutation confirmed");
                if let Some(on_success) = options.on_success {
                    on_success(&value);
                }
                Ok(value)
            }
            Err(err) => {
                let err = match snapshot {
                    Some(snapshot) => {
                        counter!(METRIC_ROLLBACK_TOTAL).increment(1);
                        match snapshot.restore(&self.store) {
                            // Rollback trouble supersedes the remote error:
                            // the entry state, not the wire, is now the
                            // problem.
                            Err(rollback_err) => rollback_err,
                            Ok(()) => err,
                        }
                    }
                    None => err,
                };
                debug!(%mutation_id, state = "error", error = %err, "mutation failed");
                if let Some(on_error) = options.on_error {
                    on_error(&err);
                }
                Err(err)
            }
        };

        // Settlement: always runs, success or error, before control returns.
        self.bus.invalidate_many(&options.invalidates).await;
        if let Some(on_settled) = options.on_settled {
            on_settled();
        }
        debug!(%mutation_id, state = "settled", "mutation settled");
        histogram!(METRIC_MUTATION_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        result
    }
}
