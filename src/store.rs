//! Keyed cache storage.
//!
//! The store is the only shared mutable state in the system. Every write goes
//! through one lock-guarded entry point, entry data is replaced via pure
//! transforms, and subscribers are notified after the write lock is released
//! so a listener can safely re-enter the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use metrics::counter;
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace};

use crate::entry::{CacheEntry, CachedValue, ErrorInfo, QueryStatus};
use crate::error::CacheError;
use crate::key::QueryKey;
use crate::lock::{read_guard, write_guard};
use crate::telemetry::METRIC_GC_EVICTED_TOTAL;

/// Callback invoked with a fresh snapshot after every write to its key.
pub type Listener = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

/// Type-erased re-fetch closure registered by whichever fetch path owns the
/// key, so invalidation can refresh it without knowing item types.
pub(crate) type Refetcher =
    Arc<dyn Fn() -> BoxFuture<'static, Result<CachedValue, CacheError>> + Send + Sync>;

struct EntryState {
    data: Option<CachedValue>,
    status: QueryStatus,
    error: Option<ErrorInfo>,
    last_updated_at: Option<OffsetDateTime>,
    stale: bool,
    listeners: Vec<(u64, Listener)>,
    /// Monotonic per-key counter stamped on each issued fetch.
    next_fetch_seq: u64,
    /// Sequence number of the last applied resolution.
    applied_fetch_seq: u64,
    refetch: Option<Refetcher>,
    /// Set when the last subscriber leaves; cleared on re-subscribe.
    detached_at: Option<OffsetDateTime>,
}

impl EntryState {
    fn new() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            last_updated_at: None,
            stale: false,
            listeners: Vec::new(),
            next_fetch_seq: 0,
            applied_fetch_seq: 0,
            refetch: None,
            detached_at: None,
        }
    }

    fn snapshot(&self, key: &QueryKey) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            last_updated_at: self.last_updated_at,
            subscriber_count: self.listeners.len(),
            stale: self.stale,
        }
    }
}

/// Process-wide keyed store: one [`CacheEntry`] per distinct [`QueryKey`].
pub struct CacheStore {
    entries: RwLock<HashMap<QueryKey, EntryState>>,
    next_subscription_id: AtomicU64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Current snapshot for a key. Never blocks on I/O.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        read_guard(&self.entries, "get")
            .get(key)
            .map(|state| state.snapshot(key))
    }

    pub fn len(&self) -> usize {
        read_guard(&self.entries, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        read_guard(&self.entries, "subscriber_count")
            .get(key)
            .map(|state| state.listeners.len())
            .unwrap_or(0)
    }

    /// Register a listener for a key, creating the entry lazily.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes; when the last
    /// subscriber leaves, the entry becomes eligible for the GC sweep after
    /// the grace period.
    pub fn subscribe(self: Arc<Self>, key: QueryKey, listener: Listener) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = write_guard(&self.entries, "subscribe");
            let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
            state.detached_at = None;
            state.listeners.push((id, listener));
        }
        trace!(key = %key, subscription = id, "subscribed");
        Subscription {
            store: self,
            key,
            id,
        }
    }

    fn unsubscribe(&self, key: &QueryKey, id: u64) {
        let mut entries = write_guard(&self.entries, "unsubscribe");
        if let Some(state) = entries.get_mut(key) {
            state.listeners.retain(|(listener_id, _)| *listener_id != id);
            if state.listeners.is_empty() {
                state.detached_at = Some(OffsetDateTime::now_utc());
            }
        }
    }

    /// Atomically replace a key's data via a pure transform.
    ///
    /// Only the data field (and its timestamp) change; status and error are
    /// owned by the fetch path and stay untouched. Creates the entry when
    /// absent so optimistic writes can target not-yet-fetched keys.
    pub fn set_data<F>(&self, key: &QueryKey, updater: F)
    where
        F: FnOnce(Option<&CachedValue>) -> CachedValue,
    {
        let notify = {
            let mut entries = write_guard(&self.entries, "set_data");
            let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
            state.data = Some(updater(state.data.as_ref()));
            state.last_updated_at = Some(OffsetDateTime::now_utc());
            self.pending_notification(key, state)
        };
        Self::dispatch(notify);
    }

    /// Seed a key with known-good data without issuing a fetch.
    pub fn prime<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        let notify = {
            let mut entries = write_guard(&self.entries, "prime");
            let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
            state.data = Some(CachedValue::new(value));
            state.status = QueryStatus::Success;
            state.error = None;
            state.stale = false;
            state.last_updated_at = Some(OffsetDateTime::now_utc());
            self.pending_notification(key, state)
        };
        Self::dispatch(notify);
    }

    /// Issue-side bookkeeping for a fetch: allocate the next per-key sequence
    /// number and flip data-less entries to `Loading`.
    pub(crate) fn begin_fetch(&self, key: &QueryKey) -> u64 {
        let (seq, notify) = {
            let mut entries = write_guard(&self.entries, "begin_fetch");
            let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
            state.next_fetch_seq += 1;
            let notify = if state.data.is_none() && state.status != QueryStatus::Loading {
                state.status = QueryStatus::Loading;
                self.pending_notification(key, state)
            } else {
                None
            };
            (state.next_fetch_seq, notify)
        };
        Self::dispatch(notify);
        trace!(key = %key, seq, "fetch issued");
        seq
    }

    /// Apply a successful resolution unless a newer one already landed.
    /// Returns false when the resolution was discarded as stale.
    pub(crate) fn apply_fetch_success(&self, key: &QueryKey, seq: u64, value: CachedValue) -> bool {
        let notify = {
            let mut entries = write_guard(&self.entries, "apply_fetch_success");
            let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
            if seq <= state.applied_fetch_seq {
                return false;
            }
            state.applied_fetch_seq = seq;
            state.data = Some(value);
            state.status = QueryStatus::Success;
            state.error = None;
            state.stale = false;
            state.last_updated_at = Some(OffsetDateTime::now_utc());
            self.pending_notification(key, state)
        };
        Self::dispatch(notify);
        trace!(key = %key, seq, "fetch applied");
        true
    }

    /// Apply a resolution that must inspect the current value, e.g. a page
    /// append that has to extend the stored sequence. The transform runs
    /// under the write lock after the sequence guard passes; its error
    /// (typically [`CacheError::SequenceConflict`]) is recorded on the entry
    /// and propagated. Returns `Ok(false)` for discarded stale resolutions.
    pub(crate) fn apply_fetch_update<F>(
        &self,
        key: &QueryKey,
        seq: u64,
        update: F,
    ) -> Result<bool, CacheError>
    where
        F: FnOnce(Option<&CachedValue>) -> Result<CachedValue, CacheError>,
    {
        let (outcome, notify) = {
            let mut entries = write_guard(&self.entries, "apply_fetch_update");
            let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
            if seq <= state.applied_fetch_seq {
                return Ok(false);
            }
            state.applied_fetch_seq = seq;
            match update(state.data.as_ref()) {
                Ok(value) => {
                    state.data = Some(value);
                    state.status = QueryStatus::Success;
                    state.error = None;
                    state.stale = false;
                    state.last_updated_at = Some(OffsetDateTime::now_utc());
                    (Ok(true), self.pending_notification(key, state))
                }
                Err(err) => {
                    state.status = QueryStatus::Error;
                    state.error = Some(ErrorInfo::from(&err));
                    (Err(err), self.pending_notification(key, state))
                }
            }
        };
        Self::dispatch(notify);
        outcome
    }

    /// Record a failed resolution. Previous data is retained so the UI can
    /// keep showing stale content next to the error.
    pub(crate) fn apply_fetch_failure(&self, key: &QueryKey, seq: u64, err: &CacheError) -> bool {
        let notify = {
            let mut entries = write_guard(&self.entries, "apply_fetch_failure");
            let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
            if seq <= state.applied_fetch_seq {
                return false;
            }
            state.applied_fetch_seq = seq;
            state.status = QueryStatus::Error;
            state.error = Some(ErrorInfo::from(err));
            self.pending_notification(key, state)
        };
        Self::dispatch(notify);
        debug!(key = %key, seq, error = %err, "fetch failed");
        true
    }

    pub(crate) fn register_refetcher(&self, key: &QueryKey, refetcher: Refetcher) {
        let mut entries = write_guard(&self.entries, "register_refetcher");
        let state = entries.entry(key.clone()).or_insert_with(EntryState::new);
        state.refetch = Some(refetcher);
    }

    pub(crate) fn refetcher(&self, key: &QueryKey) -> Option<Refetcher> {
        read_guard(&self.entries, "refetcher")
            .get(key)
            .and_then(|state| state.refetch.clone())
    }

    /// Flag an entry stale. Returns false when the key is unknown.
    pub(crate) fn mark_stale(&self, key: &QueryKey) -> bool {
        let notify = {
            let mut entries = write_guard(&self.entries, "mark_stale");
            match entries.get_mut(key) {
                Some(state) => {
                    state.stale = true;
                    self.pending_notification(key, state)
                }
                None => return false,
            }
        };
        Self::dispatch(notify);
        true
    }

    /// Keys equal to or extending the given prefix.
    pub fn keys_matching(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        read_guard(&self.entries, "keys_matching")
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Restore a key's data to a snapshotted value. Fails when the entry was
    /// destroyed in the meantime; the caller treats that as a rollback
    /// failure.
    pub(crate) fn restore(
        &self,
        key: &QueryKey,
        data: Option<CachedValue>,
        last_updated_at: Option<OffsetDateTime>,
    ) -> Result<(), ()> {
        let notify = {
            let mut entries = write_guard(&self.entries, "restore");
            match entries.get_mut(key) {
                Some(state) => {
                    state.data = data;
                    state.last_updated_at = last_updated_at;
                    self.pending_notification(key, state)
                }
                None => return Err(()),
            }
        };
        Self::dispatch(notify);
        Ok(())
    }

    /// Drop an entry entirely. Active subscriptions become inert; the key
    /// must be re-fetched from scratch.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let existed = write_guard(&self.entries, "evict").remove(key).is_some();
        if existed {
            debug!(key = %key, "entry evicted");
        }
        existed
    }

    /// Remove entries whose last subscriber left more than `grace` ago.
    /// Entries with an unresolved fetch are skipped so the resolution still
    /// finds its sequence bookkeeping.
    pub fn sweep_detached(&self, grace: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - grace;
        let mut entries = write_guard(&self.entries, "sweep_detached");
        let before = entries.len();
        entries.retain(|_, state| {
            let expired = state.listeners.is_empty()
                && state.status != QueryStatus::Loading
                && state.detached_at.is_some_and(|at| at <= cutoff);
            !expired
        });
        let removed = before - entries.len();
        if removed > 0 {
            counter!(METRIC_GC_EVICTED_TOTAL).increment(removed as u64);
            debug!(removed, "gc sweep removed detached entries");
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        write_guard(&self.entries, "clear").clear();
    }

    /// Collect listeners + snapshot under the write lock; invocation happens
    /// after the guard drops (see [`Self::dispatch`]).
    fn pending_notification(
        &self,
        key: &QueryKey,
        state: &EntryState,
    ) -> Option<(Vec<Listener>, CacheEntry)> {
        if state.listeners.is_empty() {
            return None;
        }
        let listeners = state
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        Some((listeners, state.snapshot(key)))
    }

    fn dispatch(notify: Option<(Vec<Listener>, CacheEntry)>) {
        if let Some((listeners, snapshot)) = notify {
            for listener in listeners {
                listener(&snapshot);
            }
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII subscription guard returned by [`CacheStore::subscribe`].
pub struct Subscription {
    store: Arc<CacheStore>,
    key: QueryKey,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Explicit unsubscribe; equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.unsubscribe(&self.key, self.id);
    }
}
