//! Cache configuration.

use serde::Deserialize;
use time::Duration;

// Default values for cache configuration
const DEFAULT_STALE_AFTER_MS: u64 = 30_000;
const DEFAULT_GC_GRACE_MS: u64 = 300_000;

/// Tuning knobs for a [`SyncCache`](crate::SyncCache) instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which cached data is considered stale and revalidated in
    /// the background on the next read.
    pub stale_after_ms: u64,
    /// How long an entry without subscribers survives before a GC sweep
    /// removes it.
    pub gc_grace_ms: u64,
    /// Re-fetch invalidated entries that still have subscribers. When false,
    /// invalidation only flags entries stale.
    pub refetch_on_invalidate: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            gc_grace_ms: DEFAULT_GC_GRACE_MS,
            refetch_on_invalidate: true,
        }
    }
}

impl CacheConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::milliseconds(self.stale_after_ms as i64)
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::milliseconds(self.gc_grace_ms as i64)
    }
}
