//! Cache entry model.
//!
//! [`CacheEntry`] is the read snapshot handed to subscribers; the store keeps
//! the authoritative state. Cached data is type-erased behind
//! [`CachedValue`]: values are immutable and only ever replaced whole, so a
//! cheap clone of the handle is a deep-enough snapshot for rollback.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::error::{CacheError, RemoteError};
use crate::key::QueryKey;

/// Immutable, type-erased cached data.
#[derive(Clone)]
pub struct CachedValue(Arc<dyn Any + Send + Sync>);

impl CachedValue {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Typed view of the stored value. `None` when the key holds a different
    /// type than the caller expects.
    pub fn downcast_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Cloned typed read, for callers that need ownership.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CachedValue")
    }
}

/// Fetch lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Error recorded on an entry after a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// HTTP-ish status when the server answered, `None` for transport failures.
    pub status: Option<u16>,
    pub message: String,
}

impl From<&RemoteError> for ErrorInfo {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::Network(message) => Self {
                status: None,
                message: message.clone(),
            },
            RemoteError::Server { status, message } => Self {
                status: Some(*status),
                message: message.clone(),
            },
        }
    }
}

impl From<&CacheError> for ErrorInfo {
    fn from(err: &CacheError) -> Self {
        match err {
            CacheError::Remote(remote) => Self::from(remote),
            other => Self {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

/// Point-in-time snapshot of one cached resource.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<CachedValue>,
    pub status: QueryStatus,
    pub error: Option<ErrorInfo>,
    pub last_updated_at: Option<OffsetDateTime>,
    pub subscriber_count: usize,
    /// Set by invalidation; cleared by the next applied fetch.
    pub stale: bool,
}

impl CacheEntry {
    /// Typed read of the entry's data.
    pub fn data_as<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.data.as_ref().and_then(CachedValue::get::<T>)
    }

    /// True when the entry holds data recent enough to skip the network.
    /// Invalidation overrides recency: a stale-flagged entry is never fresh.
    pub fn is_fresh(&self, stale_after: Duration, now: OffsetDateTime) -> bool {
        if self.stale || self.data.is_none() {
            return false;
        }
        match self.last_updated_at {
            Some(updated) => now - updated < stale_after,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(data: Option<CachedValue>, updated: Option<OffsetDateTime>) -> CacheEntry {
        CacheEntry {
            key: QueryKey::root("comments"),
            data,
            status: QueryStatus::Success,
            error: None,
            last_updated_at: updated,
            subscriber_count: 1,
            stale: false,
        }
    }

    #[test]
    fn cached_value_round_trips_through_downcast() {
        let value = CachedValue::new(vec![1u32, 2, 3]);
        assert_eq!(value.get::<Vec<u32>>(), Some(vec![1, 2, 3]));
        assert!(value.downcast_ref::<String>().is_none());
    }

    #[test]
    fn error_info_from_remote_error() {
        let info = ErrorInfo::from(&RemoteError::server(404, "missing"));
        assert_eq!(info.status, Some(404));
        assert_eq!(info.message, "missing");

        let info = ErrorInfo::from(&RemoteError::network("refused"));
        assert_eq!(info.status, None);
    }

    #[test]
    fn freshness_respects_stale_time() {
        let now = OffsetDateTime::now_utc();
        let entry = entry_with(Some(CachedValue::new(1u8)), Some(now - Duration::seconds(10)));

        assert!(entry.is_fresh(Duration::seconds(30), now));
        assert!(!entry.is_fresh(Duration::seconds(5), now));
    }

    #[test]
    fn stale_flag_overrides_recency() {
        let now = OffsetDateTime::now_utc();
        let mut entry = entry_with(Some(CachedValue::new(1u8)), Some(now));
        entry.stale = true;
        assert!(!entry.is_fresh(Duration::seconds(30), now));
    }

    #[test]
    fn entries_without_data_are_never_fresh() {
        let now = OffsetDateTime::now_utc();
        let entry = entry_with(None, Some(now));
        assert!(!entry.is_fresh(Duration::seconds(30), now));
    }
}
