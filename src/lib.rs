//! Sincro — a client-side data synchronization cache.
//!
//! Fetches remote collections, caches them under structured keys, serves
//! paginated/infinite sequences, and applies mutations optimistically with
//! rollback on failure and refresh on settlement.
//!
//! - **[`CacheStore`]**: keyed store holding each query's last-known value,
//!   status and subscribers
//! - **[`FetchCoordinator`]**: stale-while-revalidate fetching with per-key
//!   deduplication and issue-order application
//! - **[`PaginationEngine`]**: strictly sequential infinite page sequences
//! - **[`MutationCoordinator`]**: snapshot → optimistic apply →
//!   commit/rollback, with a settlement phase that always runs
//! - **[`InvalidationBus`]**: prefix-matched stale marking and refresh
//!
//! Everything hangs off an explicitly constructed [`SyncCache`] context:
//!
//! ```
//! use sincro::{CacheConfig, QueryKey, RemoteError, SyncCache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = SyncCache::new(CacheConfig::default());
//! let key = QueryKey::root("comments").with("a1");
//!
//! cache
//!     .ensure_fresh(&key, || async { Ok::<_, RemoteError>(vec!["first!"]) })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(cache.data::<Vec<&str>>(&key), Some(vec!["first!"]));
//! # }
//! ```

mod client;
mod config;
mod entry;
mod error;
mod fetch;
mod invalidation;
mod key;
mod lock;
mod mutation;
mod page;
mod pagination;
mod source;
mod store;
mod telemetry;

pub use client::SyncCache;
pub use config::CacheConfig;
pub use entry::{CacheEntry, CachedValue, ErrorInfo, QueryStatus};
pub use error::{CacheError, RemoteError};
pub use fetch::{FetchCoordinator, FetchOutcome};
pub use invalidation::InvalidationBus;
pub use key::{QueryKey, Segment};
pub use mutation::{MutationCoordinator, MutationOptions, MutationSnapshot, OptimisticUpdate};
pub use page::{InfiniteResult, Page};
pub use pagination::{NextPageOutcome, PaginationEngine};
pub use source::{RemoteCollection, page_fetcher};
pub use store::{CacheStore, Listener, Subscription};
pub use telemetry::describe_metrics;
