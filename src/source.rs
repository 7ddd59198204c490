//! Remote source seam.
//!
//! The engine itself consumes plain async closures; this trait is the
//! per-entity seam for callers that prefer wiring a source object once and
//! deriving the closures from it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::RemoteError;
use crate::key::QueryKey;
use crate::page::Page;

/// A paginated remote collection, e.g. the comments of one announcement.
#[async_trait]
pub trait RemoteCollection: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    /// Fetch one page of the collection identified by `key`.
    async fn fetch_page(&self, key: &QueryKey, page: u32) -> Result<Page<Self::Item>, RemoteError>;
}

/// Adapt a source into the page-fetch closure the pagination engine takes.
pub fn page_fetcher<S: RemoteCollection>(
    source: Arc<S>,
    key: QueryKey,
) -> impl Fn(u32) -> BoxFuture<'static, Result<Page<S::Item>, RemoteError>> + Send + Sync + Clone + 'static
{
    move |page| {
        let source = Arc::clone(&source);
        let key = key.clone();
        async move { source.fetch_page(&key, page).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    #[async_trait]
    impl RemoteCollection for FixedSource {
        type Item = u32;

        async fn fetch_page(
            &self,
            _key: &QueryKey,
            page: u32,
        ) -> Result<Page<Self::Item>, RemoteError> {
            Ok(Page {
                items: vec![page * 10, page * 10 + 1],
                current_page: page,
                page_size: 2,
                total_count: 4,
                has_next_page: page < 2,
                next_page: (page < 2).then_some(page + 1),
                prev_page: (page > 1).then(|| page - 1),
            })
        }
    }

    #[tokio::test]
    async fn adapter_produces_reusable_fetchers() {
        let fetch = page_fetcher(Arc::new(FixedSource), QueryKey::root("comments"));

        let first = fetch(1).await.expect("page 1");
        assert_eq!(first.items, vec![10, 11]);

        let second = fetch(2).await.expect("page 2");
        assert_eq!(second.items, vec![20, 21]);
        assert!(!second.has_next_page);
    }
}
