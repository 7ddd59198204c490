//! Page and infinite-sequence models.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// One slice of a remote collection, as the server returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Server order, unique by item id within the page.
    pub items: Vec<T>,
    pub current_page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub has_next_page: bool,
    pub next_page: Option<u32>,
    pub prev_page: Option<u32>,
}

impl<T> Page<T> {
    /// Check the structural invariants: a page never overflows its declared
    /// size, and `has_next_page` agrees with `next_page`.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.items.len() > self.page_size as usize {
            return Err(CacheError::validation(format!(
                "page {} holds {} items but declares page_size {}",
                self.current_page,
                self.items.len(),
                self.page_size
            )));
        }
        if self.has_next_page != self.next_page.is_some() {
            return Err(CacheError::validation(format!(
                "page {}: has_next_page={} disagrees with next_page={:?}",
                self.current_page, self.has_next_page, self.next_page
            )));
        }
        Ok(())
    }

    /// Page-param policy: the sequence continues at `current_page + 1` until
    /// the server reports no further page.
    pub fn next_page_param(&self) -> Option<u32> {
        self.has_next_page.then_some(self.current_page + 1)
    }
}

/// Ordered pages of one infinite sequence, page 1 first.
///
/// Appends are strictly sequential: a page is only accepted when it extends
/// the stored sequence by exactly one, so an out-of-order network response
/// can never be spliced in silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfiniteResult<T> {
    pages: Vec<Page<T>>,
}

impl<T> InfiniteResult<T> {
    /// Start (or restart) the sequence from page 1.
    pub fn first(page: Page<T>) -> Result<Self, CacheError> {
        page.validate()?;
        if page.current_page != 1 {
            return Err(CacheError::SequenceConflict {
                expected: 1,
                got: page.current_page,
            });
        }
        Ok(Self { pages: vec![page] })
    }

    /// Append the next page, failing with [`CacheError::SequenceConflict`]
    /// when it does not continue the stored sequence.
    pub fn try_append(&mut self, page: Page<T>) -> Result<(), CacheError> {
        page.validate()?;
        let expected = self.last_page().current_page + 1;
        if page.current_page != expected {
            return Err(CacheError::SequenceConflict {
                expected,
                got: page.current_page,
            });
        }
        self.pages.push(page);
        Ok(())
    }

    pub fn pages(&self) -> &[Page<T>] {
        &self.pages
    }

    /// The most recently appended page. The sequence is never empty.
    pub fn last_page(&self) -> &Page<T> {
        self.pages.last().expect("infinite result holds at least page 1")
    }

    pub fn has_next_page(&self) -> bool {
        self.last_page().has_next_page
    }

    pub fn next_page_param(&self) -> Option<u32> {
        self.last_page().next_page_param()
    }

    /// All items in fetch order, page 1 first.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    pub fn item_count(&self) -> usize {
        self.pages.iter().map(|page| page.items.len()).sum()
    }
}
