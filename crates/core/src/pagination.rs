//! 1-based page requests and paged results.

use serde::{Deserialize, Serialize};

/// Default number of records per page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Maximum number of records per page.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A request for one page of results. `page` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Build a request, flooring `page` and `page_size` at 1.
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Cap `page_size` at `max_page_size`.
    pub fn clamped(self, max_page_size: u32) -> Self {
        Self::new(self.page, self.page_size.min(max_page_size.max(1)))
    }

    /// Rows to skip: `(page - 1) * page_size`.
    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * i64::from(self.page_size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size.max(1))
    }
}

/// One page of results plus the total number of matches across all pages.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total_count: i64, request: PageRequest) -> Self {
        Self {
            items,
            total_count,
            page: request.page,
            page_size: request.page_size,
        }
    }

    pub fn empty(request: PageRequest) -> Self {
        Self::new(Vec::new(), 0, request)
    }

    pub fn total_pages(&self) -> i64 {
        let size = i64::from(self.page_size.max(1));
        (self.total_count + size - 1) / size
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total_count: self.total_count,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_zero_for_first_page() {
        assert_eq!(PageRequest::new(1, 20).offset(), 0);
    }

    #[test]
    fn offset_skips_previous_pages() {
        assert_eq!(PageRequest::new(3, 25).offset(), 50);
        assert_eq!(PageRequest::new(3, 25).limit(), 25);
    }

    #[test]
    fn zero_values_are_floored() {
        let request = PageRequest::new(0, 0);
        assert_eq!(request.page, 1);
        assert_eq!(request.page_size, 1);
        assert_eq!(request.offset(), 0);
    }

    #[test]
    fn clamped_respects_max() {
        assert_eq!(PageRequest::new(2, 500).clamped(MAX_PAGE_SIZE).page_size, 100);
        assert_eq!(PageRequest::new(2, 10).clamped(MAX_PAGE_SIZE).page_size, 10);
    }

    #[test]
    fn total_pages_rounds_up() {
        let page: Page<()> = Page::new(Vec::new(), 41, PageRequest::new(1, 20));
        assert_eq!(page.total_pages(), 3);
        assert_eq!(Page::<()>::empty(PageRequest::default()).total_pages(), 0);
    }
}
