//! Paged read results

use serde::{Deserialize, Serialize};

/// One page of a larger result set. Page numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page_number: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_pages: usize,
    pub has_more: bool,
}

impl<T> PagedResult<T> {
    /// Assemble a page, deriving `total_pages` and `has_more`.
    pub fn new(items: Vec<T>, page_number: usize, page_size: usize, total_count: usize) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_count.div_ceil(page_size)
        };
        Self {
            items,
            page_number,
            page_size,
            total_count,
            total_pages,
            has_more: page_number < total_pages,
        }
    }

    /// Number of rows to skip to reach `page_number`.
    pub fn offset(page_number: usize, page_size: usize) -> usize {
        page_number.saturating_sub(1).saturating_mul(page_size)
    }
}
