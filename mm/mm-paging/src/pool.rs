//! Bounded pool of page-table pages.
//!
//! The pool is seeded once at initialization and only ever refilled by the
//! reclaimer; running dry is the signal to reclaim, not to allocate.

use mm_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Pages set aside for tables when paging is initialized.
pub const PAGE_TABLE_POOL_PAGES: usize = 8;

/// Fixed-capacity LIFO pool of 4 KiB table pages.
pub struct PagePool {
    pages: [PhysicalPage<Size4K>; Self::CAPACITY],
    len: usize,
}

impl PagePool {
    pub const CAPACITY: usize = 64;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: [PhysicalPage::from_addr(PhysicalAddress::zero()); Self::CAPACITY],
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a page to the pool. A full pool drops the page; that only
    /// happens if more pages are pushed than were ever seeded.
    pub fn push(&mut self, page: PhysicalPage<Size4K>) {
        debug_assert!(self.len < Self::CAPACITY, "page pool overflow");
        if self.len < Self::CAPACITY {
            self.pages[self.len] = page;
            self.len += 1;
        }
    }

    pub fn pop(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.pages[self.len])
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}
