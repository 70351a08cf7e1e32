//! Shared test doubles.

use crate::attributes::{AttributeError, MemoryAttribute, MemoryAttributes};
use crate::map::MapPageAllocator;
use core::ptr::NonNull;
use mm_addresses::PhysicalAddress;
use std::alloc::Layout;
use std::collections::BTreeMap;

pub(crate) const PAGE: u64 = 4096;

/// Hands out leaked, zeroed, page-aligned allocations for bitmap tables.
pub(crate) struct LeakyArena {
    pub(crate) allocations: usize,
}

impl LeakyArena {
    pub(crate) const fn new() -> Self {
        Self { allocations: 0 }
    }
}

impl MapPageAllocator for LeakyArena {
    fn alloc_map_pages(&mut self, pages: usize) -> Option<NonNull<u8>> {
        self.allocations += 1;
        let layout = Layout::from_size_align(pages * PAGE as usize, PAGE as usize).unwrap();
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }
}

/// Records per-page attributes and the order in which pages gained
/// read protection. Already-protected pages are not logged again.
#[derive(Default)]
pub(crate) struct AttrRecorder {
    pages: BTreeMap<u64, MemoryAttribute>,
    newly_protected: Vec<u64>,
}

impl AttrRecorder {
    pub(crate) fn is_read_protected(&self, base: PhysicalAddress) -> bool {
        self.has(base, MemoryAttribute::READ_PROTECT)
    }

    pub(crate) fn has(&self, base: PhysicalAddress, attr: MemoryAttribute) -> bool {
        self.pages
            .get(&(base.as_u64() / PAGE))
            .is_some_and(|a| a.contains(attr))
    }

    pub(crate) fn protected_log(&self) -> Vec<u64> {
        self.newly_protected.iter().map(|p| p * PAGE).collect()
    }

    pub(crate) fn reset_log(&mut self) {
        self.newly_protected.clear();
    }
}

impl MemoryAttributes for AttrRecorder {
    fn get_attributes(
        &mut self,
        base: PhysicalAddress,
        length: u64,
    ) -> Result<MemoryAttribute, AttributeError> {
        let first = base.as_u64() / PAGE;
        let count = length.div_ceil(PAGE).max(1);
        let mut common = MemoryAttribute::all();
        for page in first..first + count {
            common &= self.pages.get(&page).copied().unwrap_or_default();
        }
        Ok(common)
    }

    fn set_attributes(
        &mut self,
        base: PhysicalAddress,
        length: u64,
        attributes: MemoryAttribute,
    ) -> Result<(), AttributeError> {
        let first = base.as_u64() / PAGE;
        let count = length.div_ceil(PAGE).max(1);
        for page in first..first + count {
            let entry = self.pages.entry(page).or_default();
            if attributes.contains(MemoryAttribute::READ_PROTECT)
                && !entry.contains(MemoryAttribute::READ_PROTECT)
            {
                self.newly_protected.push(page);
            }
            *entry |= attributes;
        }
        Ok(())
    }

    fn clear_attributes(
        &mut self,
        base: PhysicalAddress,
        length: u64,
        attributes: MemoryAttribute,
    ) -> Result<(), AttributeError> {
        let first = base.as_u64() / PAGE;
        let count = length.div_ceil(PAGE).max(1);
        for page in first..first + count {
            if let Some(entry) = self.pages.get_mut(&page) {
                *entry &= !attributes;
            }
        }
        Ok(())
    }
}
