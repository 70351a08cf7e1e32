//! Allocation adjustment layer.
//!
//! Guarded allocations occupy more pages than the caller asked for: up to
//! one guard page on each side, fewer when a neighbor already provides one.
//! This layer widens allocations against a visible free list, hides the
//! extra pages from the caller, and on free splits the range back into data
//! and guard segments for the owning allocator.

use crate::attributes::{MemoryAttribute, MemoryAttributes};
use crate::guard::HeapGuard;
use crate::map::MapPageAllocator;
use crate::policy::GuardAlignment;
use alloc::vec::Vec;
use mm_addresses::{PageSize, PhysicalAddress, Size4K, align_down, align_up, pages_to_size};

/// Free failure reported by the backing allocator or the validation here.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FreeError {
    #[error("invalid free parameters")]
    InvalidParameter,
    #[error("range is not an allocated block")]
    NotFound,
    #[error("guard page removal failed")]
    GuardRemoval,
}

/// Owning page allocator that takes back freed ranges.
pub trait PageAllocator {
    /// Return `[base, base + pages)` to the allocator. `is_guard` marks
    /// ranges that served as guard pages and were invisible to the caller.
    fn free_pages(
        &mut self,
        base: PhysicalAddress,
        pages: u64,
        is_guard: bool,
    ) -> Result<(), FreeError>;
}

/// A run of free pages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreeBlock {
    pub base: PhysicalAddress,
    pub pages: u64,
}

impl FreeBlock {
    const fn first_page(&self) -> u64 {
        self.base.page_index()
    }

    const fn end_page(&self) -> u64 {
        self.base.page_index() + self.pages
    }
}

/// Free blocks kept sorted by address so neighbors coalesce on insert.
#[derive(Debug, Default)]
pub struct FreeBlockList {
    blocks: Vec<FreeBlock>,
}

impl FreeBlockList {
    #[must_use]
    pub const fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    #[must_use]
    pub fn blocks(&self) -> &[FreeBlock] {
        &self.blocks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Insert a free run, merging it with adjacent runs.
    pub fn insert(&mut self, base: PhysicalAddress, pages: u64) {
        if pages == 0 {
            return;
        }
        let position = self
            .blocks
            .partition_point(|b| b.base.as_u64() < base.as_u64());
        self.blocks.insert(position, FreeBlock { base, pages });
        // Coalesce with the upper neighbor first so indices stay valid.
        if position + 1 < self.blocks.len()
            && self.blocks[position].end_page() == self.blocks[position + 1].first_page()
        {
            self.blocks[position].pages += self.blocks[position + 1].pages;
            self.blocks.remove(position + 1);
        }
        if position > 0 && self.blocks[position - 1].end_page() == self.blocks[position].first_page()
        {
            self.blocks[position - 1].pages += self.blocks[position].pages;
            self.blocks.remove(position);
        }
    }

    /// Remove `[start_page, start_page + count)` from the block at `index`,
    /// leaving up to two remainder blocks.
    fn carve(&mut self, index: usize, start_page: u64, count: u64) {
        let block = self.blocks[index];
        debug_assert!(start_page >= block.first_page() && start_page + count <= block.end_page());
        let head = start_page - block.first_page();
        let tail = block.end_page() - (start_page + count);
        match (head, tail) {
            (0, 0) => {
                self.blocks.remove(index);
            }
            (0, _) => {
                self.blocks[index].base = PhysicalAddress::new(pages_to_size(start_page + count));
                self.blocks[index].pages = tail;
            }
            (_, 0) => {
                self.blocks[index].pages = head;
            }
            (_, _) => {
                self.blocks[index].pages = head;
                self.blocks.insert(
                    index + 1,
                    FreeBlock {
                        base: PhysicalAddress::new(pages_to_size(start_page + count)),
                        pages: tail,
                    },
                );
            }
        }
    }
}

/// Allocate `pages` guarded pages from the free list, highest address first.
///
/// The chosen block is widened by up to two pages for the guards; a guard
/// page already established by a neighbor is reused instead. The returned
/// address points at the usable range, with the guard pages hidden.
///
/// A guard bookkeeping failure does not fail the allocation; the range is
/// returned unguarded.
pub fn alloc_pages_with_guard<A: MapPageAllocator>(
    guard: &mut HeapGuard<A>,
    attrs: &mut impl MemoryAttributes,
    free_list: &mut FreeBlockList,
    pages: u64,
    max_address: PhysicalAddress,
) -> Option<PhysicalAddress> {
    if pages == 0 {
        return None;
    }
    for index in (0..free_list.blocks.len()).rev() {
        let block = free_list.blocks[index];
        if block.pages < pages
            || block.base.as_u64() + pages_to_size(pages) - 1 > max_address.as_u64()
        {
            continue;
        }

        let mut needed = pages;
        let block_end = block.base + pages_to_size(block.pages);
        let tail_shared = guard.is_guard_page(block_end);
        if !tail_shared {
            needed += 1;
        }
        let head_shared = match block_end.checked_sub(pages_to_size(needed) + Size4K::SIZE) {
            Some(head) => guard.is_guard_page(head),
            None => false,
        };
        if !head_shared {
            needed += 1;
        }
        if block.pages < needed {
            continue;
        }

        // Carve from the top of the block, clamped to the address limit.
        let limit_page = (max_address.as_u64() >> Size4K::SHIFT) + 1;
        let top = block.end_page().min(limit_page);
        if top < block.first_page() + needed {
            continue;
        }
        let start_page = top - needed;
        free_list.carve(index, start_page, needed);

        let mut address = PhysicalAddress::new(pages_to_size(start_page));
        if !head_shared {
            // The lowest carved page becomes the hidden head guard.
            address += Size4K::SIZE;
        }
        if let Err(e) = guard.set_guard_for_memory(attrs, address, pages) {
            log::warn!("allocation at {address} left unguarded: {e}");
        }
        return Some(address);
    }
    None
}

/// Widen a caller-visible free range to cover the guard pages that go away
/// with it.
///
/// Exclusive boundary guards join the range; a boundary shared with a live
/// neighbor shrinks it instead, leaving that page as the neighbor's guard.
/// Returns the adjusted base and page count.
pub fn adjust_memory_free<A: MapPageAllocator>(
    guard: &mut HeapGuard<A>,
    attrs: &mut impl MemoryAttributes,
    base: PhysicalAddress,
    pages: u64,
) -> (PhysicalAddress, u64) {
    if base.is_null() || pages == 0 {
        return (base, pages);
    }
    let mut start = base.as_u64();
    let mut count = pages;

    if guard.paging_active() {
        // A read-only marking must not survive into the free pool.
        if let Ok(attributes) = attrs.get_attributes(base, pages_to_size(pages)) {
            if attributes.contains(MemoryAttribute::READ_ONLY) {
                let _ = attrs.clear_attributes(base, pages_to_size(pages), MemoryAttribute::READ_ONLY);
            }
        }
    }

    // Head boundary: bit 1 is the page right below the range.
    let window = guard.window_below(base);
    if window & 0b10 == 0 {
        if window & 0b01 == 0 {
            start -= Size4K::SIZE;
            count += 1;
        }
    } else {
        start += Size4K::SIZE;
        count -= 1;
    }

    // Tail boundary of the adjusted range: bit 0 is the page right above it.
    let window = guard.guarded_bits(PhysicalAddress::new(start + pages_to_size(count)), 2);
    if window & 0b01 == 0 {
        if window & 0b10 == 0 {
            count += 1;
        }
    } else if count > 0 {
        count -= 1;
    }

    (PhysicalAddress::new(start), count)
}

/// Free a guarded allocation.
///
/// The range is widened per [`adjust_memory_free`], the guards are removed,
/// and the result goes back to `backend` in up to three segments: freed head
/// guard, caller-visible data, freed tail guard.
pub fn free_pages_with_guard<A: MapPageAllocator>(
    guard: &mut HeapGuard<A>,
    attrs: &mut impl MemoryAttributes,
    backend: &mut impl PageAllocator,
    base: PhysicalAddress,
    pages: u64,
) -> Result<(), FreeError> {
    if base.is_null() || pages == 0 || !base.is_aligned_to(Size4K::SIZE) {
        return Err(FreeError::InvalidParameter);
    }

    let (mut free_base, mut free_pages) = adjust_memory_free(guard, attrs, base, pages);
    if guard.unset_guard_for_memory(attrs, base, pages).is_err() {
        debug_assert!(false, "guard removal failed for {base}");
        return Err(FreeError::GuardRemoval);
    }
    if free_pages == 0 {
        return Ok(());
    }

    if base.as_u64() > free_base.as_u64() {
        // Freed head guard segment.
        let head = (base.as_u64() - free_base.as_u64()) >> Size4K::SHIFT;
        backend.free_pages(free_base, head, true)?;
        free_base = base;
        free_pages -= head;
    }

    let end = base.as_u64() + pages_to_size(pages);
    if end <= free_base.as_u64() + pages_to_size(free_pages) {
        // Caller-visible data segment.
        let data = (end - free_base.as_u64()) >> Size4K::SHIFT;
        if data > 0 {
            backend.free_pages(free_base, data, false)?;
        }
        free_base = PhysicalAddress::new(end);
        free_pages -= data;
    }

    if free_pages > 0 {
        // Freed tail guard segment.
        backend.free_pages(free_base, free_pages, true)?;
    }
    Ok(())
}

/// Place a pool head inside its guarded page span.
///
/// With tail alignment the usable bytes are pushed against the tail guard
/// (sizes rounded up to 8 bytes); head alignment leaves the head untouched.
#[must_use]
pub fn adjust_pool_head_alloc(
    alignment: GuardAlignment,
    base: PhysicalAddress,
    pages: u64,
    size: u64,
) -> PhysicalAddress {
    if base.is_null() || alignment == GuardAlignment::Head {
        return base;
    }
    base + pages_to_size(pages) - align_up(size, 8)
}

/// Recover the page base of a pool head placed by [`adjust_pool_head_alloc`].
#[must_use]
pub fn adjust_pool_head_free(alignment: GuardAlignment, address: PhysicalAddress) -> PhysicalAddress {
    if address.is_null() || alignment == GuardAlignment::Head {
        return address;
    }
    PhysicalAddress::new(align_down(address.as_u64(), Size4K::SIZE))
}
