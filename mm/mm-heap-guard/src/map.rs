//! Multi-level guarded-page bitmap.
//!
//! One bit per 4 KiB page of physical address space, stored in a radix tree
//! of up to five levels. The tree starts one level deep (a single leaf table
//! covering the low 128 MiB) and grows on demand: when an address beyond the
//! current coverage is recorded, a taller tree is built and the old root
//! becomes slot 0 of the new top table.
//!
//! Leaf tables hold 512 bitmap words; branch tables hold child-table
//! addresses in their `u64` slots, with 0 marking an absent subtree.

use crate::bitmap;
use core::ptr::NonNull;
use core::slice;
use mm_addresses::{PageSize, PhysicalAddress, Size4K, size_to_pages};

/// Maximum tree depth; five levels cover the full 64-bit page index space.
pub const MAP_TABLE_DEPTH: usize = 5;

/// Position of the least significant address bit indexed at each level.
const LEVEL_SHIFT: [u32; MAP_TABLE_DEPTH] = [54, 45, 36, 27, 18];

/// Index mask at each level. The top level is twice as wide so the five
/// levels together consume all address bits above the in-word index.
const LEVEL_MASK: [u64; MAP_TABLE_DEPTH] = [0x3FF, 0x1FF, 0x1FF, 0x1FF, 0x1FF];

/// Bits covered by one leaf table: 512 words of 64 pages each.
pub const MAP_UNIT_BITS: u64 = 1 << (9 + 6);

/// Bitmap storage could not be grown.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("out of guarded-page bitmap storage")]
pub struct OutOfMapMemory;

/// Source of backing pages for bitmap tables.
pub trait MapPageAllocator {
    /// Provide `pages` page-aligned 4 KiB pages.
    ///
    /// The memory must remain valid and exclusively owned by the map for the
    /// map's entire lifetime. Returns `None` when exhausted.
    fn alloc_map_pages(&mut self, pages: usize) -> Option<NonNull<u8>>;
}

/// One step of a bitmap tree walk, in ascending address order.
pub enum WalkItem {
    /// An absent subtree at branch level; pages below it are unguarded.
    Gap,
    /// A leaf word covering the 64 pages starting at `address`.
    Word { address: PhysicalAddress, word: u64 },
}

/// The guarded-page bitmap tree.
pub struct GuardedPageMap<A: MapPageAllocator> {
    /// Address of the top table, 0 while nothing has been recorded.
    root: u64,
    /// Number of levels currently materialized.
    level: usize,
    alloc: A,
}

/// Number of bits from `address`'s bit to the end of its leaf table.
const fn bits_to_unit_end(address: u64) -> u64 {
    MAP_UNIT_BITS - ((address >> Size4K::SHIFT) & (MAP_UNIT_BITS - 1))
}

/// Bit position of `address`'s page within its leaf word.
const fn bit_in_word(address: u64) -> u64 {
    (address >> Size4K::SHIFT) % bitmap::BITS_PER_WORD
}

fn alloc_table<A: MapPageAllocator>(alloc: &mut A, level: usize) -> Result<*mut u64, OutOfMapMemory> {
    let entries = (LEVEL_MASK[level] as usize) + 1;
    let pages = size_to_pages((entries * size_of::<u64>()) as u64) as usize;
    let memory = alloc.alloc_map_pages(pages).ok_or(OutOfMapMemory)?;
    let table = memory.as_ptr().cast::<u64>();
    // Safety: the allocator contract guarantees `pages` exclusively owned pages.
    unsafe {
        core::ptr::write_bytes(table, 0, entries);
    }
    Ok(table)
}

impl<A: MapPageAllocator> GuardedPageMap<A> {
    pub const fn new(alloc: A) -> Self {
        Self {
            root: 0,
            level: 1,
            alloc,
        }
    }

    /// Whether `address` lies beyond what the current tree height can index.
    const fn out_of_coverage(&self, address: u64) -> bool {
        self.level < MAP_TABLE_DEPTH
            && address >> LEVEL_SHIFT[MAP_TABLE_DEPTH - self.level - 1] != 0
    }

    /// Grow the tree until it covers `address`, re-rooting as needed.
    fn grow_for(&mut self, address: u64) -> Result<(), OutOfMapMemory> {
        while self.out_of_coverage(address) {
            if self.root != 0 {
                // The old tree becomes slot 0 of the new, taller tree.
                let level = MAP_TABLE_DEPTH - self.level - 1;
                let table = alloc_table(&mut self.alloc, level)?;
                // Safety: `table` is a fresh zeroed table from `alloc_table`.
                unsafe {
                    *table = self.root;
                }
                self.root = table as u64;
            }
            self.level += 1;
        }
        Ok(())
    }

    /// Locate the leaf word holding `address`'s bit.
    ///
    /// Returns a pointer/length pair for the words from that bit's word to
    /// the end of its leaf table, plus the number of bits to the unit end.
    /// With `allocate` set, missing tables along the path are created.
    fn find(
        &mut self,
        address: u64,
        allocate: bool,
    ) -> Result<(Option<(*mut u64, usize)>, u64), OutOfMapMemory> {
        let bits = bits_to_unit_end(address);
        if allocate {
            self.grow_for(address)?;
        } else if self.out_of_coverage(address) {
            return Ok((None, bits));
        }
        let mut slot: *mut u64 = &raw mut self.root;
        for level in (MAP_TABLE_DEPTH - self.level)..MAP_TABLE_DEPTH {
            // Safety: `slot` points either at `self.root` or into a live table
            // owned by this map; tables live as long as the map does.
            unsafe {
                if *slot == 0 {
                    if !allocate {
                        return Ok((None, bits));
                    }
                    *slot = alloc_table(&mut self.alloc, level)? as u64;
                }
                let table = *slot as *mut u64;
                let index = ((address >> LEVEL_SHIFT[level]) & LEVEL_MASK[level]) as usize;
                if level == MAP_TABLE_DEPTH - 1 {
                    let len = (LEVEL_MASK[level] as usize + 1) - index;
                    return Ok((Some((table.add(index), len)), bits));
                }
                slot = table.add(index);
            }
        }
        Ok((None, bits))
    }

    fn ensure_words(&mut self, address: u64) -> Result<(&mut [u64], u64), OutOfMapMemory> {
        match self.find(address, true)? {
            // Safety: `find` returned a span inside a live leaf table.
            (Some((ptr, len)), bits) => Ok((unsafe { slice::from_raw_parts_mut(ptr, len) }, bits)),
            (None, _) => Err(OutOfMapMemory),
        }
    }

    fn lookup_words(&mut self, address: u64) -> (Option<&[u64]>, u64) {
        match self.find(address, false) {
            // Safety: `find` returned a span inside a live leaf table.
            Ok((Some((ptr, len)), bits)) => (Some(unsafe { slice::from_raw_parts(ptr, len) }), bits),
            Ok((None, bits)) => (None, bits),
            Err(OutOfMapMemory) => (None, bits_to_unit_end(address)),
        }
    }

    /// Mark `pages` pages starting at `base` as guarded.
    pub fn set_guarded(&mut self, base: PhysicalAddress, pages: u64) -> Result<(), OutOfMapMemory> {
        let mut address = base.as_u64();
        let mut remaining = pages;
        while remaining > 0 {
            let start = bit_in_word(address);
            let (words, to_unit_end) = self.ensure_words(address)?;
            let chunk = remaining.min(to_unit_end);
            bitmap::set_bits(words, start, chunk);
            address += chunk << Size4K::SHIFT;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Mark `pages` pages starting at `base` as no longer guarded.
    pub fn clear_guarded(&mut self, base: PhysicalAddress, pages: u64) -> Result<(), OutOfMapMemory> {
        let mut address = base.as_u64();
        let mut remaining = pages;
        while remaining > 0 {
            let start = bit_in_word(address);
            let (words, to_unit_end) = self.ensure_words(address)?;
            let chunk = remaining.min(to_unit_end);
            bitmap::clear_bits(words, start, chunk);
            address += chunk << Size4K::SHIFT;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Read up to 64 page bits starting at `base`, right-aligned.
    ///
    /// Pages never recorded (absent subtrees, addresses beyond coverage)
    /// read as zero.
    pub fn get_guarded(&mut self, base: PhysicalAddress, pages: u64) -> u64 {
        debug_assert!(pages <= bitmap::BITS_PER_WORD);
        let mut address = base.as_u64();
        let mut remaining = pages;
        let mut shift = 0u64;
        let mut result = 0u64;
        while remaining > 0 {
            let start = bit_in_word(address);
            let (words, to_unit_end) = self.lookup_words(address);
            let chunk = remaining.min(to_unit_end);
            if let Some(words) = words {
                result |= bitmap::get_bits(words, start, chunk) << shift;
            }
            shift += chunk;
            address += chunk << Size4K::SHIFT;
            remaining -= chunk;
        }
        result
    }

    /// Whether the page containing `address` is guarded (allocated data
    /// bracketed by guard pages).
    pub fn is_memory_guarded(&mut self, address: PhysicalAddress) -> bool {
        self.get_guarded(address, 1) == 1
    }

    /// Whether the page containing `address` is a guard page.
    ///
    /// A guard page is itself unguarded but has a guarded neighbor on at
    /// least one side; the three-page window around `address` must read
    /// `100`, `001` or `101` (low page first).
    pub fn is_guard_page(&mut self, address: PhysicalAddress) -> bool {
        let window = match address.checked_sub(Size4K::SIZE) {
            Some(below) => self.get_guarded(below, 3),
            // Page 0 has no lower neighbor; its bit reads as zero.
            None => self.get_guarded(address, 2) << 1,
        };
        matches!(window, 0b001 | 0b100 | 0b101)
    }

    /// Visit every materialized leaf word and every absent branch subtree in
    /// ascending address order.
    pub fn for_each(&self, visit: &mut impl FnMut(WalkItem)) {
        if self.root == 0 {
            return;
        }
        walk_table(
            self.root as *const u64,
            MAP_TABLE_DEPTH - self.level,
            0,
            visit,
        );
    }

    /// Log the bitmap contents; runs of all-zero words are elided.
    pub fn dump(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        log::debug!("guarded memory bitmap (level {}):", self.level);
        let mut zero_run = 0u64;
        self.for_each(&mut |item| {
            if let WalkItem::Word { address, word } = item {
                if word == 0 {
                    zero_run += 1;
                    if zero_run == 1 {
                        log::debug!("  {address}: 0");
                    } else if zero_run == 2 {
                        log::debug!("  ...");
                    }
                } else {
                    zero_run = 0;
                    log::debug!("  {address}: {word:064b}");
                }
            }
        });
    }
}

fn walk_table(table: *const u64, level: usize, base: u64, visit: &mut impl FnMut(WalkItem)) {
    let entries = (LEVEL_MASK[level] as usize) + 1;
    for index in 0..entries {
        // Safety: `table` is a live map table of `entries` slots.
        let slot = unsafe { *table.add(index) };
        let address = base | ((index as u64) << LEVEL_SHIFT[level]);
        if level == MAP_TABLE_DEPTH - 1 {
            visit(WalkItem::Word {
                address: PhysicalAddress::new(address),
                word: slot,
            });
        } else if slot == 0 {
            visit(WalkItem::Gap);
        } else {
            walk_table(slot as *const u64, level + 1, address, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use mm_addresses::pages_to_size;

    /// Hands out leaked, zeroed, page-aligned allocations.
    struct LeakyArena {
        allocations: usize,
    }

    impl LeakyArena {
        const fn new() -> Self {
            Self { allocations: 0 }
        }
    }

    impl MapPageAllocator for LeakyArena {
        fn alloc_map_pages(&mut self, pages: usize) -> Option<NonNull<u8>> {
            self.allocations += 1;
            let layout = Layout::from_size_align(pages * 4096, 4096).unwrap();
            NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
        }
    }

    /// Never provides memory.
    struct NoMemory;

    impl MapPageAllocator for NoMemory {
        fn alloc_map_pages(&mut self, _pages: usize) -> Option<NonNull<u8>> {
            None
        }
    }

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn set_and_read_back_low_range() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        map.set_guarded(pa(0x5000), 3).unwrap();
        assert_eq!(map.get_guarded(pa(0x4000), 5), 0b01110);
        assert!(map.is_memory_guarded(pa(0x6FFF)));
        assert!(!map.is_memory_guarded(pa(0x8000)));
    }

    #[test]
    fn unrecorded_addresses_read_zero() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        assert_eq!(map.get_guarded(pa(0x1234_5000), 8), 0);
        map.set_guarded(pa(0x1000), 1).unwrap();
        // Beyond current tree coverage.
        assert_eq!(map.get_guarded(pa(1 << 40), 4), 0);
    }

    #[test]
    fn growth_preserves_earlier_bits() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        map.set_guarded(pa(0x3000), 2).unwrap();
        // Forces repeated re-rooting (needs level shift 45 coverage).
        map.set_guarded(pa(1 << 46), 1).unwrap();
        assert_eq!(map.get_guarded(pa(0x3000), 2), 0b11);
        assert_eq!(map.get_guarded(pa(1 << 46), 1), 1);
    }

    #[test]
    fn range_crossing_leaf_unit_boundary() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        // One leaf unit covers 32768 pages (128 MiB); start just below the
        // boundary so the range spans two leaf tables.
        let base = pages_to_size(MAP_UNIT_BITS - 2);
        map.set_guarded(pa(base), 4).unwrap();
        assert_eq!(map.get_guarded(pa(base), 4), 0b1111);
        assert_eq!(map.get_guarded(pa(base - 0x1000), 6), 0b011110);
        map.clear_guarded(pa(base), 4).unwrap();
        assert_eq!(map.get_guarded(pa(base - 0x1000), 6), 0);
    }

    #[test]
    fn set_is_idempotent() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        map.set_guarded(pa(0x10_0000), 16).unwrap();
        map.set_guarded(pa(0x10_0000), 16).unwrap();
        assert_eq!(map.get_guarded(pa(0x10_0000), 16), 0xFFFF);
        map.clear_guarded(pa(0x10_0000), 16).unwrap();
        assert_eq!(map.get_guarded(pa(0x10_0000), 16), 0);
    }

    #[test]
    fn guard_page_window_patterns() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        // Guarded range at pages 16..=19; pages 15 and 20 are guard pages.
        map.set_guarded(pa(16 * 0x1000), 4).unwrap();
        assert!(map.is_guard_page(pa(15 * 0x1000))); // 001
        assert!(map.is_guard_page(pa(20 * 0x1000))); // 100
        assert!(!map.is_guard_page(pa(17 * 0x1000))); // data page
        assert!(!map.is_guard_page(pa(13 * 0x1000))); // free page

        // Shared guard: ranges on both sides of page 24.
        map.set_guarded(pa(21 * 0x1000), 3).unwrap();
        map.set_guarded(pa(25 * 0x1000), 2).unwrap();
        assert!(map.is_guard_page(pa(24 * 0x1000))); // 101
    }

    #[test]
    fn guard_window_truth_table() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        // Windows spaced eight pages apart so the patterns stay isolated.
        for pattern in 0u64..8 {
            let center = (100 + 8 * pattern) * 0x1000;
            for bit in 0..3u64 {
                if pattern & (1 << bit) != 0 {
                    map.set_guarded(pa(center - 0x1000 + bit * 0x1000), 1).unwrap();
                }
            }
            let expected = matches!(pattern, 0b001 | 0b100 | 0b101);
            assert_eq!(
                map.is_guard_page(pa(center)),
                expected,
                "window pattern {pattern:03b}"
            );
        }
    }

    #[test]
    fn guard_page_at_address_zero() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        assert!(!map.is_guard_page(pa(0)));
        map.set_guarded(pa(0x1000), 1).unwrap();
        assert!(map.is_guard_page(pa(0)));
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut map = GuardedPageMap::new(NoMemory);
        assert_eq!(map.set_guarded(pa(0x1000), 1), Err(OutOfMapMemory));
        // Reads still work and see nothing.
        assert_eq!(map.get_guarded(pa(0x1000), 1), 0);
    }

    #[test]
    fn walk_reports_words_in_order() {
        let mut map = GuardedPageMap::new(LeakyArena::new());
        map.set_guarded(pa(0x1000), 1).unwrap();
        map.set_guarded(pa(1 << 30), 2).unwrap();
        let mut words = Vec::new();
        map.for_each(&mut |item| {
            if let WalkItem::Word { address, word } = item {
                if word != 0 {
                    words.push((address.as_u64(), word));
                }
            }
        });
        assert_eq!(words, vec![(0, 0b10), (1 << 30, 0b11)]);
    }
}
