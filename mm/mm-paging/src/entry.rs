//! Page-table entries and tables.
//!
//! The hardware-defined bits follow the Intel SDM layout; the ignored
//! positions carry this crate's bookkeeping: bits 9..=11 hold the access
//! record used for reclamation aging, bits 52..=60 count the children
//! installed on demand below a non-leaf entry, and bit 62 pins entries the
//! reclaimer must never touch.

use bitfield_struct::bitfield;
use mm_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};

/// Freshest access-record value.
pub(crate) const ACC_MAX: u8 = 7;

/// Score bias reported for entries whose hardware accessed bit was set.
pub(crate) const ACC_BIAS: u64 = 8;

/// A 64-bit page-table entry, any level.
#[bitfield(u64)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Leaf at PDPT/PD level (1 GiB / 2 MiB mapping).
    pub page_size: bool,
    pub global: bool,
    /// Age counter for reclamation; 7 is freshest, 0 coldest.
    #[bits(3)]
    pub access_record: u8,
    #[bits(40)]
    page_frame: u64,
    /// Children installed on demand below this entry, modulo 512.
    #[bits(9)]
    pub sub_entries: u16,
    #[bits(1)]
    __: u8,
    /// Pinned at initialization; never reclaimed.
    pub permanent: bool,
    pub no_execute: bool,
}

impl PageEntry {
    /// Physical base address stored in this entry.
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.page_frame() << Size4K::SHIFT)
    }

    pub fn set_physical_address(&mut self, address: PhysicalAddress) {
        debug_assert!(address.is_aligned_to(Size4K::SIZE));
        self.set_page_frame(address.as_u64() >> Size4K::SHIFT);
    }

    /// The child table this non-leaf entry points at.
    #[must_use]
    pub const fn table_page(self) -> PhysicalPage<Size4K> {
        self.physical_address().page::<Size4K>()
    }

    /// A present, writable non-leaf entry pointing at `page`.
    #[must_use]
    pub fn make_table(page: PhysicalPage<Size4K>) -> Self {
        let mut entry = Self::new().with_present(true).with_writable(true);
        entry.set_physical_address(page.base());
        entry
    }

    pub fn bump_sub_entries(&mut self) {
        self.set_sub_entries(self.sub_entries().wrapping_add(1) & 0x1FF);
    }

    pub fn drop_sub_entries(&mut self) {
        self.set_sub_entries(self.sub_entries().wrapping_sub(1) & 0x1FF);
    }
}

/// One page of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; Self::ENTRY_COUNT],
}

impl PageTable {
    pub const ENTRY_COUNT: usize = 512;

    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::new(); Self::ENTRY_COUNT],
        }
    }

    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    pub const fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    pub fn zero(&mut self) {
        self.entries = [PageEntry::new(); Self::ENTRY_COUNT];
    }

    /// Index of the first present entry, if any.
    #[must_use]
    pub fn first_present(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.present())
    }
}
