//! # On-Demand Page Table Management
//!
//! Hierarchical x86-64 page tables built lazily from a fixed pool of table
//! pages. Page faults outside the protected region are serviced by mapping
//! the faulting address on demand; when the pool runs dry, the least
//! recently used page-table subtree is reclaimed and its pages recycled.
//!
//! - [`entry`]: the 64-bit table entry with the bookkeeping bits
//!   (access record, child count, permanent pin) folded into the
//!   software-available positions.
//! - [`pool`]: the bounded LIFO pool of 4 KiB table pages.
//! - [`walker`]: [`OnDemandPaging`](walker::OnDemandPaging), the fault
//!   servicing walk that materializes missing tables.
//! - [`reclaim`]: age-based victim selection and subtree release.
//! - [`fault`]: the page-fault monitor that separates serviceable faults
//!   from violations, and the dispatch path that never returns for the
//!   latter.
//!
//! Table pages are reached through a [`TableMapper`], the only place that
//! turns a physical page into a reference.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod entry;
pub mod fault;
pub mod pool;
pub mod reclaim;
pub mod walker;

pub use entry::{PageEntry, PageTable};
pub use fault::{
    CommBufferPolicy, FaultContext, FaultMonitor, FaultOutcome, FaultReporter, PageFaultError,
    ProtectedRegion, RejectReason, StackGuardWindows, SystemControl, Verdict, handle_fault,
    reject_and_halt,
};
pub use pool::{PAGE_TABLE_POOL_PAGES, PagePool};
pub use walker::{
    DefaultSizePolicy, FaultPlan, MapGranularity, OnDemandPaging, PageSizePolicy, PagingConfig,
    ServiceError,
};

use mm_addresses::{PhysicalPage, Size4K};

/// Access to page-table pages by physical page.
pub trait TableMapper {
    /// View `page` as a page table.
    ///
    /// # Safety
    /// `page` must be a live table page owned by the calling address space
    /// and not concurrently aliased. The returned reference is valid for as
    /// long as the page stays allocated; the caller bounds its actual use.
    unsafe fn table_mut<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut PageTable;
}
