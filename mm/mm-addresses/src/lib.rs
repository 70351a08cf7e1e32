//! # Memory Address Types for the MM Supervisor Core
//!
//! Strongly typed wrappers for the raw addresses handled by the heap-guard
//! and page-table code. Virtual and physical addresses cannot be mixed at
//! compile time while both remain zero-cost wrappers around `u64`.
//!
//! Three standard x86-64 page sizes are supported via marker types that
//! implement [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages (base granularity)
//! - [`Size2M`]: 2 MiB huge pages
//! - [`Size1G`]: 1 GiB giant pages
//!
//! [`PhysicalPage<S>`] carries a page-aligned physical base address; it is
//! what the page-table pool hands out and what table entries store.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod page_size;
mod physical;
mod virt;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical::{PhysicalAddress, PhysicalPage};
pub use virt::VirtualAddress;

/// Number of 4 KiB pages needed to hold `bytes` bytes (rounds up).
#[inline]
#[must_use]
pub const fn size_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(Size4K::SIZE)
}

/// Number of bytes covered by `pages` 4 KiB pages.
#[inline]
#[must_use]
pub const fn pages_to_size(pages: u64) -> u64 {
    pages << Size4K::SHIFT
}

/// Align `value` upwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

/// Align `value` downwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}
