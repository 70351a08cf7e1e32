//! # Heap Guard
//!
//! Guarded-memory tracking for the MM supervisor heap. Allocations of
//! selected memory types are bracketed by unmapped guard pages so that
//! overflows and underflows fault immediately instead of corrupting
//! neighboring allocations.
//!
//! The crate is built from four layers:
//!
//! - [`bitmap`]: raw bit-span operations on `u64` words.
//! - [`map`]: a lazily grown multi-level bitmap recording which pages are
//!   guarded (one bit per 4 KiB page of physical address space).
//! - [`guard`]: the [`HeapGuard`](guard::HeapGuard) controller that applies
//!   and removes guard pages through a platform attribute surface.
//! - [`adjust`]: the allocation adjustment layer translating guarded
//!   allocations and frees into operations on the visible free list.
//!
//! Guard pages are shared between adjacent allocations whenever the layout
//! allows, so freeing one allocation must never tear down a guard page its
//! neighbor still relies on; the controller consults two-bit windows of the
//! bitmap around each boundary to decide.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod adjust;
pub mod attributes;
pub mod bitmap;
pub mod guard;
pub mod map;
pub mod policy;
#[cfg(test)]
mod testing;

pub use adjust::{FreeBlock, FreeBlockList, FreeError, PageAllocator};
pub use attributes::{AttributeError, MemoryAttribute, MemoryAttributes};
pub use guard::{GuardError, HeapGuard};
pub use map::{GuardedPageMap, MapPageAllocator, OutOfMapMemory};
pub use policy::{AllocateType, GuardAlignment, GuardKind, HeapGuardPolicy, MemoryType, MemoryTypeMask};
