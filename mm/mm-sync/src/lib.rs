//! # Synchronization primitives for the MM supervisor core
//!
//! [`SpinLock`] serializes the page-fault path across CPUs; [`ReentryFlag`]
//! keeps the guard controller from recursing into itself when applying guard
//! pages triggers further page-table allocations.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod reentry;
mod spin_lock;

pub use reentry::ReentryFlag;
pub use spin_lock::{SpinLock, SpinLockGuard};
