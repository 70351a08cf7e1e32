//! Page attribute surface.
//!
//! Guard pages are made inaccessible by setting a read-protect attribute on
//! them; the platform's paging code owns the actual page tables and exposes
//! them through [`MemoryAttributes`].

use mm_addresses::PhysicalAddress;

bitflags::bitflags! {
    /// Protection attributes for a physical range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryAttribute: u64 {
        /// All accesses fault.
        const READ_PROTECT = 1 << 0;
        /// Writes fault.
        const READ_ONLY = 1 << 1;
        /// Instruction fetches fault.
        const EXECUTE_PROTECT = 1 << 2;
        /// Only supervisor code may touch the range.
        const SUPERVISOR = 1 << 3;
    }
}

/// Attribute update failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute update not supported for this range")]
    Unsupported,
    #[error("invalid address range")]
    InvalidRange,
}

/// Platform hook for reading and updating page protection attributes.
pub trait MemoryAttributes {
    /// Attributes common to all pages of `[base, base + length)`.
    fn get_attributes(
        &mut self,
        base: PhysicalAddress,
        length: u64,
    ) -> Result<MemoryAttribute, AttributeError>;

    /// Add `attributes` to every page of the range.
    fn set_attributes(
        &mut self,
        base: PhysicalAddress,
        length: u64,
        attributes: MemoryAttribute,
    ) -> Result<(), AttributeError>;

    /// Remove `attributes` from every page of the range.
    fn clear_attributes(
        &mut self,
        base: PhysicalAddress,
        length: u64,
        attributes: MemoryAttribute,
    ) -> Result<(), AttributeError>;
}
