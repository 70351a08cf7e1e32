//! Guard policy: which allocations get guarded, and how pool heads are
//! aligned inside their guarded page span.

/// Firmware memory types an allocation can be requested as.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum MemoryType {
    ReservedMemoryType = 0,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    RuntimeServicesCode,
    RuntimeServicesData,
    ConventionalMemory,
    UnusableMemory,
    AcpiReclaimMemory,
    AcpiMemoryNvs,
    MemoryMappedIo,
    MemoryMappedIoPortSpace,
    PalCode,
    PersistentMemory,
}

impl MemoryType {
    const fn bit(self) -> u64 {
        1 << (self as u32)
    }
}

/// Set of [`MemoryType`]s, one bit per type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct MemoryTypeMask(u64);

impl MemoryTypeMask {
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn of(types: &[MemoryType]) -> Self {
        let mut bits = 0;
        for t in types {
            bits |= t.bit();
        }
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, memory_type: MemoryType) -> bool {
        self.0 & memory_type.bit() != 0
    }
}

/// How the pages of an allocation are chosen.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocateType {
    AnyPages,
    MaxAddress,
    /// Caller picked the exact address; such allocations are never guarded.
    Address,
}

/// Which guard feature a query refers to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GuardKind {
    Pool,
    Page,
}

/// Where a pool allocation sits within its guarded page span.
///
/// Tail alignment puts the usable bytes flush against the tail guard so
/// overflows fault; head alignment catches underflows instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum GuardAlignment {
    Head,
    #[default]
    Tail,
}

/// Static guard configuration, fixed at initialization.
#[derive(Debug, Clone, Default)]
pub struct HeapGuardPolicy {
    /// Guard pool allocations of the types in `pool_types`.
    pub pool_guard: bool,
    /// Guard page allocations of the types in `page_types`.
    pub page_guard: bool,
    pub pool_types: MemoryTypeMask,
    pub page_types: MemoryTypeMask,
    pub alignment: GuardAlignment,
}

impl HeapGuardPolicy {
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.pool_guard || self.page_guard
    }
}
