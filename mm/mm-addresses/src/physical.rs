use crate::page_size::{PageSize, Size4K};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address.
///
/// Page-table entries store a page-aligned physical base plus per-entry flag
/// bits; use [`PhysicalAddress::page`] to derive the base for a concrete
/// [`PageSize`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The page for size `S` that contains this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage {
            base: self.0 & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Zero-based index of the 4 KiB page that contains this address.
    #[inline]
    #[must_use]
    pub const fn page_index(self) -> u64 {
        self.0 >> Size4K::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, bytes: u64) -> Option<Self> {
        match self.0.checked_sub(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// Physical memory page base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        addr.page::<S>()
    }

    /// Create from an address that must already be aligned.
    /// Panics in debug if unaligned (no runtime cost in release).
    #[inline]
    #[must_use]
    pub fn new_aligned(addr: PhysicalAddress) -> Self {
        debug_assert_eq!(addr.as_u64() & (S::SIZE - 1), 0, "unaligned page address");
        Self {
            base: addr.as_u64(),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// The `n`-th page after this one.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self {
            base: self.base + n * S::SIZE,
            _phantom: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::as_str(), self.base)
    }
}
