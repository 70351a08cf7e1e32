use core::fmt;
use core::ops::{Add, AddAssign};

/// Virtual (page-table translated) memory address.
///
/// Faulting addresses and mapping targets are virtual; the nine-bit index
/// used at each page-table level is derived with [`VirtualAddress::level_index`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
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

    /// Nine-bit table index whose least significant bit is `start_bit`.
    ///
    /// `start_bit` is 39 for the top level of 4-level paging, 48 for 5-level,
    /// down to 12 for the page-table level.
    #[inline]
    #[must_use]
    pub const fn level_index(self, start_bit: u32) -> usize {
        ((self.0 >> start_bit) & 0x1FF) as usize
    }

    /// Align down to a `1 << shift` byte boundary.
    #[inline]
    #[must_use]
    pub const fn align_down_shift(self, shift: u32) -> Self {
        Self(self.0 & !((1u64 << shift) - 1))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
