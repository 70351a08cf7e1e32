//! Guard page controller.
//!
//! [`HeapGuard`] owns the guarded-page bitmap and applies guard pages
//! through a [`MemoryAttributes`] surface. Until paging is active the
//! controller only records state in the bitmap; the recorded guard pages
//! are applied in one sweep when paging comes up.

use crate::attributes::{AttributeError, MemoryAttribute, MemoryAttributes};
use crate::map::{GuardedPageMap, MapPageAllocator, OutOfMapMemory, WalkItem};
use crate::policy::{AllocateType, GuardKind, HeapGuardPolicy, MemoryType};
use mm_addresses::{PageSize, PhysicalAddress, Size4K, pages_to_size};
use mm_sync::ReentryFlag;

/// Guard application failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GuardError {
    #[error(transparent)]
    Attribute(#[from] AttributeError),
    #[error(transparent)]
    OutOfMapMemory(#[from] OutOfMapMemory),
}

/// The guard page controller.
pub struct HeapGuard<A: MapPageAllocator> {
    map: GuardedPageMap<A>,
    policy: HeapGuardPolicy,
    /// Set while attribute updates run; allocations made during that window
    /// must not be guarded or the controller would recurse into itself.
    on_guarding: ReentryFlag,
    paging_active: bool,
}

impl<A: MapPageAllocator> HeapGuard<A> {
    pub const fn new(alloc: A, policy: HeapGuardPolicy) -> Self {
        Self {
            map: GuardedPageMap::new(alloc),
            policy,
            on_guarding: ReentryFlag::new(),
            paging_active: false,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &HeapGuardPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn paging_active(&self) -> bool {
        self.paging_active
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.policy.enabled()
    }

    /// Whether an allocation of `memory_type` via `allocate_type` gets the
    /// `kind` guard treatment.
    ///
    /// Address-pinned allocations are never guarded (the extra guard pages
    /// would move them), and neither is anything allocated while the
    /// controller itself is updating attributes.
    #[must_use]
    pub fn is_memory_type_to_guard(
        &self,
        memory_type: MemoryType,
        allocate_type: AllocateType,
        kind: GuardKind,
    ) -> bool {
        if self.on_guarding.is_set() || allocate_type == AllocateType::Address {
            return false;
        }
        match kind {
            GuardKind::Pool => self.policy.pool_guard && self.policy.pool_types.contains(memory_type),
            GuardKind::Page => self.policy.page_guard && self.policy.page_types.contains(memory_type),
        }
    }

    #[must_use]
    pub fn is_pool_type_to_guard(&self, memory_type: MemoryType) -> bool {
        self.is_memory_type_to_guard(memory_type, AllocateType::AnyPages, GuardKind::Pool)
    }

    #[must_use]
    pub fn is_page_type_to_guard(&self, memory_type: MemoryType) -> bool {
        self.is_memory_type_to_guard(memory_type, AllocateType::AnyPages, GuardKind::Page)
    }

    pub fn is_guard_page(&mut self, address: PhysicalAddress) -> bool {
        self.map.is_guard_page(address)
    }

    pub fn is_memory_guarded(&mut self, address: PhysicalAddress) -> bool {
        self.map.is_memory_guarded(address)
    }

    /// Raw bitmap window, `pages` bits starting at `base` (low bit first).
    pub fn guarded_bits(&mut self, base: PhysicalAddress, pages: u64) -> u64 {
        self.map.get_guarded(base, pages)
    }

    /// Two-bit window covering the two pages below `base`; bit 0 is the
    /// lower of the two. Pages below address zero read as zero.
    pub(crate) fn window_below(&mut self, base: PhysicalAddress) -> u64 {
        match base.checked_sub(2 * Size4K::SIZE) {
            Some(below) => self.map.get_guarded(below, 2),
            None => match base.checked_sub(Size4K::SIZE) {
                Some(below) => self.map.get_guarded(below, 1) << 1,
                None => 0,
            },
        }
    }

    /// Make `base`'s page a guard page.
    ///
    /// Before paging is active this is a no-op; the bitmap alone carries the
    /// state and [`apply_recorded_guards`](Self::apply_recorded_guards)
    /// applies it later.
    pub fn set_guard_page(
        &self,
        attrs: &mut impl MemoryAttributes,
        base: PhysicalAddress,
    ) -> Result<(), AttributeError> {
        if !self.paging_active {
            return Ok(());
        }
        self.on_guarding
            .scoped(|| attrs.set_attributes(base, Size4K::SIZE, MemoryAttribute::READ_PROTECT))
    }

    /// Return `base`'s page to normal supervisor data protection.
    pub fn unset_guard_page(
        &self,
        attrs: &mut impl MemoryAttributes,
        base: PhysicalAddress,
    ) -> Result<(), AttributeError> {
        if !self.paging_active {
            return Ok(());
        }
        self.on_guarding.scoped(|| {
            attrs.clear_attributes(
                base,
                Size4K::SIZE,
                MemoryAttribute::READ_PROTECT | MemoryAttribute::READ_ONLY,
            )?;
            attrs.set_attributes(
                base,
                Size4K::SIZE,
                MemoryAttribute::EXECUTE_PROTECT | MemoryAttribute::SUPERVISOR,
            )
        })
    }

    /// Guard the allocation `[base, base + pages)`.
    ///
    /// The pages above and below the range become guard pages unless a
    /// neighboring allocation already established them, then the range is
    /// recorded as guarded in the bitmap.
    pub fn set_guard_for_memory(
        &mut self,
        attrs: &mut impl MemoryAttributes,
        base: PhysicalAddress,
        pages: u64,
    ) -> Result<(), GuardError> {
        debug_assert!(!base.is_null() && pages > 0);
        let tail = base + pages_to_size(pages);
        if !self.is_guard_page(tail) {
            self.set_guard_page(attrs, tail)?;
        }
        if let Some(head) = base.checked_sub(Size4K::SIZE) {
            if !self.is_guard_page(head) {
                self.set_guard_page(attrs, head)?;
            }
        }
        self.map.set_guarded(base, pages)?;
        Ok(())
    }

    /// Remove the guards of the allocation `[base, base + pages)`.
    ///
    /// Each boundary guard page is torn down only if the neighbor on its far
    /// side does not share it; on a partial free, the boundary page of the
    /// surviving neighbor becomes its new guard instead.
    pub fn unset_guard_for_memory(
        &mut self,
        attrs: &mut impl MemoryAttributes,
        base: PhysicalAddress,
        pages: u64,
    ) -> Result<(), GuardError> {
        debug_assert!(!base.is_null() && pages > 0);

        // Head boundary: bit 1 is the page right below `base`.
        let window = self.window_below(base);
        if window & 0b10 == 0 {
            if window & 0b01 == 0 {
                // Exclusive guard page; tear it down.
                self.unset_guard_page(attrs, base - Size4K::SIZE)?;
            }
        } else {
            // Partial free; the first freed page guards the lower neighbor.
            self.set_guard_page(attrs, base)?;
        }

        // Tail boundary: bit 0 is the page right above the range.
        let tail = base + pages_to_size(pages);
        let window = self.map.get_guarded(tail, 2);
        if window & 0b01 == 0 {
            if window & 0b10 == 0 {
                self.unset_guard_page(attrs, tail)?;
            }
        } else {
            self.set_guard_page(attrs, tail - Size4K::SIZE)?;
        }

        self.map.clear_guarded(base, pages)?;
        Ok(())
    }

    /// Mark paging as active and apply every guard page recorded so far.
    pub fn activate_paging(
        &mut self,
        attrs: &mut impl MemoryAttributes,
    ) -> Result<(), AttributeError> {
        self.paging_active = true;
        self.apply_recorded_guards(attrs)
    }

    /// Sweep the bitmap and apply a guard page at every transition between
    /// guarded and unguarded pages.
    pub fn apply_recorded_guards(
        &self,
        attrs: &mut impl MemoryAttributes,
    ) -> Result<(), AttributeError> {
        if !self.paging_active || !self.policy.enabled() {
            return Ok(());
        }
        let mut guarding = false;
        let mut result = Ok(());
        self.map.for_each(&mut |item| {
            let WalkItem::Word { address, word } = item else {
                guarding = false;
                return;
            };
            if word == 0 {
                guarding = false;
                return;
            }
            let mut word = word;
            let mut address = address.as_u64();
            let mut index = 0;
            while index < 64 {
                let guard = if word & 1 != 0 {
                    let guard = if guarding { 0 } else { address - Size4K::SIZE };
                    guarding = true;
                    guard
                } else {
                    let guard = if guarding { address } else { 0 };
                    guarding = false;
                    guard
                };
                if guard != 0 {
                    if let Err(e) = self.set_guard_page(attrs, PhysicalAddress::new(guard)) {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                if word == 0 {
                    break;
                }
                word >>= 1;
                address += Size4K::SIZE;
                index += 1;
            }
        });
        result
    }

    /// Check that the guard pages around `[base, base + pages)` actually
    /// carry read protection. Logs and dumps the bitmap on mismatch.
    pub fn verify_memory_guard(
        &mut self,
        attrs: &mut impl MemoryAttributes,
        base: PhysicalAddress,
        pages: u64,
    ) -> bool {
        if !self.paging_active {
            return true;
        }
        let mut intact = true;
        let candidates = [
            base.checked_sub(Size4K::SIZE),
            Some(base + pages_to_size(pages)),
        ];
        for guard in candidates.into_iter().flatten() {
            if !self.is_guard_page(guard) {
                continue;
            }
            let protected = matches!(
                attrs.get_attributes(guard, Size4K::SIZE),
                Ok(a) if a.contains(MemoryAttribute::READ_PROTECT)
            );
            if !protected {
                log::error!("guard page at {guard} lost its read protection");
                self.map.dump();
                intact = false;
            }
        }
        intact
    }

    /// Log the guarded-page bitmap.
    pub fn dump_bitmap(&self) {
        self.map.dump();
    }
}
