//! Fault-driven page-table construction.
//!
//! A fault below the paging structures is serviced by walking from the root
//! toward the leaf level, materializing every missing table from the pool
//! along the way. The walk records freshness on each visited entry so the
//! reclaimer can later pick the coldest subtree.

use mm_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use thiserror::Error;

use crate::TableMapper;
use crate::entry::{ACC_MAX, PageEntry, PageTable};
use crate::pool::{PAGE_TABLE_POOL_PAGES, PagePool};

/// Mapping granularity installed at the leaf of a serviced fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapGranularity {
    Page4K,
    Page2M,
    Page1G,
}

impl MapGranularity {
    /// Least significant address bit covered by a leaf of this granularity.
    #[must_use]
    pub const fn leaf_shift(self) -> u32 {
        match self {
            Self::Page4K => 12,
            Self::Page2M => 21,
            Self::Page1G => 30,
        }
    }
}

/// How to map the neighborhood of one faulting address.
#[derive(Debug, Clone, Copy)]
pub struct FaultPlan {
    pub granularity: MapGranularity,
    /// Leaves to install starting at the aligned fault address.
    /// Clamped to one table's worth.
    pub pages: usize,
    /// Extra entry bits merged into each installed leaf.
    pub attributes: PageEntry,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            granularity: MapGranularity::Page2M,
            pages: 1,
            attributes: PageEntry::new(),
        }
    }
}

/// Chooses the mapping granularity for a faulting address.
///
/// Platforms refine this to map MMIO 4 KiB at a time or to widen hot
/// regions; the decision is per fault, not global.
pub trait PageSizePolicy {
    /// A plan for `address`, or `None` to take the default 2 MiB mapping.
    fn plan(&self, address: VirtualAddress) -> Option<FaultPlan>;
}

/// Always maps a single 2 MiB page.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSizePolicy;

impl PageSizePolicy for DefaultSizePolicy {
    fn plan(&self, _address: VirtualAddress) -> Option<FaultPlan> {
        None
    }
}

/// Processor paging features the walk must respect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PagingConfig {
    /// Five paging levels (57-bit linear addresses).
    pub five_level: bool,
    /// 1 GiB leaf pages are available.
    pub support_1g: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The plan asked for a granularity the processor cannot map.
    #[error("requested mapping granularity is not supported")]
    UnsupportedGranularity,
    /// The pool ran dry and no page-table subtree could be released.
    #[error("no page-table pages left and nothing to reclaim")]
    NothingToReclaim,
}

/// Lazily built page-table hierarchy fed from a bounded page pool.
pub struct OnDemandPaging<'m, M: TableMapper> {
    pub(crate) mapper: &'m M,
    pub(crate) root: PhysicalPage<Size4K>,
    pub(crate) config: PagingConfig,
    pub(crate) pool: PagePool,
}

impl<'m, M: TableMapper> OnDemandPaging<'m, M> {
    /// Wrap an existing root table. The root must already hold the pinned
    /// initial mappings; `pool` holds the pages faults may consume.
    pub const fn new(
        mapper: &'m M,
        root: PhysicalPage<Size4K>,
        config: PagingConfig,
        pool: PagePool,
    ) -> Self {
        Self {
            mapper,
            root,
            config,
            pool,
        }
    }

    /// Build the starting hierarchy from scratch.
    ///
    /// `next_page` supplies the physical pages for the spine, the initial
    /// identity map, and the [`PAGE_TABLE_POOL_PAGES`] pool seed. The first
    /// `pinned_pdpt_entries` gigabytes are identity mapped and pinned so
    /// reclamation never touches them; faults fill in everything above.
    pub fn initialize(
        mapper: &'m M,
        config: PagingConfig,
        pinned_pdpt_entries: usize,
        mut next_page: impl FnMut() -> PhysicalPage<Size4K>,
    ) -> Self {
        let mut take = || {
            let page = next_page();
            // Safety: freshly supplied pages are exclusively ours.
            unsafe { mapper.table_mut(page) }.zero();
            page
        };

        let root = take();
        let mut spine = root;
        if config.five_level {
            let pml4 = take();
            unsafe { mapper.table_mut(spine) }.set(0, PageEntry::make_table(pml4));
            spine = pml4;
        }
        let pdpt_page = take();
        unsafe { mapper.table_mut(spine) }.set(0, PageEntry::make_table(pdpt_page));

        let identity = PageEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_accessed(true)
            .with_page_size(true);
        for index in 0..pinned_pdpt_entries.min(PageTable::ENTRY_COUNT) {
            let base = (index as u64) << 30;
            if config.support_1g {
                let mut leaf = identity;
                leaf.set_physical_address(PhysicalAddress::new(base));
                unsafe { mapper.table_mut(pdpt_page) }.set(index, leaf);
            } else {
                let pdt = take();
                let table = unsafe { mapper.table_mut(pdt) };
                for slot in 0..PageTable::ENTRY_COUNT {
                    let mut leaf = identity;
                    leaf.set_physical_address(PhysicalAddress::new(base + ((slot as u64) << 21)));
                    table.set(slot, leaf);
                }
                unsafe { mapper.table_mut(pdpt_page) }.set(index, PageEntry::make_table(pdt));
            }
        }

        let mut pool = PagePool::new();
        for _ in 0..PAGE_TABLE_POOL_PAGES {
            pool.push(take());
        }

        let mut paging = Self::new(mapper, root, config, pool);
        paging.pin_initial_mappings(pinned_pdpt_entries);
        paging
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    pub const fn pool_mut(&mut self) -> &mut PagePool {
        &mut self.pool
    }

    /// Address bit where the top-level table index starts.
    pub(crate) const fn top_start_bit(&self) -> u32 {
        if self.config.five_level { 48 } else { 39 }
    }

    /// Mark the initial identity mappings as permanent so reclamation never
    /// releases them. The first `pinned_pdpt_entries` third-level entries
    /// (and the spine above them) are pinned.
    pub fn pin_initial_mappings(&mut self, pinned_pdpt_entries: usize) {
        let mut page = self.root;
        if self.config.five_level {
            // Safety: root and its children are live table pages we own.
            let pml5 = unsafe { self.mapper.table_mut(page) };
            let mut top = pml5.get(0);
            top.set_sub_entries(1);
            pml5.set(0, top);
            page = top.table_page();
        }
        let pml4 = unsafe { self.mapper.table_mut(page) };
        let mut spine = pml4.get(0);
        spine.set_sub_entries((pinned_pdpt_entries & 0x1FF) as u16);
        pml4.set(0, spine);
        let pdpt = unsafe { self.mapper.table_mut(spine.table_page()) };
        for index in 0..pinned_pdpt_entries.min(PageTable::ENTRY_COUNT) {
            let mut entry = pdpt.get(index);
            entry.set_permanent(true);
            pdpt.set(index, entry);
        }
    }

    /// Map the faulting address according to the policy's plan.
    pub fn service_fault<P: PageSizePolicy>(
        &mut self,
        fault: VirtualAddress,
        policy: &P,
    ) -> Result<(), ServiceError> {
        let plan = policy.plan(fault).unwrap_or_default();
        if plan.granularity == MapGranularity::Page1G && !self.config.support_1g {
            return Err(ServiceError::UnsupportedGranularity);
        }
        let end_bit = plan.granularity.leaf_shift();
        let pages = plan.pages.clamp(1, PageTable::ENTRY_COUNT);
        let mut address = fault.align_down_shift(end_bit);
        for _ in 0..pages {
            self.install_leaf(address, end_bit, &plan)?;
            address += 1u64 << end_bit;
        }
        Ok(())
    }

    /// Walk from the root to the level above `end_bit`, creating missing
    /// tables, and install one leaf at `address`.
    fn install_leaf(
        &mut self,
        address: VirtualAddress,
        end_bit: u32,
        plan: &FaultPlan,
    ) -> Result<(), ServiceError> {
        let mut page = self.root;
        // Deepest pre-existing entry above the leaf; its child count grows
        // by the one leaf installed below it.
        let mut upper: Option<(PhysicalPage<Size4K>, usize)> = None;

        let mut bit = self.top_start_bit();
        while bit > end_bit {
            let index = address.level_index(bit);
            // Safety: every page on the walk is a live table page.
            let table = unsafe { self.mapper.table_mut(page) };
            let mut entry = table.get(index);
            if entry.present() {
                upper = Some((page, index));
            } else {
                entry = PageEntry::make_table(self.take_table_page(address)?);
            }
            entry.set_accessed(true);
            entry.set_access_record(ACC_MAX);
            table.set(index, entry);
            page = entry.table_page();
            bit -= 9;
        }

        let index = address.level_index(end_bit);
        let table = unsafe { self.mapper.table_mut(page) };
        if table.get(index).present() {
            // A racing fault on another processor may have mapped this
            // address already; the overwrite below is identical.
            log::error!("leaf for {address} already present");
            debug_assert!(false, "double fault service for {address}");
        }
        let mut leaf = plan
            .attributes
            .with_present(true)
            .with_writable(true)
            .with_accessed(true)
            .with_no_execute(true)
            .with_page_size(plan.granularity != MapGranularity::Page4K);
        leaf.set_physical_address(PhysicalAddress::new(address.as_u64()));
        table.set(index, leaf);

        if let Some((upper_page, upper_index)) = upper {
            let upper_table = unsafe { self.mapper.table_mut(upper_page) };
            let mut entry = upper_table.get(upper_index);
            entry.bump_sub_entries();
            upper_table.set(upper_index, entry);
        }
        Ok(())
    }

    /// A zeroed table page, reclaiming the coldest subtree if the pool is
    /// dry. `fault` names the chain that must survive reclamation.
    pub(crate) fn take_table_page(
        &mut self,
        fault: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, ServiceError> {
        if self.pool.is_empty() {
            self.reclaim(fault)?;
        }
        let page = self.pool.pop().ok_or(ServiceError::NothingToReclaim)?;
        // Safety: the page left the hierarchy (or was never in it) and is
        // exclusively ours until linked back in.
        unsafe { self.mapper.table_mut(page) }.zero();
        Ok(page)
    }
}
