//! Reclamation of the least recently used page-table subtree.
//!
//! When the pool is empty, the whole hierarchy is scanned and every
//! reclaimable entry is aged: entries the processor touched since the last
//! scan score highest and are refreshed, untouched entries decay toward
//! zero. The lowest-scoring entry loses its subtree. Only entries whose
//! subtree contains no further table pages are eligible, so releasing one
//! never leaks a page:
//!
//! - a PD entry pointing at a page table (the table holds only 4 KiB leaves),
//! - a PDPT entry whose page directory holds only 2 MiB leaves,
//! - a PML4 entry whose directory-pointer table is empty.
//!
//! Permanent entries and the chain of the fault being serviced are never
//! victims. After the victim's page returns to the pool, empty ancestors
//! are released as well, walking up until a still-populated level is found.

use mm_addresses::{PhysicalPage, Size4K, VirtualAddress};

use crate::TableMapper;
use crate::entry::{ACC_BIAS, ACC_MAX, PageEntry, PageTable};
use crate::walker::{OnDemandPaging, ServiceError};

/// Read an entry's age score and decay it.
///
/// A set accessed bit outranks every decayed record; it is consumed here
/// and the record reset to the freshest value.
pub(crate) fn get_and_update_access(table: &mut PageTable, index: usize) -> u64 {
    let mut entry = table.get(index);
    if entry.accessed() {
        entry.set_accessed(false);
        entry.set_access_record(ACC_MAX);
        table.set(index, entry);
        return u64::from(ACC_MAX) + ACC_BIAS;
    }
    let record = entry.access_record();
    if record > 0 {
        entry.set_access_record(record - 1);
        table.set(index, entry);
    }
    u64::from(record)
}

/// An ancestor entry above the victim, innermost first.
#[derive(Clone, Copy)]
struct Ancestor {
    page: PhysicalPage<Size4K>,
    index: usize,
    /// The table this entry points at carries the fault being serviced.
    on_fault_chain: bool,
}

#[derive(Clone, Copy)]
struct Victim {
    score: u64,
    /// Table holding the entry to clear.
    page: PhysicalPage<Size4K>,
    index: usize,
    ancestors: [Option<Ancestor>; 3],
}

fn consider(best: &mut Option<Victim>, candidate: Victim) {
    if best.is_none_or(|b| candidate.score < b.score) {
        *best = Some(candidate);
    }
}

impl<M: TableMapper> OnDemandPaging<'_, M> {
    /// Release the coldest subtree back into the pool.
    ///
    /// `fault` is the address whose servicing ran the pool dry; its chain
    /// is exempt from eviction.
    pub(crate) fn reclaim(&mut self, fault: VirtualAddress) -> Result<(), ServiceError> {
        let five_level = self.config.five_level;
        let f5 = if five_level { fault.level_index(48) } else { 0 };
        let f4 = fault.level_index(39);
        let f3 = fault.level_index(30);
        let f2 = fault.level_index(21);

        let mut best: Option<Victim> = None;
        let top_count = if five_level { PageTable::ENTRY_COUNT } else { 1 };

        for i5 in 0..top_count {
            let (pml4_page, pml5_slot) = if five_level {
                // Safety: the root is a live table page we own.
                let pml5 = unsafe { self.mapper.table_mut(self.root) };
                let pml5e = pml5.get(i5);
                if !pml5e.present() || pml5e.permanent() {
                    continue;
                }
                (
                    pml5e.table_page(),
                    Some(Ancestor {
                        page: self.root,
                        index: i5,
                        on_fault_chain: i5 == f5,
                    }),
                )
            } else {
                (self.root, None)
            };

            for i4 in 0..PageTable::ENTRY_COUNT {
                let pml4 = unsafe { self.mapper.table_mut(pml4_page) };
                let pml4e = pml4.get(i4);
                if !pml4e.present() || pml4e.permanent() {
                    continue;
                }
                let pdpt_page = pml4e.table_page();
                let pml4_ancestor = Ancestor {
                    page: pml4_page,
                    index: i4,
                    on_fault_chain: (i5, i4) == (f5, f4),
                };
                let mut keep_pml4e = false;

                for i3 in 0..PageTable::ENTRY_COUNT {
                    let pdpt = unsafe { self.mapper.table_mut(pdpt_page) };
                    let pdpte = pdpt.get(i3);
                    if !pdpte.present() {
                        continue;
                    }
                    keep_pml4e = true;
                    if pdpte.permanent() || pdpte.page_size() {
                        continue;
                    }
                    let pdt_page = pdpte.table_page();
                    let pdpt_ancestor = Ancestor {
                        page: pdpt_page,
                        index: i3,
                        on_fault_chain: (i5, i4, i3) == (f5, f4, f3),
                    };
                    let mut keep_pdpte = false;

                    for i2 in 0..PageTable::ENTRY_COUNT {
                        let pdt = unsafe { self.mapper.table_mut(pdt_page) };
                        let pdte = pdt.get(i2);
                        if !pdte.present() {
                            continue;
                        }
                        if pdte.permanent() {
                            keep_pdpte = true;
                            continue;
                        }
                        if pdte.page_size() {
                            continue;
                        }
                        // Points at a page table of 4 KiB leaves.
                        keep_pdpte = true;
                        if (i5, i4, i3, i2) == (f5, f4, f3, f2) {
                            continue;
                        }
                        consider(
                            &mut best,
                            Victim {
                                score: get_and_update_access(pdt, i2),
                                page: pdt_page,
                                index: i2,
                                ancestors: [Some(pdpt_ancestor), Some(pml4_ancestor), pml5_slot],
                            },
                        );
                    }

                    if !keep_pdpte && (i5, i4, i3) != (f5, f4, f3) {
                        consider(
                            &mut best,
                            Victim {
                                score: get_and_update_access(pdpt, i3),
                                page: pdpt_page,
                                index: i3,
                                ancestors: [Some(pml4_ancestor), pml5_slot, None],
                            },
                        );
                    }
                }

                if !keep_pml4e && (i5, i4) != (f5, f4) {
                    consider(
                        &mut best,
                        Victim {
                            score: get_and_update_access(pml4, i4),
                            page: pml4_page,
                            index: i4,
                            ancestors: [pml5_slot, None, None],
                        },
                    );
                }
            }
        }

        let Some(victim) = best else {
            log::warn!("page-table pool empty and no reclaimable subtree");
            return Err(ServiceError::NothingToReclaim);
        };
        self.release(victim);
        Ok(())
    }

    fn release(&mut self, victim: Victim) {
        // Safety: every page touched here is a live table page of this
        // hierarchy.
        let table = unsafe { self.mapper.table_mut(victim.page) };
        let entry = table.get(victim.index);
        log::debug!(
            "reclaiming page table at {} (score {})",
            entry.physical_address(),
            victim.score
        );
        self.pool.push(entry.table_page());
        table.set(victim.index, PageEntry::new());

        for ancestor in victim.ancestors.into_iter().flatten() {
            let table = unsafe { self.mapper.table_mut(ancestor.page) };
            let mut entry = table.get(ancestor.index);
            if entry.sub_entries() == 0 && !ancestor.on_fault_chain {
                self.pool.push(entry.table_page());
                table.set(ancestor.index, PageEntry::new());
            } else {
                entry.drop_sub_entries();
                table.set(ancestor.index, entry);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::testing::{IdentityMapper, fresh_table, pool_of};
    use crate::walker::{DefaultSizePolicy, FaultPlan, MapGranularity, PageSizePolicy, PagingConfig};

    struct Always4K;

    impl PageSizePolicy for Always4K {
        fn plan(&self, _address: VirtualAddress) -> Option<FaultPlan> {
            Some(FaultPlan {
                granularity: MapGranularity::Page4K,
                pages: 1,
                attributes: PageEntry::new(),
            })
        }
    }

    fn paging(pool_pages: usize) -> OnDemandPaging<'static, IdentityMapper> {
        OnDemandPaging::new(
            &IdentityMapper,
            fresh_table(),
            PagingConfig::default(),
            pool_of(pool_pages),
        )
    }

    fn entry_at(
        paging: &OnDemandPaging<'_, IdentityMapper>,
        page: PhysicalPage<Size4K>,
        index: usize,
    ) -> PageEntry {
        unsafe { paging.mapper.table_mut(page) }.get(index)
    }

    #[test]
    fn access_scores_decay_once_per_scan() {
        let mut table = PageTable::zeroed();
        table.set(
            0,
            PageEntry::new().with_present(true).with_accessed(true),
        );
        // Touched since the last scan: maximum score, record refreshed.
        assert_eq!(get_and_update_access(&mut table, 0), 15);
        assert!(!table.get(0).accessed());
        assert_eq!(table.get(0).access_record(), 7);
        // Untouched: pre-decay record is reported.
        assert_eq!(get_and_update_access(&mut table, 0), 7);
        assert_eq!(table.get(0).access_record(), 6);
        // Fully decayed records stay at zero.
        let mut entry = table.get(0);
        entry.set_access_record(0);
        table.set(0, entry);
        assert_eq!(get_and_update_access(&mut table, 0), 0);
        assert_eq!(table.get(0).access_record(), 0);
    }

    #[test]
    fn exhausted_pool_reclaims_a_page_table_chain() {
        let mut paging = paging(3);
        // One 4 KiB mapping consumes all three pool pages (PDPT, PD, PT).
        let first = VirtualAddress::new(0x0000_0000_0000_1000);
        paging.service_fault(first, &Always4K).unwrap();
        assert!(paging.pool_mut().is_empty());

        // A fault under a different top-level entry must evict the first
        // chain; its ancestors are empty and come back with it.
        let second = VirtualAddress::new(0x0000_0080_0000_0000);
        paging.service_fault(second, &DefaultSizePolicy).unwrap();

        assert!(!entry_at(&paging, paging.root(), first.level_index(39)).present());
        let pml4e = entry_at(&paging, paging.root(), second.level_index(39));
        assert!(pml4e.present());
        // Three pages came back, two went into the new chain.
        assert_eq!(paging.pool_mut().len(), 1);
    }

    #[test]
    fn directory_of_large_leaves_is_reclaimable() {
        let mut paging = paging(2);
        let first = VirtualAddress::new(0x0000_0000_4000_0000);
        paging.service_fault(first, &DefaultSizePolicy).unwrap();
        assert!(paging.pool_mut().is_empty());

        let second = VirtualAddress::new(0x0000_0080_0000_0000);
        paging.service_fault(second, &DefaultSizePolicy).unwrap();

        // The first chain's directory held only a 2 MiB leaf, so its
        // directory-pointer entry was the victim.
        assert!(!entry_at(&paging, paging.root(), first.level_index(39)).present());
        assert!(entry_at(&paging, paging.root(), second.level_index(39)).present());
    }

    #[test]
    fn coldest_entry_loses_its_subtree() {
        let mut paging = paging(6);
        let cold = VirtualAddress::new(0x0000_0000_0000_1000);
        let warm = VirtualAddress::new(0x0000_0080_0000_1000);
        paging.service_fault(cold, &Always4K).unwrap();
        paging.service_fault(warm, &Always4K).unwrap();
        assert!(paging.pool_mut().is_empty());

        // Age the first chain's page-table entry down to one.
        let pml4e = entry_at(&paging, paging.root(), cold.level_index(39));
        let pdpte = entry_at(&paging, pml4e.table_page(), cold.level_index(30));
        let pdt = unsafe { paging.mapper.table_mut(pdpte.table_page()) };
        let mut pdte = pdt.get(cold.level_index(21));
        pdte.set_accessed(false);
        pdte.set_access_record(1);
        pdt.set(cold.level_index(21), pdte);

        let third = VirtualAddress::new(0x0000_0100_0000_0000);
        paging.service_fault(third, &DefaultSizePolicy).unwrap();

        assert!(!entry_at(&paging, paging.root(), cold.level_index(39)).present());
        assert!(entry_at(&paging, paging.root(), warm.level_index(39)).present());
    }

    #[test]
    fn partial_release_decrements_the_parent() {
        let mut paging = paging(4);
        // Two page tables under the same directory.
        let first = VirtualAddress::new(0x0000_0000_0000_1000);
        let second = VirtualAddress::new(0x0000_0000_0020_1000);
        paging.service_fault(first, &Always4K).unwrap();
        paging.service_fault(second, &Always4K).unwrap();
        assert!(paging.pool_mut().is_empty());

        let pml4e = entry_at(&paging, paging.root(), first.level_index(39));
        let pdpt_page = pml4e.table_page();
        let pdpte = entry_at(&paging, pdpt_page, first.level_index(30));
        assert_eq!(pdpte.sub_entries(), 1);

        // Age the first page table below its sibling.
        let pdt = unsafe { paging.mapper.table_mut(pdpte.table_page()) };
        let mut pdte = pdt.get(first.level_index(21));
        pdte.set_accessed(false);
        pdte.set_access_record(1);
        pdt.set(first.level_index(21), pdte);

        paging
            .reclaim(VirtualAddress::new(0x0000_0080_0000_0000))
            .unwrap();

        // Only the cold page table came back; the still-populated
        // directory stays and its child count drops to zero.
        assert_eq!(paging.pool_mut().len(), 1);
        let pdpte = entry_at(&paging, pdpt_page, first.level_index(30));
        assert!(pdpte.present());
        assert_eq!(pdpte.sub_entries(), 0);
        let pdt = unsafe { paging.mapper.table_mut(pdpte.table_page()) };
        assert!(!pdt.get(first.level_index(21)).present());
        assert!(pdt.get(second.level_index(21)).present());
    }

    #[test]
    fn pinned_mappings_are_never_victims() {
        let mut paging = paging(2);
        let pinned = VirtualAddress::new(0x0000_0000_4000_0000);
        paging.service_fault(pinned, &DefaultSizePolicy).unwrap();
        paging.pin_initial_mappings(2);
        assert!(paging.pool_mut().is_empty());

        let fault = VirtualAddress::new(0x0000_0000_8000_0000);
        let result = paging.service_fault(fault, &DefaultSizePolicy);
        assert_eq!(result, Err(ServiceError::NothingToReclaim));
    }
}
