//! End-to-end fault dispatch through the public surface: triage, on-demand
//! mapping, and reclamation under pool pressure.

use mm_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use mm_paging::{
    CommBufferPolicy, DefaultSizePolicy, FaultContext, FaultMonitor, FaultOutcome, OnDemandPaging,
    PageFaultError, PagePool, PageTable, PagingConfig, ProtectedRegion, RejectReason,
    StackGuardWindows, TableMapper, handle_fault,
};
use mm_sync::SpinLock;

struct IdentityMapper;

impl TableMapper for IdentityMapper {
    unsafe fn table_mut<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut PageTable {
        let ptr = page.base().as_u64() as usize as *mut PageTable;
        unsafe { &mut *ptr }
    }
}

struct NoForbiddenBuffers;

impl CommBufferPolicy for NoForbiddenBuffers {
    fn is_forbidden(&self, _address: VirtualAddress) -> bool {
        false
    }
}

fn fresh_table() -> PhysicalPage<Size4K> {
    let table: &'static mut PageTable = Box::leak(Box::new(PageTable::zeroed()));
    PhysicalPage::new_aligned(PhysicalAddress::new(core::ptr::from_mut(table) as usize as u64))
}

fn pool_of(pages: usize) -> PagePool {
    let mut pool = PagePool::new();
    for _ in 0..pages {
        pool.push(fresh_table());
    }
    pool
}

fn monitor() -> FaultMonitor {
    FaultMonitor {
        restricted_access: false,
        physical_address_bits: 48,
        region: ProtectedRegion {
            base: VirtualAddress::new(0x7000_0000),
            length: 0x100_0000,
        },
        stack_guard: Some(StackGuardWindows {
            stacks_base: VirtualAddress::new(0x7000_0000),
            stack_size: 0x8000,
            shadow_stack_size: 0x2000,
        }),
        reboot_on_fault: false,
    }
}

fn data_fault(address: u64) -> FaultContext {
    FaultContext {
        address: VirtualAddress::new(address),
        error: PageFaultError::from_bits(0b10),
        cpu_index: 0,
    }
}

#[test]
fn dispatch_services_data_faults_and_rejects_violations() {
    let paging = SpinLock::new(OnDemandPaging::new(
        &IdentityMapper,
        fresh_table(),
        PagingConfig::default(),
        pool_of(8),
    ));
    let monitor = monitor();

    let serviced = handle_fault(
        &paging,
        &monitor,
        &NoForbiddenBuffers,
        &DefaultSizePolicy,
        &data_fault(0x1_2345_6789),
    );
    assert_eq!(serviced, FaultOutcome::Serviced);

    // The mapping is visible in the hierarchy afterwards.
    paging.with_lock(|paging| {
        let fault = VirtualAddress::new(0x1_2345_6789);
        let pml4e = unsafe { IdentityMapper.table_mut(paging.root()) }.get(fault.level_index(39));
        assert!(pml4e.present());
        let pdpte = unsafe { IdentityMapper.table_mut(pml4e.table_page()) }.get(fault.level_index(30));
        let pde = unsafe { IdentityMapper.table_mut(pdpte.table_page()) }.get(fault.level_index(21));
        assert!(pde.present());
        assert!(pde.page_size());
    });

    // A write into supervisor memory is refused, and a guard-page hit is
    // told apart from a plain protection violation.
    let rejected = handle_fault(
        &paging,
        &monitor,
        &NoForbiddenBuffers,
        &DefaultSizePolicy,
        &data_fault(0x7050_0000),
    );
    assert_eq!(
        rejected,
        FaultOutcome::Rejected(RejectReason::AccessProtection)
    );
    let stack_hit = handle_fault(
        &paging,
        &monitor,
        &NoForbiddenBuffers,
        &DefaultSizePolicy,
        &data_fault(0x7000_0010),
    );
    assert_eq!(stack_hit, FaultOutcome::Rejected(RejectReason::StackOverflow));
}

#[test]
fn sustained_faulting_is_absorbed_by_reclamation() {
    let paging = SpinLock::new(OnDemandPaging::new(
        &IdentityMapper,
        fresh_table(),
        PagingConfig::default(),
        pool_of(8),
    ));
    let monitor = monitor();

    // Each fault lands under its own top-level entry and costs two table
    // pages, so the pool runs dry after four; reclamation must keep the
    // remaining faults serviceable indefinitely.
    for index in 1..=32u64 {
        let address = (index << 39) | 0x4000_0000;
        let outcome = handle_fault(
            &paging,
            &monitor,
            &NoForbiddenBuffers,
            &DefaultSizePolicy,
            &data_fault(address),
        );
        assert_eq!(outcome, FaultOutcome::Serviced, "fault {index}");
    }

    // The most recent mapping survives.
    paging.with_lock(|paging| {
        let fault = VirtualAddress::new((32 << 39) | 0x4000_0000);
        let pml4e = unsafe { IdentityMapper.table_mut(paging.root()) }.get(fault.level_index(39));
        assert!(pml4e.present());
    });
}
