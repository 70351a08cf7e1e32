//! Page-fault triage and dispatch.
//!
//! Every fault is first classified by the [`FaultMonitor`]: faults that
//! land inside the protected supervisor region, fetch instructions from
//! outside it, or trip a stack guard page are violations and never return
//! to the faulting context. Only a plain data access outside the region is
//! serviceable, and only while page tables are built on demand.

use mm_addresses::{PageSize, Size4K, VirtualAddress};
use mm_sync::SpinLock;
use thiserror::Error;

use bitfield_struct::bitfield;

use crate::TableMapper;
use crate::walker::{OnDemandPaging, PageSizePolicy};

/// The page-fault exception error code pushed by the processor.
#[bitfield(u64)]
pub struct PageFaultError {
    /// Fault caused by a protection violation, not a missing page.
    pub present: bool,
    pub write: bool,
    pub user: bool,
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    /// Short description of the faulting access for diagnostics.
    #[must_use]
    pub const fn explain(self) -> &'static str {
        if self.instruction_fetch() {
            "instruction fetch"
        } else if self.shadow_stack() {
            "shadow-stack access"
        } else if !self.present() {
            "page not present"
        } else if self.write() {
            "write to protected page"
        } else {
            "read from protected page"
        }
    }
}

/// One page fault as delivered to the exception handler.
#[derive(Debug, Clone, Copy)]
pub struct FaultContext {
    pub address: VirtualAddress,
    pub error: PageFaultError,
    pub cpu_index: usize,
}

/// The memory range owned by the supervisor. Faults inside it are always
/// violations.
#[derive(Debug, Clone, Copy)]
pub struct ProtectedRegion {
    pub base: VirtualAddress,
    pub length: u64,
}

impl ProtectedRegion {
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        let a = address.as_u64();
        let base = self.base.as_u64();
        a >= base && a - base < self.length
    }
}

/// Per-processor stack layout with guard pages at the bottom of each
/// stack and shadow stack.
///
/// Each processor owns one slot of `stack_size + shadow_stack_size` bytes;
/// the stack comes first, the shadow stack follows. The first page of each
/// is the guard.
#[derive(Debug, Clone, Copy)]
pub struct StackGuardWindows {
    pub stacks_base: VirtualAddress,
    pub stack_size: u64,
    pub shadow_stack_size: u64,
}

impl StackGuardWindows {
    const fn slot_base(&self, cpu_index: usize) -> u64 {
        self.stacks_base.as_u64() + cpu_index as u64 * (self.stack_size + self.shadow_stack_size)
    }

    #[must_use]
    pub const fn is_stack_guard(&self, address: VirtualAddress, cpu_index: usize) -> bool {
        let guard = self.slot_base(cpu_index);
        address.as_u64() >= guard && address.as_u64() < guard + Size4K::SIZE
    }

    #[must_use]
    pub const fn is_shadow_stack_guard(&self, address: VirtualAddress, cpu_index: usize) -> bool {
        let guard = self.slot_base(cpu_index) + self.stack_size;
        address.as_u64() >= guard && address.as_u64() < guard + Size4K::SIZE
    }
}

/// Communication buffers the supervisor must not touch.
pub trait CommBufferPolicy {
    fn is_forbidden(&self, address: VirtualAddress) -> bool;
}

/// Why a fault was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("address beyond the supported physical range")]
    UnsupportedAddress,
    #[error("stack overflow into the guard page")]
    StackOverflow,
    #[error("shadow stack overflow into the guard page")]
    ShadowStackOverflow,
    #[error("user-mode access to supervisor memory")]
    SupervisorViolation,
    #[error("instruction fetch from protected memory")]
    ExecutionProtection,
    #[error("access to protected memory")]
    AccessProtection,
    #[error("execution outside the protected region")]
    ExecuteOutsideRegion,
    #[error("null pointer access")]
    NullPointer,
    #[error("access to a forbidden communication buffer")]
    ForbiddenCommBuffer,
    #[error("user-mode access outside the protected region")]
    UserAccessOutsideRegion,
    #[error("page tables are inconsistent with the fault")]
    InconsistentPageTables,
}

/// Classification of one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Plain data access outside the region; map it on demand.
    Service,
    Reject(RejectReason),
}

/// Result of a full fault dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Serviced,
    Rejected(RejectReason),
}

/// Classifies faults against the platform's memory protection setup.
#[derive(Debug, Clone, Copy)]
pub struct FaultMonitor {
    /// Page tables are static and cover exactly the allowed memory.
    pub restricted_access: bool,
    pub physical_address_bits: u32,
    pub region: ProtectedRegion,
    pub stack_guard: Option<StackGuardWindows>,
    /// Reset the platform on a violation instead of halting.
    pub reboot_on_fault: bool,
}

impl FaultMonitor {
    /// Faults may be serviced by building page tables on demand.
    #[must_use]
    pub const fn on_demand_paging(&self) -> bool {
        !self.restricted_access
    }

    /// Classify one fault. The order of checks matters: guard-page hits
    /// inside the region outrank the generic in-region verdicts.
    pub fn check<C: CommBufferPolicy>(&self, context: &FaultContext, comm: &C) -> Verdict {
        let address = context.address;
        let error = context.error;

        if self.restricted_access && address.as_u64() >= 1u64 << self.physical_address_bits {
            return Verdict::Reject(RejectReason::UnsupportedAddress);
        }

        if self.region.contains(address) {
            if let Some(windows) = &self.stack_guard {
                if windows.is_stack_guard(address, context.cpu_index) {
                    return Verdict::Reject(RejectReason::StackOverflow);
                }
                if windows.is_shadow_stack_guard(address, context.cpu_index) {
                    return Verdict::Reject(RejectReason::ShadowStackOverflow);
                }
            }
            let reason = if error.user() {
                RejectReason::SupervisorViolation
            } else if error.instruction_fetch() {
                RejectReason::ExecutionProtection
            } else {
                RejectReason::AccessProtection
            };
            return Verdict::Reject(reason);
        }

        if error.instruction_fetch() {
            return Verdict::Reject(RejectReason::ExecuteOutsideRegion);
        }
        if address.as_u64() < Size4K::SIZE {
            return Verdict::Reject(RejectReason::NullPointer);
        }
        if self.restricted_access && comm.is_forbidden(address) {
            return Verdict::Reject(RejectReason::ForbiddenCommBuffer);
        }
        if error.user() {
            return Verdict::Reject(RejectReason::UserAccessOutsideRegion);
        }
        Verdict::Service
    }
}

/// Classify a fault and service it if allowed.
///
/// The paging lock is taken before classification and held until the
/// outcome is decided, so concurrent faults are handled strictly one at a
/// time, diagnostics included.
pub fn handle_fault<M, C, P>(
    paging: &SpinLock<OnDemandPaging<'_, M>>,
    monitor: &FaultMonitor,
    comm: &C,
    policy: &P,
    context: &FaultContext,
) -> FaultOutcome
where
    M: TableMapper,
    C: CommBufferPolicy,
    P: PageSizePolicy,
{
    let mut paging = paging.lock();
    match monitor.check(context, comm) {
        Verdict::Reject(reason) => FaultOutcome::Rejected(reason),
        Verdict::Service => {
            if !monitor.on_demand_paging() {
                // Static tables should already cover every legal access.
                return FaultOutcome::Rejected(RejectReason::InconsistentPageTables);
            }
            match paging.service_fault(context.address, policy) {
                Ok(()) => FaultOutcome::Serviced,
                Err(error) => {
                    log::error!("servicing fault at {} failed: {error}", context.address);
                    FaultOutcome::Rejected(RejectReason::InconsistentPageTables)
                }
            }
        }
    }
}

/// Reports violations to the platform before it stops.
pub trait FaultReporter {
    fn report(&mut self, context: &FaultContext, reason: RejectReason);
}

/// Last-resort platform actions for unrecoverable faults.
pub trait SystemControl {
    fn warm_reset(&mut self) -> !;
    fn dead_loop(&mut self) -> !;
}

/// Report a violation and stop the faulting context for good.
pub fn reject_and_halt<R, S>(
    context: &FaultContext,
    reason: RejectReason,
    reporter: &mut R,
    control: &mut S,
    reboot: bool,
) -> !
where
    R: FaultReporter,
    S: SystemControl,
{
    log::error!(
        "page fault at {} on cpu {} rejected: {reason} ({})",
        context.address,
        context.cpu_index,
        context.error.explain()
    );
    reporter.report(context, reason);
    if reboot {
        control.warm_reset()
    } else {
        control.dead_loop()
    }
}
