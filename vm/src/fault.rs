//! Page-fault resolution: validate, look up (or grow the stack), claim a
//! frame, populate it and install the translation.

use log::{debug, warn};

use crate::{
    address_space::{AddressSpace, Spaces},
    config::VmConfig,
    error::{FaultReason, Result, VmError},
    frame::{Memory, PageRef},
    page::{Page, VmType},
    page_replacer::PageReplacer,
    page_table::{is_kernel_vaddr, pg_round_down, USER_STACK},
    physmem::FrameId,
    Pid,
};

/// What the trap handler knows about a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address as reported by the hardware.
    pub addr: usize,
    /// Raised while running in user mode.
    pub user: bool,
    pub write: bool,
    /// No translation existed. Clear for protection faults on present pages.
    pub not_present: bool,
    /// Stack pointer at the time of the fault (meaningful for user faults only).
    pub rsp: usize,
}

fn invalid(fault: &PageFault, reason: FaultReason) -> VmError {
    VmError::InvalidFault {
        addr: fault.addr,
        reason,
    }
}

fn validate(fault: &PageFault) -> Result<()> {
    if pg_round_down(fault.addr) == 0 {
        return Err(invalid(fault, FaultReason::NullAddress));
    }
    if is_kernel_vaddr(fault.addr) {
        return Err(invalid(fault, FaultReason::KernelAddress));
    }
    // no copy-on-write or write-protect handling: a fault on a present page is final
    if !fault.not_present {
        return Err(invalid(fault, FaultReason::ProtectionViolation));
    }
    Ok(())
}

/// Whether an access to `addr` with stack pointer `rsp` may grow the stack.
///
/// Without a stack pointer, or with one outside the stack region, nothing grows.
pub fn is_stack_growth(addr: usize, rsp: Option<usize>, config: &VmConfig) -> bool {
    let stack_bottom = USER_STACK.saturating_sub(config.stack_limit);
    let Some(rsp) = rsp.filter(|rsp| (stack_bottom..=USER_STACK).contains(rsp)) else {
        return false;
    };
    (stack_bottom..USER_STACK).contains(&addr) && addr >= rsp.saturating_sub(config.stack_slack)
}

fn grow_stack(space: &mut AddressSpace, va: usize) -> Result<()> {
    debug!("fault: growing stack to {:#x}", va);
    space
        .spt
        .insert(Page::new_uninit(va, true, VmType::Anon, None).mark_stack())
}

pub(crate) fn try_handle_fault<R: PageReplacer>(
    mem: &mut Memory<R>,
    spaces: &mut Spaces,
    config: &VmConfig,
    pid: Pid,
    fault: &PageFault,
) -> Result<()> {
    let res = resolve(mem, spaces, config, pid, fault);
    if let Err(e) = &res {
        warn!("fault: pid {} at {:#x} not handled: {}", pid, fault.addr, e);
    }
    res
}

fn resolve<R: PageReplacer>(
    mem: &mut Memory<R>,
    spaces: &mut Spaces,
    config: &VmConfig,
    pid: Pid,
    fault: &PageFault,
) -> Result<()> {
    validate(fault)?;

    let va = pg_round_down(fault.addr);
    let space = spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess(pid))?;

    match space.spt.find(va) {
        Some(page) if fault.write && !page.writable() => {
            return Err(invalid(fault, FaultReason::WriteToReadOnly));
        }
        Some(_) => {}
        None => {
            let rsp = if fault.user { Some(fault.rsp) } else { space.user_rsp };
            if !is_stack_growth(fault.addr, rsp, config) {
                return Err(invalid(fault, FaultReason::Unmapped));
            }
            grow_stack(space, va)?;
        }
    }

    claim_page(mem, spaces, pid, va)
}

/// Gives the page at `va` a frame, fills it and maps it.
pub(crate) fn claim_page<R: PageReplacer>(
    mem: &mut Memory<R>,
    spaces: &mut Spaces,
    pid: Pid,
    va: usize,
) -> Result<()> {
    let va = pg_round_down(va);
    let page = spaces
        .get(&pid)
        .ok_or(VmError::NoSuchProcess(pid))?
        .spt
        .find(va)
        .ok_or(VmError::NotMapped(va))?;
    if page.is_resident() {
        return Ok(());
    }

    let kva = mem.get_frame(spaces)?;
    if let Err(e) = populate_and_map(mem, spaces, pid, va, kva) {
        mem.free_frame(kva);
        return Err(e);
    }

    debug!("fault: pid {} page {:#x} claimed {}", pid, va, kva);
    Ok(())
}

fn populate_and_map<R: PageReplacer>(
    mem: &mut Memory<R>,
    spaces: &mut Spaces,
    pid: Pid,
    va: usize,
    kva: FrameId,
) -> Result<()> {
    let space = spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess(pid))?;
    let page = space.spt.find_mut(va).ok_or(VmError::NotMapped(va))?;

    mem.frames.link(kva, PageRef { pid, va });
    page.frame = Some(kva);

    let mut res = page.swap_in(mem.phys.frame_mut(kva), &mut mem.swap);
    if res.is_ok() {
        res = space
            .page_table
            .set_mapping(va, kva, page.writable())
            .map_err(|_| VmError::AlreadyMapped(va));
    }

    if res.is_err() {
        page.frame = None;
        mem.frames.unlink(kva);
    }
    res
}
