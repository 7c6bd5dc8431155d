use std::{collections::HashSet, sync::Arc};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    address_space::{AddressSpace, Spaces},
    backing_store::BackingStore,
    config::VmConfig,
    error::{Result, VmError},
    fault::{self, PageFault},
    frame::{Memory, PageRef},
    page::{FileMapping, Page, PageInitializer, PageKind, SegmentLoader, VmType},
    page_replacer::{ClockReplacer, PageReplacer},
    page_table::{is_kernel_vaddr, pg_ofs, pg_round_down, PteFlags, PAGE_SIZE, USER_STACK},
    physmem::FrameId,
    spt,
    swap::SwapTable,
    Pid,
};

/// Snapshot of one page, for inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub va: usize,
    /// Current variant.
    pub vm_type: VmType,
    /// Variant after the first fault.
    pub target_type: VmType,
    pub writable: bool,
    pub stack: bool,
    pub frame: Option<FrameId>,
    pub swap_slot: Option<usize>,
}

impl PageInfo {
    fn of(page: &Page) -> Self {
        PageInfo {
            va: page.va(),
            vm_type: page.vm_type(),
            target_type: page.target_type(),
            writable: page.writable(),
            stack: page.is_stack(),
            frame: page.frame(),
            swap_slot: page.swap_slot(),
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }
}

struct VmState<R: PageReplacer> {
    mem: Memory<R>,
    spaces: Spaces,
}

/// The demand pager shared by every process.
///
/// All state sits behind one lock: allocation, eviction and frame
/// registration are a single critical section.
pub struct Vm<R: PageReplacer = ClockReplacer> {
    config: VmConfig,
    state: Mutex<VmState<R>>,
}

impl Vm<ClockReplacer> {
    pub fn new(config: VmConfig, swap_device: Box<dyn BackingStore>) -> Result<Self> {
        Vm::with_replacer(config, swap_device, ClockReplacer::new())
    }
}

impl<R: PageReplacer> Vm<R> {
    /// Fails if `swap_device` cannot hold `config.swap_slots` pages.
    pub fn with_replacer(
        config: VmConfig,
        swap_device: Box<dyn BackingStore>,
        replacer: R,
    ) -> Result<Self> {
        let swap = SwapTable::with_slots(swap_device, config.swap_slots)?;
        info!(
            "vm: {} user frames, {} swap slots",
            config.user_pool_frames, config.swap_slots
        );

        Ok(Vm {
            config,
            state: Mutex::new(VmState {
                mem: Memory::new(config.user_pool_frames, swap, replacer),
                spaces: Spaces::new(),
            }),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Creates an empty address space for `pid`.
    pub fn create_process(&self, pid: Pid) -> Result<()> {
        let mut state = self.state.lock();
        if state.spaces.contains_key(&pid) {
            return Err(VmError::ProcessExists(pid));
        }
        state.spaces.insert(pid, AddressSpace::new());
        debug!("vm: created address space for pid {}", pid);
        Ok(())
    }

    /// Gives `child` a private copy of `parent`'s address space.
    ///
    /// On failure the child has no address space at all.
    pub fn fork(&self, parent: Pid, child: Pid) -> Result<()> {
        let mut state = self.state.lock();
        let VmState { mem, spaces } = &mut *state;

        if spaces.contains_key(&child) {
            return Err(VmError::ProcessExists(child));
        }
        let user_rsp = spaces
            .get(&parent)
            .ok_or(VmError::NoSuchProcess(parent))?
            .user_rsp;

        let mut space = AddressSpace::new();
        space.user_rsp = user_rsp;
        spaces.insert(child, space);

        if let Err(e) = spt::copy(mem, spaces, child, parent) {
            spaces.remove(&child);
            return Err(e);
        }

        info!("vm: forked pid {} into pid {}", parent, child);
        Ok(())
    }

    /// Tears down `pid`'s address space. Exiting twice is harmless.
    pub fn exit(&self, pid: Pid) {
        let mut state = self.state.lock();
        let VmState { mem, spaces } = &mut *state;

        match spaces.remove(&pid) {
            Some(mut space) => {
                space.spt.kill(&mut space.page_table, mem);
                debug_assert!(space.page_table.is_empty());
                info!("vm: pid {} address space destroyed", pid);
            }
            None => debug!("vm: pid {} has no address space", pid),
        }
    }

    /// Declares a lazily loaded page at `va` that becomes `vm_type` on first touch.
    pub fn alloc_page_with_initializer(
        &self,
        pid: Pid,
        vm_type: VmType,
        va: usize,
        writable: bool,
        init: Option<Arc<dyn PageInitializer>>,
    ) -> Result<()> {
        if vm_type == VmType::Uninit {
            return Err(VmError::InvalidArgument("page type must be terminal"));
        }
        let file_backed = matches!(vm_type, VmType::File | VmType::PageCache);
        if file_backed && init.as_ref().and_then(|init| init.file_mapping()).is_none() {
            return Err(VmError::InvalidArgument("file-backed page needs a file mapping"));
        }
        check_user_page(va)?;

        let mut state = self.state.lock();
        let space = space_mut(&mut state.spaces, pid)?;
        space
            .spt
            .insert(Page::new_uninit(va, writable, vm_type, init))
    }

    pub fn alloc_page(&self, pid: Pid, vm_type: VmType, va: usize, writable: bool) -> Result<()> {
        self.alloc_page_with_initializer(pid, vm_type, va, writable, None)
    }

    /// Faults in the page at `va` right away.
    pub fn claim_page(&self, pid: Pid, va: usize) -> Result<()> {
        let mut state = self.state.lock();
        let VmState { mem, spaces } = &mut *state;
        fault::claim_page(mem, spaces, pid, va)
    }

    /// Removes the page at `va`, writing it back if needed.
    pub fn remove_page(&self, pid: Pid, va: usize) -> Result<()> {
        let mut state = self.state.lock();
        let VmState { mem, spaces } = &mut *state;
        let AddressSpace {
            spt, page_table, ..
        } = space_mut(spaces, pid)?;
        spt.remove(va, page_table, mem)
    }

    /// Entry point for the trap handler. `Ok` means the faulting access can be retried.
    pub fn try_handle_fault(&self, pid: Pid, fault: &PageFault) -> Result<()> {
        let mut state = self.state.lock();
        let VmState { mem, spaces } = &mut *state;
        fault::try_handle_fault(mem, spaces, &self.config, pid, fault)
    }

    /// Maps and claims the first stack page; returns the initial stack pointer.
    pub fn setup_stack(&self, pid: Pid) -> Result<usize> {
        let stack_bottom = USER_STACK - PAGE_SIZE;

        let mut state = self.state.lock();
        let VmState { mem, spaces } = &mut *state;

        let space = space_mut(spaces, pid)?;
        space
            .spt
            .insert(Page::new_uninit(stack_bottom, true, VmType::Anon, None).mark_stack())?;
        fault::claim_page(mem, spaces, pid, stack_bottom)?;

        space_mut(spaces, pid)?.user_rsp = Some(USER_STACK);
        Ok(USER_STACK)
    }

    /// Records the user stack pointer saved on kernel entry.
    pub fn set_stack_pointer(&self, pid: Pid, rsp: usize) -> Result<()> {
        let mut state = self.state.lock();
        space_mut(&mut state.spaces, pid)?.user_rsp = Some(rsp);
        Ok(())
    }

    /// Declares a lazily loaded segment: `read_bytes` from `file` at `ofs`
    /// followed by `zero_bytes` of zeroes, starting at `upage`.
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        pid: Pid,
        file: Arc<dyn BackingStore>,
        ofs: u64,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if (read_bytes + zero_bytes) % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument("segment size is not page aligned"));
        }
        if pg_ofs(upage) != 0 || ofs % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument("segment is not page aligned"));
        }

        let (mut read_bytes, mut zero_bytes) = (read_bytes, zero_bytes);
        let (mut ofs, mut upage) = (ofs, upage);

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;

            let loader = SegmentLoader::new(file.clone(), ofs, page_read_bytes, page_zero_bytes)?;
            self.alloc_page_with_initializer(pid, VmType::Anon, upage, writable, Some(Arc::new(loader)))?;

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            ofs += page_read_bytes as u64;
            upage += PAGE_SIZE;
        }

        Ok(())
    }

    /// Maps `length` bytes of `file` starting at `offset` to `addr`, lazily.
    pub fn mmap(
        &self,
        pid: Pid,
        addr: usize,
        length: usize,
        writable: bool,
        file: Arc<dyn BackingStore>,
        offset: u64,
    ) -> Result<usize> {
        if length == 0 {
            return Err(VmError::InvalidArgument("zero-length mapping"));
        }
        if addr == 0 || pg_ofs(addr) != 0 || offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument("mapping is not page aligned"));
        }
        let end = addr
            .checked_add(length)
            .ok_or(VmError::InvalidArgument("mapping wraps around"))?;
        if is_kernel_vaddr(end - 1) {
            return Err(VmError::InvalidArgument("mapping reaches kernel space"));
        }
        let file_len = file.len();
        if file_len <= offset {
            return Err(VmError::InvalidArgument("nothing to map past end of file"));
        }

        let mut state = self.state.lock();
        let space = space_mut(&mut state.spaces, pid)?;

        let pages = (length + PAGE_SIZE - 1) / PAGE_SIZE;
        if let Some(va) = (0..pages)
            .map(|i| addr + i * PAGE_SIZE)
            .find(|va| space.spt.find(*va).is_some())
        {
            return Err(VmError::AlreadyMapped(va));
        }

        let mut file_bytes = ((file_len - offset) as usize).min(length);
        for i in 0..pages {
            let read_bytes = file_bytes.min(PAGE_SIZE);
            let mapping = FileMapping::new(
                file.clone(),
                offset + (i * PAGE_SIZE) as u64,
                read_bytes,
                addr,
            )?;
            space.spt.insert(Page::new_uninit(
                addr + i * PAGE_SIZE,
                writable,
                VmType::File,
                Some(Arc::new(mapping)),
            ))?;
            file_bytes -= read_bytes;
        }

        debug!("vm: pid {} mapped {} pages at {:#x}", pid, pages, addr);
        Ok(addr)
    }

    /// Unmaps the whole mapping that starts at `addr`, writing dirty pages back.
    ///
    /// Every page of the mapping is removed even if a write-back fails; the
    /// first failure is returned.
    pub fn munmap(&self, pid: Pid, addr: usize) -> Result<()> {
        let mut state = self.state.lock();
        let VmState { mem, spaces } = &mut *state;
        let AddressSpace {
            spt, page_table, ..
        } = space_mut(spaces, pid)?;

        let mapping_of = |page: &Page| match page.kind() {
            PageKind::Uninit(uninit) if uninit.target() == VmType::File => {
                uninit.file_mapping().map(FileMapping::mapping_id)
            }
            PageKind::File(file) => Some(file.mapping().mapping_id()),
            _ => None,
        };

        match spt.find(addr) {
            Some(page) if page.va() == addr && mapping_of(page) == Some(addr) => {}
            _ => return Err(VmError::NotMapped(addr)),
        }

        let mut va = addr;
        let mut result = Ok(());
        while spt.find(va).and_then(mapping_of) == Some(addr) {
            if let Err(e) = spt.remove(va, page_table, mem) {
                warn!("vm: pid {} lost write-back of {:#x}: {}", pid, va, e);
                result = result.and(Err(e));
            }
            va += PAGE_SIZE;
        }

        debug!("vm: pid {} unmapped {:#x}..{:#x}", pid, addr, va);
        result
    }

    /// Copies user memory at `addr` into `buf`, faulting pages in as a CPU would.
    pub fn read_user(&self, pid: Pid, addr: usize, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        let mut done = 0;

        while done < buf.len() {
            let cur = addr + done;
            let ofs = pg_ofs(cur);
            let n = (PAGE_SIZE - ofs).min(buf.len() - done);

            let kva = state.translate(&self.config, pid, cur, false)?;
            buf[done..done + n].copy_from_slice(&state.mem.phys.frame(kva)[ofs..ofs + n]);
            done += n;
        }

        Ok(())
    }

    /// Copies `data` into user memory at `addr`, faulting pages in as a CPU would.
    pub fn write_user(&self, pid: Pid, addr: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let mut done = 0;

        while done < data.len() {
            let cur = addr + done;
            let ofs = pg_ofs(cur);
            let n = (PAGE_SIZE - ofs).min(data.len() - done);

            let kva = state.translate(&self.config, pid, cur, true)?;
            state.mem.phys.frame_mut(kva)[ofs..ofs + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }

        Ok(())
    }

    pub fn page_info(&self, pid: Pid, va: usize) -> Option<PageInfo> {
        let state = self.state.lock();
        state.spaces.get(&pid)?.spt.find(va).map(PageInfo::of)
    }

    pub fn page_count(&self, pid: Pid) -> Option<usize> {
        let state = self.state.lock();
        state.spaces.get(&pid).map(|space| space.spt.len())
    }

    /// Frames currently registered in the frame table.
    pub fn resident_frames(&self) -> usize {
        self.state.lock().mem.frames.len()
    }

    /// Frames left in the user pool.
    pub fn free_frames(&self) -> usize {
        self.state.lock().mem.phys.free_count()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.state.lock().mem.swap.slots_in_use()
    }

    pub fn evictions(&self) -> u64 {
        self.state.lock().mem.evictions
    }

    /// Checks the frame/page bijection and the frame accounting.
    pub fn check_invariants(&self) -> core::result::Result<(), String> {
        let state = self.state.lock();
        let VmState { mem, spaces } = &*state;

        let mut owners = HashSet::new();
        for frame in mem.frames.iter() {
            let kva = frame.kva();
            let owner = frame
                .page()
                .ok_or_else(|| format!("{} is registered but backs no page", kva))?;
            if !owners.insert(owner) {
                return Err(format!("{:?} is backed by more than one frame", owner));
            }

            let space = spaces
                .get(&owner.pid)
                .ok_or_else(|| format!("{} belongs to dead pid {}", kva, owner.pid))?;
            let page = space
                .spt
                .find(owner.va)
                .ok_or_else(|| format!("{} backs unknown page {:#x}", kva, owner.va))?;
            if page.frame() != Some(kva) {
                return Err(format!(
                    "{} points at page {:#x} which points at {:?}",
                    kva,
                    owner.va,
                    page.frame()
                ));
            }
            if space.page_table.get_mapping(owner.va) != Some(kva) {
                return Err(format!("page {:#x} is not mapped to {}", owner.va, kva));
            }
        }

        for (pid, space) in spaces {
            for page in space.spt.iter() {
                if let Some(kva) = page.frame() {
                    let expected = PageRef {
                        pid: *pid,
                        va: page.va(),
                    };
                    if mem.frames.owner(kva) != Some(expected) {
                        return Err(format!("page {:?} claims {} but the frame disagrees", expected, kva));
                    }
                }
            }
        }

        let frame_count = mem.phys.frame_count();
        if mem.frames.len() + mem.phys.free_count() != frame_count {
            return Err(format!(
                "{} registered + {} free != {} frames",
                mem.frames.len(),
                mem.phys.free_count(),
                frame_count
            ));
        }

        Ok(())
    }
}

impl<R: PageReplacer> VmState<R> {
    /// Resolves `addr` to a frame the way the MMU would, raising a page fault on a miss.
    fn translate(&mut self, config: &VmConfig, pid: Pid, addr: usize, write: bool) -> Result<FrameId> {
        let VmState { mem, spaces } = self;
        let space = spaces.get(&pid).ok_or(VmError::NoSuchProcess(pid))?;

        let not_present = match space.page_table.get(addr) {
            Some(entry) if write && !entry.flags.contains(PteFlags::WRITABLE) => Some(false),
            Some(_) => None,
            None => Some(true),
        };

        if let Some(not_present) = not_present {
            let fault = PageFault {
                addr,
                user: true,
                write,
                not_present,
                // 0 is outside the stack, so an unknown rsp never grows it
                rsp: space.user_rsp.unwrap_or(0),
            };
            fault::try_handle_fault(mem, spaces, config, pid, &fault)?;
        }

        let page_table = &mut space_mut(spaces, pid)?.page_table;
        let kva = page_table.get_mapping(addr).ok_or(VmError::NotMapped(addr))?;
        page_table.set_accessed(addr, true);
        if write {
            page_table.set_dirty(addr, true);
        }

        Ok(kva)
    }
}

fn space_mut(spaces: &mut Spaces, pid: Pid) -> Result<&mut AddressSpace> {
    spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess(pid))
}

fn check_user_page(va: usize) -> Result<()> {
    if pg_ofs(va) != 0 {
        return Err(VmError::InvalidArgument("address is not page aligned"));
    }
    if pg_round_down(va) == 0 || is_kernel_vaddr(va) {
        return Err(VmError::InvalidArgument("address is not a user page"));
    }
    Ok(())
}

impl<R: PageReplacer> Drop for Vm<R> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let live = state.spaces.len();
        if live > 0 {
            debug!("vm: dropped with {} live address spaces", live);
        }
    }
}
