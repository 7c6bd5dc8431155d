//! Per-process address translation: the software stand-in for the hardware
//! page table the pager installs mappings into.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::physmem::FrameId;

/// Size of a page (and of a frame) in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Top of the user stack; the first stack page sits right below it.
pub const USER_STACK: usize = 0x4748_0000;
/// First kernel virtual address. Everything below is user space.
pub const KERN_BASE: usize = 0x80_0400_0000;

/// Rounds `va` down to the start of its page.
pub const fn pg_round_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Offset of `va` within its page.
pub const fn pg_ofs(va: usize) -> usize {
    va & (PAGE_SIZE - 1)
}

pub const fn is_kernel_vaddr(va: usize) -> bool {
    va >= KERN_BASE
}

pub const fn is_user_vaddr(va: usize) -> bool {
    !is_kernel_vaddr(va)
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in a translation entry.
    pub struct PteFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const ACCESSED = 1 << 2;
        const DIRTY = 1 << 3;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PageTableEntry {
    pub frame: FrameId,
    pub flags: PteFlags,
}

/// Error returned by [`PageTable::set_mapping`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    Unaligned,
    KernelAddress,
    /// The page already has a translation.
    Overlap,
}

#[derive(Default)]
pub struct PageTable {
    table: HashMap<usize, PageTableEntry>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            table: HashMap::new(),
        }
    }

    /// Installs a translation from `va` to `frame`.
    pub fn set_mapping(&mut self, va: usize, frame: FrameId, writable: bool) -> Result<(), MapError> {
        if pg_ofs(va) != 0 {
            return Err(MapError::Unaligned);
        }
        if is_kernel_vaddr(va) {
            return Err(MapError::KernelAddress);
        }
        if self.table.contains_key(&va) {
            return Err(MapError::Overlap);
        }

        let mut flags = PteFlags::PRESENT;
        flags.set(PteFlags::WRITABLE, writable);
        self.table.insert(va, PageTableEntry { frame, flags });

        Ok(())
    }

    /// Frame currently backing the page containing `va`, if any.
    pub fn get_mapping(&self, va: usize) -> Option<FrameId> {
        self.get(va).map(|entry| entry.frame)
    }

    pub fn get(&self, va: usize) -> Option<PageTableEntry> {
        self.table.get(&pg_round_down(va)).copied()
    }

    /// Drops the translation for the page containing `va`, returning the old entry.
    pub fn clear_mapping(&mut self, va: usize) -> Option<PageTableEntry> {
        self.table.remove(&pg_round_down(va))
    }

    pub fn is_writable(&self, va: usize) -> bool {
        self.has_flag(va, PteFlags::WRITABLE)
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.has_flag(va, PteFlags::ACCESSED)
    }

    pub fn set_accessed(&mut self, va: usize, accessed: bool) {
        self.set_flag(va, PteFlags::ACCESSED, accessed);
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.has_flag(va, PteFlags::DIRTY)
    }

    pub fn set_dirty(&mut self, va: usize, dirty: bool) {
        self.set_flag(va, PteFlags::DIRTY, dirty);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn has_flag(&self, va: usize, flag: PteFlags) -> bool {
        self.get(va).map_or(false, |entry| entry.flags.contains(flag))
    }

    fn set_flag(&mut self, va: usize, flag: PteFlags, value: bool) {
        if let Some(entry) = self.table.get_mut(&pg_round_down(va)) {
            entry.flags.set(flag, value);
        }
    }
}
