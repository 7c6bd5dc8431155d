//! Reclaiming a frame from whichever page the replacement policy picks.

use log::{debug, trace, warn};

use crate::{
    address_space::Spaces,
    error::{Result, VmError},
    frame::Memory,
    page_replacer::{FrameEvent, PageReplacer},
    physmem::FrameId,
};

impl<R: PageReplacer> Memory<R> {
    /// Evicts one page and puts its frame back into the pool.
    pub(crate) fn evict_frame(&mut self, spaces: &mut Spaces) -> Result<()> {
        let frames = &self.frames;
        let victim = self
            .replacer
            .pick_victim(&mut |kva| {
                // registered but not claimed yet: someone is filling it
                let owner = frames.owner(kva)?;
                let page_table = &mut spaces.get_mut(&owner.pid)?.page_table;

                let accessed = page_table.is_accessed(owner.va);
                if accessed {
                    page_table.set_accessed(owner.va, false);
                }
                Some(accessed)
            })
            .ok_or(VmError::OutOfMemory)?;

        if let Err(e) = self.swap_out_victim(victim, spaces) {
            warn!("evict: could not write back {}: {}", victim, e);
            // still resident, so it goes back on the clock
            self.replacer.page_event(FrameEvent::Registered(victim));
            return Err(e);
        }

        self.evictions += 1;
        Ok(())
    }

    fn swap_out_victim(&mut self, victim: FrameId, spaces: &mut Spaces) -> Result<()> {
        let owner = self.frames.owner(victim).ok_or(VmError::OutOfMemory)?;
        let space = spaces
            .get_mut(&owner.pid)
            .ok_or(VmError::NoSuchProcess(owner.pid))?;
        let page = space
            .spt
            .find_mut(owner.va)
            .ok_or(VmError::NotMapped(owner.va))?;
        debug_assert_eq!(page.frame(), Some(victim));

        let dirty = space.page_table.is_dirty(owner.va);
        trace!(
            "evict: pid {} page {:#x} ({}, dirty={})",
            owner.pid,
            owner.va,
            page.vm_type(),
            dirty
        );

        page.swap_out(self.phys.frame(victim), dirty, &mut self.swap)?;

        // contents are safe; now break the link both ways
        space.page_table.clear_mapping(owner.va);
        page.frame = None;
        self.frames.unlink(victim);
        self.frames.unregister(victim);
        self.phys.release(victim);

        debug!(
            "evict: reclaimed {} from pid {} page {:#x}",
            victim, owner.pid, owner.va
        );
        Ok(())
    }
}
