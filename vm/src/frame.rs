//! The frame table and the user-frame allocator.
//!
//! A frame is registered here from the moment it is handed out by
//! [`Memory::get_frame`] until it goes back to the pool. While registered it
//! backs at most one page, named by [`PageRef`]; the page names the frame back
//! through [`Page::frame`](crate::page::Page::frame).

use log::{debug, error};

use crate::{
    address_space::Spaces,
    error::{Result, VmError},
    page_replacer::{FrameEvent, PageReplacer},
    physmem::{FrameId, PhysicalMemory},
    swap::SwapTable,
    Pid,
};

/// The page a frame backs: owning process and page-aligned address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub pid: Pid,
    pub va: usize,
}

#[derive(Debug)]
pub struct Frame {
    kva: FrameId,
    page: Option<PageRef>,
}

impl Frame {
    pub fn kva(&self) -> FrameId {
        self.kva
    }

    pub fn page(&self) -> Option<PageRef> {
        self.page
    }
}

pub struct FrameTable {
    slots: Vec<Option<Frame>>,
    len: usize,
}

impl FrameTable {
    pub fn new(frame_count: usize) -> Self {
        FrameTable {
            slots: (0..frame_count).map(|_| None).collect(),
            len: 0,
        }
    }

    pub(crate) fn register(&mut self, kva: FrameId) {
        let slot = &mut self.slots[kva.0];
        assert!(slot.is_none(), "{} registered twice", kva);
        *slot = Some(Frame { kva, page: None });
        self.len += 1;
    }

    pub(crate) fn unregister(&mut self, kva: FrameId) -> Option<Frame> {
        let frame = self.slots[kva.0].take()?;
        self.len -= 1;
        Some(frame)
    }

    /// Points `kva` at `page`. The frame must be registered and unowned.
    pub(crate) fn link(&mut self, kva: FrameId, page: PageRef) {
        let frame = self.slots[kva.0]
            .as_mut()
            .unwrap_or_else(|| panic!("linking unregistered {}", kva));
        assert!(frame.page.is_none(), "{} already backs {:?}", kva, frame.page);
        frame.page = Some(page);
    }

    pub(crate) fn unlink(&mut self, kva: FrameId) {
        if let Some(frame) = self.slots[kva.0].as_mut() {
            frame.page = None;
        }
    }

    pub fn owner(&self, kva: FrameId) -> Option<PageRef> {
        self.slots.get(kva.0)?.as_ref()?.page
    }

    pub fn contains(&self, kva: FrameId) -> bool {
        matches!(self.slots.get(kva.0), Some(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.slots.iter().flatten()
    }
}

/// Everything behind the process-wide frame lock: the user pool, the frame
/// table, the replacement policy and the swap area.
pub struct Memory<R: PageReplacer> {
    pub(crate) phys: PhysicalMemory,
    pub(crate) frames: FrameTable,
    pub(crate) replacer: R,
    pub(crate) swap: SwapTable,
    pub(crate) evictions: u64,
}

impl<R: PageReplacer> Memory<R> {
    pub fn new(frame_count: usize, swap: SwapTable, replacer: R) -> Self {
        Memory {
            phys: PhysicalMemory::new(frame_count),
            frames: FrameTable::new(frame_count),
            replacer,
            swap,
            evictions: 0,
        }
    }

    /// Hands out a zeroed, registered frame that backs no page yet.
    ///
    /// An empty pool triggers exactly one eviction and one retry; failing
    /// that, the pool is really exhausted and `OutOfMemory` is returned.
    pub(crate) fn get_frame(&mut self, spaces: &mut Spaces) -> Result<FrameId> {
        let kva = match self.phys.acquire() {
            Some(kva) => kva,
            None => {
                if let Err(e) = self.evict_frame(spaces) {
                    error!("frame: eviction failed: {}", e);
                    return Err(VmError::OutOfMemory);
                }
                self.phys.acquire().ok_or(VmError::OutOfMemory)?
            }
        };

        self.frames.register(kva);
        self.replacer.page_event(FrameEvent::Registered(kva));
        debug!("frame: handed out {}", kva);

        Ok(kva)
    }

    /// Unregisters `kva` and returns it to the pool. The frame must be unlinked.
    pub(crate) fn free_frame(&mut self, kva: FrameId) {
        if let Some(frame) = self.frames.unregister(kva) {
            debug_assert!(frame.page.is_none(), "freeing {} while it backs a page", kva);
            self.replacer.page_event(FrameEvent::Released(kva));
        }
        self.phys.release(kva);
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }
}
