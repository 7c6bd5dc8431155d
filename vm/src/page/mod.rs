//! Virtual pages and their variant-specific behavior.
//!
//! Every page starts out [`PageKind::Uninit`]. The first fault turns it into its
//! terminal variant by replacing the enum value; after that the variant decides
//! how the page is read in, written out and torn down.

mod anon;
mod file;
mod uninit;

use std::{fmt, sync::Arc};


pub use anon::AnonPage;
pub use file::{FileMapping, FilePage, PageCachePage};
pub use uninit::{PageInitializer, SegmentLoader, UninitPage};

use crate::{error::Result, physmem::FrameId, swap::SwapTable};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VmType {
    /// Not faulted in yet.
    Uninit,
    /// Not related to any file; evicted to swap.
    Anon,
    /// Backed by a mapped file.
    File,
    /// Holds one cached block of a backing store.
    PageCache,
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmType::Uninit => "uninit",
            VmType::Anon => "anon",
            VmType::File => "file",
            VmType::PageCache => "page-cache",
        };
        f.write_str(s)
    }
}

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
    PageCache(PageCachePage),
}

pub struct Page {
    va: usize,
    writable: bool,
    /// Part of the stack; set for the initial stack page and grown pages.
    stack: bool,
    pub(crate) frame: Option<FrameId>,
    kind: PageKind,
}

impl Page {
    /// Creates a page that becomes `target` on first fault.
    ///
    /// `va` must be page aligned and `target` must not be [`VmType::Uninit`].
    pub fn new_uninit(
        va: usize,
        writable: bool,
        target: VmType,
        init: Option<Arc<dyn PageInitializer>>,
    ) -> Self {
        debug_assert_ne!(target, VmType::Uninit);

        Page {
            va,
            writable,
            stack: false,
            frame: None,
            kind: PageKind::Uninit(UninitPage::new(target, init)),
        }
    }

    pub(crate) fn mark_stack(mut self) -> Self {
        self.stack = true;
        self
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_stack(&self) -> bool {
        self.stack
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// The variant the page currently is.
    pub fn vm_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(_) => VmType::Uninit,
            PageKind::Anon(_) => VmType::Anon,
            PageKind::File(_) => VmType::File,
            PageKind::PageCache(_) => VmType::PageCache,
        }
    }

    /// The variant the page is or will become after its first fault.
    pub fn target_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.target(),
            _ => self.vm_type(),
        }
    }

    pub fn swap_slot(&self) -> Option<usize> {
        match &self.kind {
            PageKind::Anon(anon) => anon.swap_slot(),
            _ => None,
        }
    }

    /// Same-address mapping for a forked child, never resident.
    ///
    /// Uninit pages share their initializer; terminal pages keep their backing
    /// descriptor but not their swap slot or frame.
    pub(crate) fn duplicate(&self) -> Page {
        let kind = match &self.kind {
            PageKind::Uninit(uninit) => PageKind::Uninit(uninit.clone()),
            PageKind::Anon(_) => PageKind::Anon(AnonPage::new()),
            PageKind::File(file) => PageKind::File(FilePage::new(file.mapping().clone())),
            PageKind::PageCache(cache) => {
                PageKind::PageCache(PageCachePage::new(cache.mapping().clone()))
            }
        };

        Page {
            va: self.va,
            writable: self.writable,
            stack: self.stack,
            frame: None,
            kind,
        }
    }

    /// Fills `kva` with the page's contents, transmuting an uninit page first.
    pub fn swap_in(&mut self, kva: &mut [u8], swap: &mut SwapTable) -> Result<()> {
        if matches!(self.kind, PageKind::Uninit(_)) {
            return uninit::initialize(self, kva);
        }

        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!(),
            PageKind::Anon(anon) => anon.swap_in(kva, swap),
            PageKind::File(file) => file.swap_in(self.va, kva),
            PageKind::PageCache(cache) => cache.swap_in(self.va, kva),
        }
    }

    /// Persists the contents of `kva` so the frame can be reused.
    pub fn swap_out(&mut self, kva: &[u8], dirty: bool, swap: &mut SwapTable) -> Result<()> {
        match &mut self.kind {
            // never resident, so nothing to save
            PageKind::Uninit(_) => Ok(()),
            PageKind::Anon(anon) => anon.swap_out(kva, swap),
            PageKind::File(file) => file.swap_out(self.va, kva, dirty),
            PageKind::PageCache(cache) => cache.swap_out(self.va, kva),
        }
    }

    /// Variant teardown. `kva` holds the contents if the page was resident.
    ///
    /// Fails only when a file-backed page cannot be written back.
    pub fn destroy(&mut self, kva: Option<&[u8]>, dirty: bool, swap: &mut SwapTable) -> Result<()> {
        match &mut self.kind {
            PageKind::Uninit(_) => Ok(()),
            PageKind::Anon(anon) => {
                anon.destroy(swap);
                Ok(())
            }
            PageKind::File(file) => file.destroy(self.va, kva, dirty),
            PageKind::PageCache(cache) => cache.destroy(self.va, kva),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &format_args!("{:#x}", self.va))
            .field("type", &self.vm_type())
            .field("target", &self.target_type())
            .field("writable", &self.writable)
            .field("frame", &self.frame)
            .finish()
    }
}
