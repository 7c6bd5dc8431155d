use std::{mem, sync::Arc};

use log::debug;

use super::{AnonPage, FileMapping, FilePage, Page, PageCachePage, PageKind, VmType};
use crate::{
    backing_store::BackingStore,
    error::{Result, VmError},
    page_table::PAGE_SIZE,
};

/// Fills a freshly transmuted page on its first fault.
///
/// Whatever the initializer needs (file, offset, byte counts) lives in the
/// implementing type. Initializers are shared between a parent and its forked
/// children, so they must not carry mutable state.
pub trait PageInitializer: Send + Sync {
    fn initialize(&self, page: &Page, kva: &mut [u8]) -> Result<()>;

    /// The file mapping a file-backed or page-cache page is built from.
    fn file_mapping(&self) -> Option<&FileMapping> {
        None
    }
}

#[derive(Clone)]
pub struct UninitPage {
    target: VmType,
    init: Option<Arc<dyn PageInitializer>>,
}

impl UninitPage {
    pub(super) fn new(target: VmType, init: Option<Arc<dyn PageInitializer>>) -> Self {
        UninitPage { target, init }
    }

    pub fn target(&self) -> VmType {
        self.target
    }

    pub fn file_mapping(&self) -> Option<&FileMapping> {
        self.init.as_deref().and_then(|init| init.file_mapping())
    }
}

/// Turns `page` into its terminal variant and runs the lazy initializer.
pub(super) fn initialize(page: &mut Page, kva: &mut [u8]) -> Result<()> {
    let PageKind::Uninit(uninit) = &page.kind else {
        unreachable!("page {:#x} is already initialized", page.va);
    };

    let init = uninit.init.clone();
    let target = uninit.target;
    let va = page.va;

    let lazy_load = |source: VmError| VmError::LazyLoad {
        va,
        source: Box::new(source),
    };

    let uninit = mem::replace(
        &mut page.kind,
        transmute(target, init.as_deref()).map_err(lazy_load)?,
    );
    debug!("page {:#x}: transmuted to {}", va, target);

    if let Some(init) = init {
        if let Err(e) = init.initialize(page, kva) {
            // back to uninit so the next fault starts over
            page.kind = uninit;
            return Err(lazy_load(e));
        }
    }

    Ok(())
}

fn transmute(target: VmType, init: Option<&dyn PageInitializer>) -> Result<PageKind> {
    let mapping = || {
        init.and_then(|init| init.file_mapping())
            .cloned()
            .ok_or(VmError::InvalidArgument("file-backed page without a file mapping"))
    };

    match target {
        VmType::Anon => Ok(PageKind::Anon(AnonPage::new())),
        VmType::File => Ok(PageKind::File(FilePage::new(mapping()?))),
        VmType::PageCache => Ok(PageKind::PageCache(PageCachePage::new(mapping()?))),
        VmType::Uninit => Err(VmError::InvalidArgument("uninit is not a terminal page type")),
    }
}

/// Loads one page of an executable segment: `read_bytes` from `file` at
/// `offset`, the remaining `zero_bytes` zeroed.
pub struct SegmentLoader {
    file: Arc<dyn BackingStore>,
    offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
}

impl SegmentLoader {
    /// Fails unless `read_bytes` and `zero_bytes` add up to exactly one page.
    pub fn new(
        file: Arc<dyn BackingStore>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_SIZE) {
            return Err(VmError::InvalidArgument("segment page is not one page long"));
        }

        Ok(SegmentLoader {
            file,
            offset,
            read_bytes,
            zero_bytes,
        })
    }
}

impl PageInitializer for SegmentLoader {
    fn initialize(&self, page: &Page, kva: &mut [u8]) -> Result<()> {
        let (data, zeroes) = kva.split_at_mut(self.read_bytes);

        let n = self.file.read_at(self.offset, data)?;
        if n != self.read_bytes {
            return Err(VmError::Truncated {
                va: page.va(),
                expected: self.read_bytes,
                got: n,
            });
        }
        debug_assert_eq!(zeroes.len(), self.zero_bytes);
        zeroes.fill(0);

        Ok(())
    }
}
