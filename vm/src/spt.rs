//! Supplemental page table: every page a process has declared, resident or not.

use std::{
    collections::HashMap,
    hash::{BuildHasherDefault, Hasher},
};

use log::{debug, warn};

use crate::{
    address_space::{AddressSpace, Spaces},
    error::{Result, VmError},
    frame::{Memory, PageRef},
    page::{Page, PageKind, VmType},
    page_replacer::PageReplacer,
    page_table::{pg_round_down, PageTable, PAGE_SIZE},
    Pid,
};

const FNV_64_PRIME: u64 = 0x0000_0100_0000_01B3;
const FNV_64_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// Fowler-Noll-Vo hash over the bytes of a virtual address.
pub struct VaHasher(u64);

impl Default for VaHasher {
    fn default() -> Self {
        VaHasher(FNV_64_BASIS)
    }
}

impl Hasher for VaHasher {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = self.0.wrapping_mul(FNV_64_PRIME) ^ u64::from(*byte);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type VaBuildHasher = BuildHasherDefault<VaHasher>;

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: HashMap<usize, Page, VaBuildHasher>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable {
            pages: HashMap::default(),
        }
    }

    /// The page containing `va`; the offset bits are ignored.
    pub fn find(&self, va: usize) -> Option<&Page> {
        self.pages.get(&pg_round_down(va))
    }

    pub fn find_mut(&mut self, va: usize) -> Option<&mut Page> {
        self.pages.get_mut(&pg_round_down(va))
    }

    /// Adds `page`, refusing to replace an existing page at the same address.
    pub fn insert(&mut self, page: Page) -> Result<()> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::AlreadyMapped(va));
        }
        self.pages.insert(va, page);
        Ok(())
    }

    /// Removes and destroys the page containing `va`, releasing its frame.
    pub fn remove<R: PageReplacer>(
        &mut self,
        va: usize,
        page_table: &mut PageTable,
        mem: &mut Memory<R>,
    ) -> Result<()> {
        let page = self
            .pages
            .remove(&pg_round_down(va))
            .ok_or(VmError::NotMapped(va))?;
        destroy_page(page, page_table, mem)
    }

    /// Destroys every page, returning resident frames to the pool.
    ///
    /// A failed write-back is logged and the teardown goes on.
    pub fn kill<R: PageReplacer>(&mut self, page_table: &mut PageTable, mem: &mut Memory<R>) {
        let count = self.pages.len();
        for (va, page) in self.pages.drain() {
            if let Err(e) = destroy_page(page, page_table, mem) {
                warn!("spt: page {:#x} lost on teardown: {}", va, e);
            }
        }
        debug!("spt: destroyed {} pages", count);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }
}

/// Detaches the frame (if any), runs the variant teardown and drops the page.
///
/// The frame goes back to the pool even when the teardown fails.
fn destroy_page<R: PageReplacer>(
    mut page: Page,
    page_table: &mut PageTable,
    mem: &mut Memory<R>,
) -> Result<()> {
    match page.frame.take() {
        Some(kva) => {
            let va = page.va();
            let dirty = page_table.is_dirty(va);
            page_table.clear_mapping(va);
            mem.frames.unlink(kva);

            let res = page.destroy(Some(mem.phys.frame(kva)), dirty, &mut mem.swap);
            mem.free_frame(kva);
            res
        }
        None => page.destroy(None, false, &mut mem.swap),
    }
}

/// Duplicates `src`'s address space into `dst`, which must exist.
///
/// Never-faulted pages share their initializer. Every other page gets its own
/// frame holding a copy of the parent's current contents. On failure every
/// page already copied into `dst` is destroyed.
pub(crate) fn copy<R: PageReplacer>(
    mem: &mut Memory<R>,
    spaces: &mut Spaces,
    dst: Pid,
    src: Pid,
) -> Result<()> {
    let vas: Vec<usize> = spaces
        .get(&src)
        .ok_or(VmError::NoSuchProcess(src))?
        .spt
        .pages
        .keys()
        .copied()
        .collect();
    if !spaces.contains_key(&dst) {
        return Err(VmError::NoSuchProcess(dst));
    }

    for va in vas {
        if let Err(e) = copy_page(mem, spaces, dst, src, va) {
            warn!("spt: copying page {:#x} from pid {} failed: {}", va, src, e);
            if let Some(AddressSpace { spt, page_table, .. }) = spaces.get_mut(&dst) {
                spt.kill(page_table, mem);
            }
            return Err(VmError::Fork {
                va,
                source: Box::new(e),
            });
        }
    }

    debug!("spt: copied pid {} into pid {}", src, dst);
    Ok(())
}

fn copy_page<R: PageReplacer>(
    mem: &mut Memory<R>,
    spaces: &mut Spaces,
    dst: Pid,
    src: Pid,
    va: usize,
) -> Result<()> {
    let parent = spaces.get(&src).ok_or(VmError::NoSuchProcess(src))?;
    let parent_page = parent.spt.find(va).ok_or(VmError::NotMapped(va))?;
    let child_page = parent_page.duplicate();

    if parent_page.vm_type() == VmType::Uninit {
        return space_mut(spaces, dst)?.spt.insert(child_page);
    }

    // the parent is quiesced, so this snapshot stays valid even if the
    // allocation below evicts the parent's page
    let mut contents = vec![0u8; PAGE_SIZE];
    read_contents(parent_page, mem, &mut contents)?;
    let dirty = parent_page.is_resident() && parent.page_table.is_dirty(va);

    space_mut(spaces, dst)?.spt.insert(child_page)?;

    let kva = mem.get_frame(spaces)?;
    mem.phys.frame_mut(kva).copy_from_slice(&contents);

    let child = match spaces.get_mut(&dst) {
        Some(child) => child,
        None => {
            mem.free_frame(kva);
            return Err(VmError::NoSuchProcess(dst));
        }
    };
    let (page, page_table) = (child.spt.find_mut(va), &mut child.page_table);
    let page = match page {
        Some(page) => page,
        None => {
            mem.free_frame(kva);
            return Err(VmError::NotMapped(va));
        }
    };

    if page_table.set_mapping(va, kva, page.writable()).is_err() {
        mem.free_frame(kva);
        return Err(VmError::AlreadyMapped(va));
    }
    page_table.set_dirty(va, dirty);
    mem.frames.link(kva, PageRef { pid: dst, va });
    page.frame = Some(kva);

    Ok(())
}

/// Current contents of a terminal page, wherever they live right now.
fn read_contents<R: PageReplacer>(page: &Page, mem: &Memory<R>, buf: &mut [u8]) -> Result<()> {
    if let Some(kva) = page.frame() {
        buf.copy_from_slice(mem.phys.frame(kva));
        return Ok(());
    }

    match page.kind() {
        PageKind::Anon(anon) => match anon.swap_slot() {
            Some(slot) => mem.swap.read_slot(slot, buf),
            None => {
                buf.fill(0);
                Ok(())
            }
        },
        PageKind::File(file) => file.mapping().read_into(page.va(), buf),
        PageKind::PageCache(cache) => cache.mapping().read_into(page.va(), buf),
        PageKind::Uninit(_) => unreachable!("uninit pages are shared, not copied"),
    }
}

fn space_mut(spaces: &mut Spaces, pid: Pid) -> Result<&mut AddressSpace> {
    spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess(pid))
}

#[cfg(test)]
mod test {
    use std::hash::Hash;

    use proptest::prelude::*;

    use super::*;

    fn anon(va: usize) -> Page {
        Page::new_uninit(va, true, VmType::Anon, None)
    }

    #[test]
    fn find_masks_offset_bits() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(anon(0x1000)).unwrap();

        assert_eq!(spt.find(0x1abc).map(Page::va), Some(0x1000));
        assert!(spt.find(0x2000).is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(Page::new_uninit(0x1000, false, VmType::Anon, None))
            .unwrap();

        let err = spt.insert(anon(0x1000)).unwrap_err();
        assert!(matches!(err, VmError::AlreadyMapped(0x1000)));
        assert_eq!(spt.len(), 1);
        // the original page is untouched
        assert!(!spt.find(0x1000).unwrap().writable());
    }

    #[test]
    fn va_hasher_is_fnv() {
        let mut hasher = VaHasher::default();
        hasher.write(&[]);
        assert_eq!(hasher.finish(), FNV_64_BASIS);

        let hash = |va: usize| {
            let mut h = VaHasher::default();
            va.hash(&mut h);
            h.finish()
        };
        assert_ne!(hash(0x1000), hash(0x2000));
        assert_eq!(hash(0x1000), hash(0x1000));
    }

    proptest! {
        #[test]
        fn no_two_entries_share_an_address(pages in prop::collection::vec(0usize..64, 1..200)) {
            let mut spt = SupplementalPageTable::new();
            let mut expected = std::collections::HashSet::new();

            for n in pages {
                let va = n * PAGE_SIZE;
                let fresh = expected.insert(va);
                prop_assert_eq!(spt.insert(anon(va)).is_ok(), fresh);
                prop_assert_eq!(spt.len(), expected.len());
            }

            let mut seen = std::collections::HashSet::new();
            for page in spt.iter() {
                prop_assert!(seen.insert(page.va()));
            }
        }
    }
}
