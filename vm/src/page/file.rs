use std::{fmt, sync::Arc};

use super::{Page, PageInitializer};
use crate::{
    backing_store::BackingStore,
    error::{Result, VmError},
    page_table::PAGE_SIZE,
};

/// One page worth of a mapped file: `read_bytes` at `offset`, the rest of the page zero.
#[derive(Clone)]
pub struct FileMapping {
    file: Arc<dyn BackingStore>,
    offset: u64,
    read_bytes: usize,
    /// Start address of the `mmap` this page belongs to.
    mapping_id: usize,
}

impl FileMapping {
    /// Fails if `read_bytes` does not fit in one page.
    pub fn new(
        file: Arc<dyn BackingStore>,
        offset: u64,
        read_bytes: usize,
        mapping_id: usize,
    ) -> Result<Self> {
        if read_bytes > PAGE_SIZE {
            return Err(VmError::InvalidArgument("file mapping reads past the page"));
        }

        Ok(FileMapping {
            file,
            offset,
            read_bytes,
            mapping_id,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn mapping_id(&self) -> usize {
        self.mapping_id
    }

    pub(crate) fn read_into(&self, va: usize, kva: &mut [u8]) -> Result<()> {
        let (data, zeroes) = kva.split_at_mut(self.read_bytes);

        let n = self.file.read_at(self.offset, data)?;
        if n != self.read_bytes {
            return Err(VmError::Truncated {
                va,
                expected: self.read_bytes,
                got: n,
            });
        }
        zeroes.fill(0);

        Ok(())
    }

    /// Writes the file-backed part of `kva` back. The zero tail is never written.
    pub(crate) fn write_back(&self, va: usize, kva: &[u8]) -> Result<()> {
        let n = self.file.write_at(self.offset, &kva[..self.read_bytes])?;
        if n != self.read_bytes {
            return Err(VmError::Truncated {
                va,
                expected: self.read_bytes,
                got: n,
            });
        }
        Ok(())
    }
}

impl PageInitializer for FileMapping {
    fn initialize(&self, page: &Page, kva: &mut [u8]) -> Result<()> {
        self.read_into(page.va(), kva)
    }

    fn file_mapping(&self) -> Option<&FileMapping> {
        Some(self)
    }
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("mapping_id", &format_args!("{:#x}", self.mapping_id))
            .finish()
    }
}

/// A page of a memory-mapped file. Written back only when dirty.
#[derive(Debug)]
pub struct FilePage {
    mapping: FileMapping,
}

impl FilePage {
    pub fn new(mapping: FileMapping) -> Self {
        FilePage { mapping }
    }

    pub fn mapping(&self) -> &FileMapping {
        &self.mapping
    }

    pub(super) fn swap_in(&mut self, va: usize, kva: &mut [u8]) -> Result<()> {
        self.mapping.read_into(va, kva)
    }

    pub(super) fn swap_out(&mut self, va: usize, kva: &[u8], dirty: bool) -> Result<()> {
        if dirty {
            self.mapping.write_back(va, kva)?;
        }
        Ok(())
    }

    pub(super) fn destroy(&mut self, va: usize, kva: Option<&[u8]>, dirty: bool) -> Result<()> {
        match kva {
            Some(kva) if dirty => self.mapping.write_back(va, kva),
            _ => Ok(()),
        }
    }
}

/// A cached block of a backing store. The frame is the authoritative copy,
/// so it is written back whenever it leaves memory.
#[derive(Debug)]
pub struct PageCachePage {
    mapping: FileMapping,
}

impl PageCachePage {
    pub fn new(mapping: FileMapping) -> Self {
        PageCachePage { mapping }
    }

    pub fn mapping(&self) -> &FileMapping {
        &self.mapping
    }

    pub(super) fn swap_in(&mut self, va: usize, kva: &mut [u8]) -> Result<()> {
        self.mapping.read_into(va, kva)
    }

    pub(super) fn swap_out(&mut self, va: usize, kva: &[u8]) -> Result<()> {
        self.mapping.write_back(va, kva)
    }

    pub(super) fn destroy(&mut self, va: usize, kva: Option<&[u8]>) -> Result<()> {
        match kva {
            Some(kva) => self.mapping.write_back(va, kva),
            None => Ok(()),
        }
    }
}
