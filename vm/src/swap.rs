//! The swap area: a backing store cut into page-sized slots.

use log::trace;

use crate::{
    backing_store::BackingStore,
    error::{Result, VmError},
    page_table::PAGE_SIZE,
};

pub struct SwapTable {
    device: Box<dyn BackingStore>,
    used: Vec<bool>,
    in_use: usize,
}

impl SwapTable {
    /// Uses as many whole slots as fit on `device`.
    pub fn new(device: Box<dyn BackingStore>) -> Self {
        let slots = device.len() as usize / PAGE_SIZE;
        SwapTable {
            device,
            used: vec![false; slots],
            in_use: 0,
        }
    }

    /// Uses exactly `slots` slots; the device must be large enough to hold them.
    pub fn with_slots(device: Box<dyn BackingStore>, slots: usize) -> Result<Self> {
        if device.len() < Self::slot_offset(slots) {
            return Err(VmError::InvalidArgument("swap device is smaller than the swap area"));
        }
        Ok(SwapTable {
            device,
            used: vec![false; slots],
            in_use: 0,
        })
    }

    fn slot_offset(slot: usize) -> u64 {
        (slot * PAGE_SIZE) as u64
    }

    /// Writes one page to a free slot and returns that slot.
    ///
    /// The slot stays free if the write fails.
    pub fn swap_out(&mut self, data: &[u8]) -> Result<usize> {
        debug_assert_eq!(data.len(), PAGE_SIZE);

        let slot = self
            .used
            .iter()
            .position(|used| !used)
            .ok_or(VmError::SwapFull)?;

        self.device.write_at(Self::slot_offset(slot), data)?;
        self.used[slot] = true;
        self.in_use += 1;
        trace!("swap: wrote slot {}", slot);

        Ok(slot)
    }

    /// Reads `slot` into `dest` and frees it.
    pub fn swap_in(&mut self, slot: usize, dest: &mut [u8]) -> Result<()> {
        self.read_slot(slot, dest)?;
        self.free(slot);
        Ok(())
    }

    /// Reads `slot` without releasing it.
    pub fn read_slot(&self, slot: usize, dest: &mut [u8]) -> Result<()> {
        assert!(self.used[slot], "reading free swap slot {}", slot);

        let n = self.device.read_at(Self::slot_offset(slot), dest)?;
        if n != dest.len() {
            return Err(VmError::Truncated {
                va: slot * PAGE_SIZE,
                expected: dest.len(),
                got: n,
            });
        }
        Ok(())
    }

    pub fn free(&mut self, slot: usize) {
        assert!(self.used[slot], "double free of swap slot {}", slot);
        self.used[slot] = false;
        self.in_use -= 1;
    }

    pub fn slots_in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }
}
