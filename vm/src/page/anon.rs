use crate::{error::Result, swap::SwapTable};

/// A page with no file behind it. Evicted contents go to swap.
#[derive(Debug, Default)]
pub struct AnonPage {
    swap_slot: Option<usize>,
}

impl AnonPage {
    pub fn new() -> Self {
        AnonPage { swap_slot: None }
    }

    pub fn swap_slot(&self) -> Option<usize> {
        self.swap_slot
    }

    pub(super) fn swap_in(&mut self, kva: &mut [u8], swap: &mut SwapTable) -> Result<()> {
        // no slot: never evicted, the zeroed frame is the content
        let Some(slot) = self.swap_slot else {
            return Ok(());
        };

        swap.swap_in(slot, kva)?;
        self.swap_slot = None;
        Ok(())
    }

    pub(super) fn swap_out(&mut self, kva: &[u8], swap: &mut SwapTable) -> Result<()> {
        debug_assert!(self.swap_slot.is_none(), "resident page already owns a slot");

        self.swap_slot = Some(swap.swap_out(kva)?);
        Ok(())
    }

    pub(super) fn destroy(&mut self, swap: &mut SwapTable) {
        if let Some(slot) = self.swap_slot.take() {
            swap.free(slot);
        }
    }
}
