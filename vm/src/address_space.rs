use std::collections::HashMap;

use crate::{page_table::PageTable, spt::SupplementalPageTable, Pid};

/// All address spaces, by owning process.
pub type Spaces = HashMap<Pid, AddressSpace>;

/// What the pager knows about one process.
pub struct AddressSpace {
    pub spt: SupplementalPageTable,
    pub page_table: PageTable,
    /// User stack pointer saved on the last kernel entry. Faults taken in
    /// kernel mode use it to decide on stack growth; `None` until one is known.
    pub user_rsp: Option<usize>,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            spt: SupplementalPageTable::new(),
            page_table: PageTable::new(),
            user_rsp: None,
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
