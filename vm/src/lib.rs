//! Demand-paged virtual memory for a small teaching kernel.
//!
//! Processes declare pages lazily; the first touch faults a page in from its
//! initializer, the swap area or its backing file. When the user pool runs dry
//! a clock sweep picks a victim and writes it back before its frame is reused.

pub mod address_space;
pub mod backing_store;
pub mod config;
pub mod error;
mod evict;
pub mod fault;
pub mod frame;
pub mod page;
pub mod page_replacer;
pub mod page_table;
pub mod physmem;
pub mod spt;
pub mod swap;
mod vm;

#[cfg(test)]
mod test;

/// Process identifier, as handed out by the scheduler.
pub type Pid = u32;

pub use backing_store::{BackingStore, MemStore};
pub use config::VmConfig;
pub use error::{FaultReason, Result, VmError};
pub use fault::PageFault;
pub use page::{FileMapping, PageInitializer, SegmentLoader, VmType};
pub use page_replacer::{ClockReplacer, FIFOPageReplacer, PageReplacer};
pub use physmem::FrameId;
pub use vm::{PageInfo, Vm};
