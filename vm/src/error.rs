//! Errors surfaced by the VM subsystem.

use core::fmt;

use thiserror::Error;

use crate::Pid;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, VmError>;

/// Why a page fault could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReason {
    /// Access to the null page.
    NullAddress,
    /// User access to a kernel virtual address.
    KernelAddress,
    /// Fault on a present mapping. No write-protect handling exists.
    ProtectionViolation,
    /// First touch of a read-only page was a write.
    WriteToReadOnly,
    /// No SPT entry and not eligible for stack growth.
    Unmapped,
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultReason::NullAddress => "null address",
            FaultReason::KernelAddress => "kernel address",
            FaultReason::ProtectionViolation => "protection violation",
            FaultReason::WriteToReadOnly => "write to read-only page",
            FaultReason::Unmapped => "unmapped address",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    /// A page already exists at this virtual address.
    #[error("page {0:#x} is already mapped")]
    AlreadyMapped(usize),
    #[error("no page mapped at {0:#x}")]
    NotMapped(usize),
    #[error("no address space for process {0}")]
    NoSuchProcess(Pid),
    #[error("process {0} already has an address space")]
    ProcessExists(Pid),
    /// The fault is not something the pager can satisfy; the process must die.
    #[error("unhandled page fault at {addr:#x}: {reason}")]
    InvalidFault { addr: usize, reason: FaultReason },
    /// The user pool is empty and no frame could be reclaimed.
    #[error("out of memory")]
    OutOfMemory,
    #[error("swap area is full")]
    SwapFull,
    #[error("lazy load of page {va:#x} failed")]
    LazyLoad {
        va: usize,
        #[source]
        source: Box<VmError>,
    },
    #[error("short read for page {va:#x}: expected {expected} bytes, got {got}")]
    Truncated {
        va: usize,
        expected: usize,
        got: usize,
    },
    #[error("backing store i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Duplicating the parent's page at `va` failed; the child was torn down.
    #[error("fork failed while copying page {va:#x}")]
    Fork {
        va: usize,
        #[source]
        source: Box<VmError>,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl VmError {
    /// Whether this error means the faulting process has to be terminated.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            VmError::InvalidFault { .. }
                | VmError::LazyLoad { .. }
                | VmError::Truncated { .. }
                | VmError::OutOfMemory
                | VmError::SwapFull
        )
    }
}
