use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    error::Result,
    fault::PageFault,
    page::{Page, PageInitializer},
    page_table::USER_STACK,
    MemStore, PageReplacer, Pid, Vm, VmConfig,
};

mod fault;
mod fork;

pub(crate) const PID: Pid = 1;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A vm with a tiny user pool and a RAM-disk swap device, plus process [`PID`].
pub(crate) fn get_test_vm(frames: usize, swap_slots: usize) -> Vm {
    init_logging();

    let config = VmConfig {
        user_pool_frames: frames,
        swap_slots,
        ..VmConfig::default()
    };
    let vm = Vm::new(config, Box::new(MemStore::new(config.swap_bytes()))).unwrap();
    vm.create_process(PID).unwrap();
    vm
}

pub(crate) fn user_fault(addr: usize, write: bool) -> PageFault {
    PageFault {
        addr,
        user: true,
        write,
        not_present: true,
        rsp: USER_STACK,
    }
}

/// Fills the page with one byte and counts how often it ran.
pub(crate) struct FillInit {
    pub(crate) calls: AtomicUsize,
    pub(crate) fill: u8,
}

impl FillInit {
    pub(crate) fn new(fill: u8) -> Self {
        FillInit {
            calls: AtomicUsize::new(0),
            fill,
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PageInitializer for FillInit {
    fn initialize(&self, _page: &Page, kva: &mut [u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        kva.fill(self.fill);
        Ok(())
    }
}

pub(crate) fn read_byte<R: PageReplacer>(vm: &Vm<R>, pid: Pid, addr: usize) -> u8 {
    let mut buf = [0u8; 1];
    vm.read_user(pid, addr, &mut buf).unwrap();
    buf[0]
}
