use std::sync::Arc;

use super::{get_test_vm, read_byte, user_fault, FillInit, PID};
use crate::{
    backing_store::{BackingStore, MemStore},
    page_table::{KERN_BASE, PAGE_SIZE, USER_STACK},
    FaultReason, PageFault, VmError, VmType,
};

fn reason(err: VmError) -> FaultReason {
    match err {
        VmError::InvalidFault { reason, .. } => reason,
        other => panic!("expected an invalid fault, got {:?}", other),
    }
}

#[test]
fn test_first_fault_zero_fills_anon_page() {
    let vm = get_test_vm(4, 4);
    vm.alloc_page(PID, VmType::Anon, 0x1000, true).unwrap();

    let info = vm.page_info(PID, 0x1000).unwrap();
    assert_eq!(info.vm_type, VmType::Uninit);
    assert_eq!(info.target_type, VmType::Anon);
    assert!(!info.is_resident());

    vm.try_handle_fault(PID, &user_fault(0x1234, false)).unwrap();

    let info = vm.page_info(PID, 0x1000).unwrap();
    assert_eq!(info.vm_type, VmType::Anon);
    assert!(info.is_resident());
    assert_eq!(vm.resident_frames(), 1);

    let mut buf = vec![0xFFu8; PAGE_SIZE];
    vm.read_user(PID, 0x1000, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));

    // the mapping is writable
    vm.write_user(PID, 0x1ffc, &[1, 2, 3, 4]).unwrap();
    assert_eq!(read_byte(&vm, PID, 0x1fff), 4);
    vm.check_invariants().unwrap();
}

#[test]
fn test_initializer_runs_once() {
    let vm = get_test_vm(4, 4);
    let init = Arc::new(FillInit::new(0x5A));
    vm.alloc_page_with_initializer(PID, VmType::Anon, 0x3000, true, Some(init.clone()))
        .unwrap();
    assert_eq!(init.calls(), 0);

    vm.try_handle_fault(PID, &user_fault(0x3000, true)).unwrap();
    assert_eq!(init.calls(), 1);
    assert_eq!(read_byte(&vm, PID, 0x3123), 0x5A);

    // a second fault on a resident page does not re-initialize it
    vm.try_handle_fault(PID, &user_fault(0x3008, false)).unwrap();
    vm.claim_page(PID, 0x3000).unwrap();
    assert_eq!(init.calls(), 1);
    assert_eq!(vm.resident_frames(), 1);
}

#[test]
fn test_stack_grows_below_stack_pointer() {
    let vm = get_test_vm(4, 4);
    assert_eq!(vm.setup_stack(PID).unwrap(), USER_STACK);
    assert!(vm.page_info(PID, USER_STACK - 1).unwrap().stack);

    let rsp = USER_STACK - PAGE_SIZE - 16;
    vm.set_stack_pointer(PID, rsp).unwrap();

    // a push writes just below rsp
    vm.write_user(PID, rsp - 8, &[0xAB; 8]).unwrap();
    let grown = vm.page_info(PID, rsp - 8).unwrap();
    assert_eq!(grown.va, USER_STACK - 2 * PAGE_SIZE);
    assert_eq!(grown.vm_type, VmType::Anon);
    assert!(grown.stack && grown.writable && grown.is_resident());
    assert_eq!(vm.page_count(PID), Some(2));

    // a user-mode fault carries its own rsp
    let deep = USER_STACK - 3 * PAGE_SIZE;
    vm.try_handle_fault(
        PID,
        &PageFault {
            rsp: deep + 4,
            ..user_fault(deep + 2, true)
        },
    )
    .unwrap();
    assert!(vm.page_info(PID, deep).unwrap().stack);
    vm.check_invariants().unwrap();
}

#[test]
fn test_far_below_stack_pointer_is_not_growth() {
    let vm = get_test_vm(4, 4);
    vm.setup_stack(PID).unwrap();

    let err = vm
        .try_handle_fault(
            PID,
            &PageFault {
                rsp: USER_STACK - 64,
                ..user_fault(USER_STACK - 64 - PAGE_SIZE, true)
            },
        )
        .unwrap_err();
    assert_eq!(reason(err), FaultReason::Unmapped);
    assert_eq!(vm.page_count(PID), Some(1));

    // past the stack size limit, even with rsp right there
    let limit = vm.config().stack_limit;
    let beyond = USER_STACK - limit - PAGE_SIZE;
    let err = vm
        .try_handle_fault(
            PID,
            &PageFault {
                rsp: beyond,
                ..user_fault(beyond, true)
            },
        )
        .unwrap_err();
    assert_eq!(reason(err), FaultReason::Unmapped);
}

#[test]
fn test_no_stack_growth_before_stack_pointer_is_known() {
    let vm = get_test_vm(4, 4);
    let addr = USER_STACK - 200 * PAGE_SIZE;

    let err = vm.write_user(PID, addr, b"x").unwrap_err();
    assert_eq!(reason(err), FaultReason::Unmapped);

    // a kernel-mode fault has no saved rsp to go by either
    let fault = PageFault {
        user: false,
        rsp: KERN_BASE + 0x8000,
        ..user_fault(USER_STACK - 8, true)
    };
    let err = vm.try_handle_fault(PID, &fault).unwrap_err();
    assert_eq!(reason(err), FaultReason::Unmapped);

    assert_eq!(vm.page_count(PID), Some(0));
    assert_eq!(vm.resident_frames(), 0);

    // once rsp is recorded, the same access is a push
    vm.set_stack_pointer(PID, addr + 8).unwrap();
    vm.write_user(PID, addr, b"x").unwrap();
    assert!(vm.page_info(PID, addr).unwrap().stack);
}

#[test]
fn test_kernel_fault_uses_saved_stack_pointer() {
    let vm = get_test_vm(4, 4);
    vm.setup_stack(PID).unwrap();
    let rsp = USER_STACK - PAGE_SIZE - 4;
    vm.set_stack_pointer(PID, rsp).unwrap();

    // the hardware rsp is a kernel stack pointer and must be ignored
    let fault = PageFault {
        user: false,
        rsp: KERN_BASE + 0x8000,
        ..user_fault(rsp - 4, true)
    };
    vm.try_handle_fault(PID, &fault).unwrap();
    assert!(vm.page_info(PID, rsp - 4).unwrap().is_resident());
}

#[test]
fn test_invalid_faults_are_fatal() {
    let vm = get_test_vm(4, 4);
    vm.alloc_page(PID, VmType::Anon, 0x1000, true).unwrap();

    let cases = [
        (user_fault(0x10, false), FaultReason::NullAddress),
        (user_fault(KERN_BASE + 0x1000, false), FaultReason::KernelAddress),
        (user_fault(0x5000_0000, false), FaultReason::Unmapped),
        (
            PageFault {
                not_present: false,
                ..user_fault(0x1000, true)
            },
            FaultReason::ProtectionViolation,
        ),
    ];

    for (fault, expected) in cases {
        let err = vm.try_handle_fault(PID, &fault).unwrap_err();
        assert!(err.is_fatal_to_process());
        assert_eq!(reason(err), expected);
    }

    assert_eq!(vm.page_count(PID), Some(1));
    assert_eq!(vm.resident_frames(), 0);
}

#[test]
fn test_write_to_read_only_page() {
    let vm = get_test_vm(4, 4);
    vm.alloc_page(PID, VmType::Anon, 0x2000, false).unwrap();

    let err = vm.try_handle_fault(PID, &user_fault(0x2000, true)).unwrap_err();
    assert_eq!(reason(err), FaultReason::WriteToReadOnly);
    assert!(!vm.page_info(PID, 0x2000).unwrap().is_resident());

    // reads are fine, then a write hits the present read-only mapping
    assert_eq!(read_byte(&vm, PID, 0x2000), 0);
    let err = vm.write_user(PID, 0x2000, &[1]).unwrap_err();
    assert_eq!(reason(err), FaultReason::ProtectionViolation);
    assert_eq!(read_byte(&vm, PID, 0x2000), 0);
}

#[test]
fn test_fault_in_unknown_process() {
    let vm = get_test_vm(4, 4);
    let err = vm.try_handle_fault(42, &user_fault(0x1000, false)).unwrap_err();
    assert!(matches!(err, VmError::NoSuchProcess(42)));
}

#[test]
fn test_failed_lazy_load_returns_frame() {
    let vm = get_test_vm(2, 4);
    // the segment claims 100 bytes but the file only has 10
    let file: Arc<dyn BackingStore> = Arc::new(MemStore::from_bytes(vec![3u8; 10]));
    vm.load_segment(PID, file, 0, 0x8000, 100, PAGE_SIZE - 100, false)
        .unwrap();

    let err = vm.try_handle_fault(PID, &user_fault(0x8000, false)).unwrap_err();
    match err {
        VmError::LazyLoad { va, source } => {
            assert_eq!(va, 0x8000);
            assert!(matches!(
                *source,
                VmError::Truncated {
                    expected: 100,
                    got: 10,
                    ..
                }
            ));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let info = vm.page_info(PID, 0x8000).unwrap();
    assert_eq!(info.vm_type, VmType::Uninit);
    assert!(!info.is_resident());
    assert_eq!(vm.free_frames(), 2);
    assert_eq!(vm.resident_frames(), 0);
    vm.check_invariants().unwrap();
}
