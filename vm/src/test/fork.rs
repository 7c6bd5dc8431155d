use std::sync::Arc;

use super::{get_test_vm, read_byte, FillInit, PID};
use crate::{backing_store::MemStore, page_table::PAGE_SIZE, VmError, VmType};

const CHILD: u32 = 2;

#[test]
fn test_fork_isolates_resident_pages() {
    let vm = get_test_vm(8, 8);
    vm.alloc_page(PID, VmType::Anon, 0x1000, true).unwrap();
    vm.write_user(PID, 0x1000, b"parent").unwrap();

    vm.fork(PID, CHILD).unwrap();
    assert_eq!(vm.resident_frames(), 2);
    assert_ne!(
        vm.page_info(PID, 0x1000).unwrap().frame,
        vm.page_info(CHILD, 0x1000).unwrap().frame
    );

    let mut buf = [0u8; 6];
    vm.read_user(CHILD, 0x1000, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");

    // both sides write after the fork and each sees only its own bytes
    vm.write_user(PID, 0x1000, b"PARENT").unwrap();
    vm.write_user(CHILD, 0x1000, b"child!").unwrap();
    vm.read_user(PID, 0x1000, &mut buf).unwrap();
    assert_eq!(&buf, b"PARENT");
    vm.read_user(CHILD, 0x1000, &mut buf).unwrap();
    assert_eq!(&buf, b"child!");
    vm.check_invariants().unwrap();
}

#[test]
fn test_fork_shares_initializer_of_untouched_pages() {
    let vm = get_test_vm(8, 8);
    let init = Arc::new(FillInit::new(0x77));
    vm.alloc_page_with_initializer(PID, VmType::Anon, 0x4000, false, Some(init.clone()))
        .unwrap();

    vm.fork(PID, CHILD).unwrap();
    let child = vm.page_info(CHILD, 0x4000).unwrap();
    assert_eq!(child.vm_type, VmType::Uninit);
    assert_eq!(child.target_type, VmType::Anon);
    assert!(!child.writable);
    assert_eq!(vm.resident_frames(), 0);

    // each side runs the shared initializer on its own first touch
    assert_eq!(read_byte(&vm, CHILD, 0x4000), 0x77);
    assert_eq!(init.calls(), 1);
    assert_eq!(read_byte(&vm, PID, 0x4fff), 0x77);
    assert_eq!(init.calls(), 2);
}

#[test]
fn test_fork_copies_swapped_out_pages() {
    let vm = get_test_vm(1, 8);
    vm.alloc_page(PID, VmType::Anon, 0x1000, true).unwrap();
    vm.alloc_page(PID, VmType::Anon, 0x2000, true).unwrap();
    vm.write_user(PID, 0x1000, b"one").unwrap();
    vm.write_user(PID, 0x2000, b"two").unwrap();
    assert!(vm.page_info(PID, 0x1000).unwrap().swap_slot.is_some());

    // every copy has to evict something to get its frame
    vm.fork(PID, CHILD).unwrap();
    assert_eq!(vm.resident_frames(), 1);
    vm.check_invariants().unwrap();

    for pid in [CHILD, PID] {
        let mut buf = [0u8; 3];
        vm.read_user(pid, 0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"one");
        vm.read_user(pid, 0x2000, &mut buf).unwrap();
        assert_eq!(&buf, b"two");
    }
}

#[test]
fn test_fork_copies_file_mappings() {
    let vm = get_test_vm(4, 8);
    let file = Arc::new(MemStore::from_bytes(vec![b'f'; PAGE_SIZE]));
    vm.mmap(PID, 0x20000, PAGE_SIZE, true, file.clone(), 0).unwrap();
    vm.write_user(PID, 0x20000, b"dirty").unwrap();

    vm.fork(PID, CHILD).unwrap();
    let mut buf = [0u8; 5];
    vm.read_user(CHILD, 0x20000, &mut buf).unwrap();
    assert_eq!(&buf, b"dirty");
    assert_eq!(vm.page_info(CHILD, 0x20000).unwrap().vm_type, VmType::File);

    // the child inherited the dirty page and writes it back on unmap
    vm.munmap(CHILD, 0x20000).unwrap();
    assert_eq!(&file.to_vec()[..5], b"dirty");
}

#[test]
fn test_failed_fork_leaves_no_child() {
    let vm = get_test_vm(1, 0);
    vm.alloc_page(PID, VmType::Anon, 0x1000, true).unwrap();
    vm.alloc_page(PID, VmType::Anon, 0x2000, true).unwrap();
    vm.write_user(PID, 0x1000, b"safe").unwrap();

    // the copy needs a second frame and nothing can be swapped out
    let err = vm.fork(PID, CHILD).unwrap_err();
    match err {
        VmError::Fork { va, source } => {
            assert_eq!(va, 0x1000);
            assert!(matches!(*source, VmError::OutOfMemory));
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert_eq!(vm.page_count(CHILD), None);
    assert_eq!(vm.resident_frames(), 1);
    let mut buf = [0u8; 4];
    vm.read_user(PID, 0x1000, &mut buf).unwrap();
    assert_eq!(&buf, b"safe");
    vm.check_invariants().unwrap();

    // the child pid is free for another attempt
    vm.create_process(CHILD).unwrap();
}

#[test]
fn test_fork_rejects_bad_pids() {
    let vm = get_test_vm(1, 1);
    assert!(matches!(vm.fork(7, CHILD), Err(VmError::NoSuchProcess(7))));
    assert!(matches!(vm.fork(PID, PID), Err(VmError::ProcessExists(PID))));
}
