mod file_store;

use std::{error::Error, fs, sync::Arc};

use env_logger::{Builder, Env};
use log::info;
use vm::{
    page_table::{PAGE_SIZE, USER_STACK},
    BackingStore, Pid, Vm, VmConfig, VmType,
};

use file_store::FileStore;

const INIT: Pid = 1;
const CHILD: Pid = 2;

const CODE_BASE: usize = 0x40_0000;
const HEAP_BASE: usize = 0x60_0000;
const MAP_BASE: usize = 0x1000_0000;

fn dump(vm: &Vm, pid: Pid, addr: usize) -> Result<String, vm::VmError> {
    let mut buf = [0u8; 16];
    vm.read_user(pid, addr, &mut buf)?;
    Ok(hex::encode(buf))
}

fn main() -> Result<(), Box<dyn Error>> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_module_path(false)
        .init();

    let dir = std::env::temp_dir().join("demand-vm-demo");
    fs::create_dir_all(&dir)?;

    let config = VmConfig {
        user_pool_frames: 4,
        swap_slots: 32,
        ..VmConfig::default()
    };
    let swap = FileStore::create_swap(dir.join("swap.bin"), config.swap_slots)?;
    let vm = Vm::new(config, Box::new(swap))?;

    // a two-page "executable": one page of code, then 100 bytes of data and bss
    let image: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 256) as u8).collect();
    fs::write(dir.join("image.bin"), &image)?;
    let image: Arc<dyn BackingStore> = Arc::new(FileStore::open(dir.join("image.bin"))?);

    vm.create_process(INIT)?;
    vm.load_segment(INIT, image.clone(), 0, CODE_BASE, PAGE_SIZE, 0, false)?;
    vm.load_segment(
        INIT,
        image,
        PAGE_SIZE as u64,
        CODE_BASE + PAGE_SIZE,
        100,
        PAGE_SIZE - 100,
        true,
    )?;
    let rsp = vm.setup_stack(INIT)?;
    info!("pid {} starts with rsp {:#x}", INIT, rsp);

    info!("code:  {}", dump(&vm, INIT, CODE_BASE)?);
    info!("data:  {}", dump(&vm, INIT, CODE_BASE + PAGE_SIZE + 90)?);

    // push a few frames worth of stack
    vm.set_stack_pointer(INIT, USER_STACK - PAGE_SIZE - 8)?;
    vm.write_user(INIT, USER_STACK - PAGE_SIZE - 16, b"return addr")?;

    // more heap than there are frames
    for n in 0..8 {
        let va = HEAP_BASE + n * PAGE_SIZE;
        vm.alloc_page(INIT, VmType::Anon, va, true)?;
        vm.write_user(INIT, va, format!("heap page {}", n).as_bytes())?;
    }
    info!(
        "{} evictions, {} swap slots in use",
        vm.evictions(),
        vm.swap_slots_in_use()
    );
    info!("heap0: {}", dump(&vm, INIT, HEAP_BASE)?);

    fs::write(dir.join("notes.txt"), b"mapped file contents")?;
    let notes = Arc::new(FileStore::open(dir.join("notes.txt"))?);
    vm.mmap(INIT, MAP_BASE, 20, true, notes, 0)?;
    vm.write_user(INIT, MAP_BASE, b"MAPPED")?;

    vm.fork(INIT, CHILD)?;
    vm.write_user(CHILD, HEAP_BASE, b"child heap")?;
    info!("parent heap0: {}", dump(&vm, INIT, HEAP_BASE)?);
    info!("child heap0:  {}", dump(&vm, CHILD, HEAP_BASE)?);

    vm.munmap(INIT, MAP_BASE)?;
    info!(
        "notes.txt now reads {:?}",
        String::from_utf8_lossy(&fs::read(dir.join("notes.txt"))?)
    );

    vm.check_invariants()?;
    vm.exit(CHILD);
    vm.exit(INIT);
    info!(
        "all processes gone: {} frames free, {} swap slots in use",
        vm.free_frames(),
        vm.swap_slots_in_use()
    );

    Ok(())
}
