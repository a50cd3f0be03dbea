//! Memory management glue
//!
//! The page tables, frame allocator and address spaces live in the `pmm`
//! crate; this module supplies the machine behind them ([`KernelPlatform`],
//! [`DirectMap`]), the kernel heap, and the one [`MemoryManager`] the
//! kernel runs with.

mod heap_allocator;
mod platform;

use crate::config::{DRAM_BASE, MEMORY_END, MMIO, VA_PA_OFFSET};
use crate::sync::UPSafeCell;
use alloc::boxed::Box;
use lazy_static::*;
use platform::{metadata_array, DirectMap, KernelPlatform};
use pmm::boot::{bootstrap, plan_frames, BootConfig, KernelImage, MemoryLayout, StackGuard};
use pmm::config::{PAGE_SIZE, USER_BASE};
use pmm::{
    AllocatorKind, MapPermission, MemoryManager, MemorySet, PageFaultKind, PageTable, PhysAddr,
    VirtAddr,
};

extern "C" {
    fn stext();
    fn etext();
    fn srodata();
    fn erodata();
    fn sdata();
    fn edata();
    fn ekernel();
    fn bootstackguard();
    fn bootstack();
    fn bootstacktop();
    fn boot_page_table_sv39();
}

lazy_static! {
    /// The memory manager, brought up by the first access.
    static ref MEMORY_MANAGER: UPSafeCell<MemoryManager> =
        unsafe { UPSafeCell::new(bring_up()) };
}

/// The kernel's memory manager.
pub fn memory_manager() -> &'static MemoryManager {
    MEMORY_MANAGER.get()
}

/// initiate heap allocator, then physical memory and the kernel space
pub fn init() {
    heap_allocator::init_heap();
    lazy_static::initialize(&MEMORY_MANAGER);
}

/// Frame strategy picked at build time with `PMM=buddy`.
fn allocator_kind() -> AllocatorKind {
    match option_env!("PMM") {
        Some("buddy") => AllocatorKind::Buddy,
        _ => AllocatorKind::FirstFit,
    }
}

fn bring_up() -> MemoryManager {
    let layout = MemoryLayout {
        dram_base: DRAM_BASE,
        kernel_end: ekernel as usize - VA_PA_OFFSET,
        memory_end: MEMORY_END,
        va_pa_offset: VA_PA_OFFSET,
    };
    let image = KernelImage {
        base: stext as usize,
        text_end: etext as usize,
    };
    let boot_root = PageTable::from_ppn(PhysAddr::from(layout.pa(boot_page_table_sv39 as usize)).floor());
    let mut config = BootConfig::new(layout, image, boot_root);
    config.stack_guard = Some(StackGuard {
        stack_bottom: bootstack as usize,
        stack_top: bootstacktop as usize,
    });
    config.io_regions = &MMIO;
    config.allocator = allocator_kind();

    let plan = plan_frames(&layout).unwrap_or_else(|err| panic!("bad memory layout: {}", err));
    // SAFETY: the plan puts the array in the free memory right after `ekernel`.
    let metadata = unsafe { metadata_array(&layout, &plan) };
    bootstrap(
        &config,
        Box::new(KernelPlatform),
        Box::new(DirectMap::new(VA_PA_OFFSET)),
        metadata,
    )
    .unwrap_or_else(|err| panic!("memory bootstrap failed: {}", err))
}

/// Whether `addr` lies in one of the unmapped pages around the boot stack.
pub fn is_stack_guard(addr: usize) -> bool {
    let below = bootstackguard as usize..bootstack as usize;
    let above = bootstacktop as usize..bootstacktop as usize + PAGE_SIZE;
    below.contains(&addr) || above.contains(&addr)
}

/// Check the permissions of the kernel table.
pub fn remap_test() {
    let mm = memory_manager();
    let Some(kernel_root) = mm.kernel_root() else {
        panic!("kernel table not installed");
    };
    let pte_of = |addr: usize| {
        mm.locate(kernel_root, VirtAddr::from(addr), false)
            .map(|slot| mm.read_pte(slot))
            .filter(|pte| pte.is_valid())
    };
    let mid_text = (stext as usize + etext as usize) / 2;
    let mid_rodata = (srodata as usize + erodata as usize) / 2;
    let mid_data = (sdata as usize + edata as usize) / 2;
    assert!(pte_of(mid_text).map_or(false, |pte| !pte.writable()));
    assert!(pte_of(mid_rodata).map_or(false, |pte| pte.readable()));
    assert!(pte_of(mid_data).map_or(false, |pte| !pte.executable()));
    assert!(pte_of(bootstackguard as usize).is_none());
    assert!(pte_of(bootstacktop as usize).is_none());
    println!("remap_test passed!");
}

/// Build a user address space, populate it through the fault path, fork it
/// and tear both copies down again.
pub fn address_space_test() {
    let mm = memory_manager();
    let free = mm.nr_free_pages();
    {
        let mut parent = MemorySet::new_bare(mm).unwrap_or_else(|err| panic!("{}", err));
        let start = VirtAddr::from(USER_BASE);
        let end = VirtAddr::from(USER_BASE + 4 * PAGE_SIZE);
        parent
            .insert_framed_area_with_data(start, end, MapPermission::R | MapPermission::W, b"pmm")
            .unwrap_or_else(|err| panic!("{}", err));
        let lazy = VirtAddr::from(USER_BASE + 2 * PAGE_SIZE);
        assert!(parent.translate(lazy.floor()).map_or(true, |pte| !pte.is_valid()));
        parent
            .handle_page_fault(lazy, PageFaultKind::Store)
            .unwrap_or_else(|err| panic!("{}", err));
        assert!(parent
            .handle_page_fault(VirtAddr::from(USER_BASE + 4 * PAGE_SIZE), PageFaultKind::Load)
            .is_err());

        let child = MemorySet::from_existed_user(&parent).unwrap_or_else(|err| panic!("{}", err));
        let (Some(from), Some(to)) = (parent.translate(start.floor()), child.translate(start.floor())) else {
            panic!("forked page missing");
        };
        assert_ne!(from.ppn(), to.ppn());
        assert!(mm.read_frame(to.ppn(), |bytes| &bytes[..3] == b"pmm"));
        mm.print_pgdir(child.page_table());
    }
    assert_eq!(mm.nr_free_pages(), free);
    println!("address_space_test passed!");
}
