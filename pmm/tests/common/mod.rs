//! Simulated machine shared by the integration tests.
#![allow(dead_code)]

use pmm::boot::{BootConfig, KernelImage, MemoryLayout, StackGuard};
use pmm::{
    AllocatorKind, FrameInfo, FramePage, FrameRegistry, IoRegion, MemoryManager, PageTable,
    PhysMemory, PhysPageNum, Platform, VirtAddr,
};
use std::cell::RefCell;
use std::rc::Rc;

pub const DRAM_BASE: usize = 0x8000_0000;
pub const FRAMES: usize = 1024;
pub const BASE_PPN: usize = DRAM_BASE >> 12;
pub const PAGE: usize = 0x1000;
pub const VA_PA_OFFSET: usize = 0xffff_ffff_c000_0000 - DRAM_BASE;

/// RAM as a vector of pages starting at `base`.
pub struct SimMemory {
    base: usize,
    pages: Vec<FramePage>,
}

impl SimMemory {
    pub fn new(base: PhysPageNum, count: usize) -> Self {
        Self {
            base: base.0,
            pages: vec![FramePage::zeroed(); count],
        }
    }
}

impl PhysMemory for SimMemory {
    fn frame(&self, ppn: PhysPageNum) -> &FramePage {
        &self.pages[ppn.0 - self.base]
    }

    fn frame_mut(&mut self, ppn: PhysPageNum) -> &mut FramePage {
        &mut self.pages[ppn.0 - self.base]
    }
}

/// What the manager asked the CPU to do.
#[derive(Default, Debug)]
pub struct PlatformLog {
    pub intr_enabled: bool,
    pub invalidated: Vec<VirtAddr>,
    pub flushes: usize,
    pub activated: Vec<usize>,
}

#[derive(Clone, Default)]
pub struct SimPlatform {
    pub log: Rc<RefCell<PlatformLog>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        let platform = Self::default();
        platform.log.borrow_mut().intr_enabled = true;
        platform
    }
}

impl Platform for SimPlatform {
    fn intr_save(&self) -> bool {
        let mut log = self.log.borrow_mut();
        let was = log.intr_enabled;
        log.intr_enabled = false;
        was
    }

    fn intr_restore(&self, was_enabled: bool) {
        self.log.borrow_mut().intr_enabled = was_enabled;
    }

    fn invalidate_page(&self, va: VirtAddr) {
        self.log.borrow_mut().invalidated.push(va);
    }

    fn flush_tlb(&self) {
        self.log.borrow_mut().flushes += 1;
    }

    fn activate(&self, token: usize) {
        self.log.borrow_mut().activated.push(token);
    }
}

fn leak_metadata(count: usize) -> &'static mut [FrameInfo] {
    Box::leak(vec![FrameInfo::default(); count].into_boxed_slice())
}

/// A manager over `FRAMES` frames where the first `reserved` are withheld,
/// without running the bootstrap sequence.
pub fn manager_with(kind: AllocatorKind, reserved: usize) -> (MemoryManager, SimPlatform) {
    let base = PhysPageNum(BASE_PPN);
    let platform = SimPlatform::new();
    let registry = FrameRegistry::new(base, leak_metadata(FRAMES));
    let mm = MemoryManager::new(
        Box::new(platform.clone()),
        Box::new(SimMemory::new(base, FRAMES)),
        registry,
        kind.build(),
    );
    mm.add_free_frames(PhysPageNum(BASE_PPN + reserved), FRAMES - reserved);
    (mm, platform)
}

pub fn manager() -> (MemoryManager, SimPlatform) {
    manager_with(AllocatorKind::FirstFit, 16)
}

/// A fresh, empty root table owned by the test.
pub fn new_root(mm: &MemoryManager) -> PageTable {
    PageTable::from_ppn(mm.alloc_frame().unwrap().into_ppn())
}

pub const UART: IoRegion = IoRegion::new(0x1000_0000, 0x1000_2000);
pub static IO_REGIONS: [IoRegion; 1] = [UART];

/// Kernel image in the first 16 frames: text in 0..4, boot stack in 8..12,
/// transient boot table in frame 12 (the upper guard).
pub fn boot_config(kind: AllocatorKind) -> BootConfig {
    let kva = |page: usize| DRAM_BASE + page * PAGE + VA_PA_OFFSET;
    let layout = MemoryLayout {
        dram_base: DRAM_BASE,
        kernel_end: DRAM_BASE + 16 * PAGE,
        memory_end: DRAM_BASE + FRAMES * PAGE,
        va_pa_offset: VA_PA_OFFSET,
    };
    let image = KernelImage {
        base: kva(0),
        text_end: kva(4),
    };
    let mut config = BootConfig::new(layout, image, PageTable::from_ppn(PhysPageNum(BASE_PPN + 12)));
    config.stack_guard = Some(StackGuard {
        stack_bottom: kva(8),
        stack_top: kva(12),
    });
    config.io_regions = &IO_REGIONS;
    config.allocator = kind;
    config
}

pub fn boot(kind: AllocatorKind) -> (MemoryManager, SimPlatform) {
    let config = boot_config(kind);
    let base = PhysPageNum(BASE_PPN);
    let platform = SimPlatform::new();
    let mm = pmm::boot::bootstrap(
        &config,
        Box::new(platform.clone()),
        Box::new(SimMemory::new(base, FRAMES)),
        leak_metadata(FRAMES),
    )
    .expect("bootstrap failed");
    (mm, platform)
}

/// How many valid leaves under `root` point at `ppn`, found by scanning
/// every table.
pub fn count_mappings(mm: &MemoryManager, root: PageTable, ppn: PhysPageNum) -> usize {
    let mut count = 0;
    for i in 0..512 {
        let l1 = mm.read_pte(pmm::PteSlot::new(root.root_ppn(), i));
        if !l1.is_valid() {
            continue;
        }
        for j in 0..512 {
            let l0 = mm.read_pte(pmm::PteSlot::new(l1.ppn(), j));
            if !l0.is_valid() {
                continue;
            }
            for k in 0..512 {
                let leaf = mm.read_pte(pmm::PteSlot::new(l0.ppn(), k));
                if leaf.is_valid() && leaf.ppn() == ppn {
                    count += 1;
                }
            }
        }
    }
    count
}
