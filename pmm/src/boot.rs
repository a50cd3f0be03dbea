//! One-shot bring-up of physical memory management.
//!
//! [`bootstrap`] turns a description of the machine ([`BootConfig`]) into a
//! ready [`MemoryManager`]: it plans where the frame metadata goes, reserves
//! the kernel image, hands the rest of memory to the allocator, checks the
//! allocator and the walker on the transient boot table, then builds the
//! refined kernel table, switches to it, installs the stack guards and
//! checks the result. Every error is meant to be fatal for the caller.

use crate::config::{round_down, round_up, PAGE_SIZE, SELF_TEST_VA};
use crate::error::ensure;
use crate::{
    AllocatorKind, FrameInfo, FrameRegistry, IoRegion, MemoryManager, MmError, MmResult, PTEFlags,
    PageTable, PhysAddr, PhysMemory, PhysPageNum, Platform, PteSlot, VirtAddr,
};
use alloc::boxed::Box;

/// Where physical memory is and how the kernel sees it.
#[derive(Clone, Copy, Debug)]
pub struct MemoryLayout {
    /// First byte of DRAM; frame metadata starts here.
    pub dram_base: usize,
    /// Physical end of the kernel image (the `end` symbol, translated).
    pub kernel_end: usize,
    /// One past the last usable physical byte.
    pub memory_end: usize,
    /// Kernel virtual address minus physical address.
    pub va_pa_offset: usize,
}

impl MemoryLayout {
    /// Kernel virtual address of physical address `pa`.
    pub const fn kva(&self, pa: usize) -> usize {
        pa.wrapping_add(self.va_pa_offset)
    }

    /// Physical address behind kernel virtual address `kva`.
    pub const fn pa(&self, kva: usize) -> usize {
        kva.wrapping_sub(self.va_pa_offset)
    }
}

/// The kernel image as linked, in kernel virtual addresses.
#[derive(Clone, Copy, Debug)]
pub struct KernelImage {
    /// First byte of `.text`.
    pub base: usize,
    /// End of `.text`; everything from here up is data.
    pub text_end: usize,
}

/// The boot stack `[stack_bottom, stack_top)`, in kernel virtual addresses.
///
/// The page right below `stack_bottom` and the page starting at `stack_top`
/// become unmapped guard pages.
#[derive(Clone, Copy, Debug)]
pub struct StackGuard {
    pub stack_bottom: usize,
    pub stack_top: usize,
}

impl StackGuard {
    /// The two guard pages, lower first.
    pub fn pages(&self) -> [usize; 2] {
        [self.stack_bottom - PAGE_SIZE, self.stack_top]
    }

    fn validate(&self, image: &KernelImage, layout: &MemoryLayout) -> MmResult<()> {
        let aligned = self.stack_bottom % PAGE_SIZE == 0 && self.stack_top % PAGE_SIZE == 0;
        ensure(aligned && self.stack_bottom < self.stack_top, "stack bounds are not page aligned")?;
        let data_start = round_up(image.text_end, PAGE_SIZE);
        let inside = data_start + PAGE_SIZE <= self.stack_bottom
            && self.stack_top + PAGE_SIZE <= layout.kva(layout.kernel_end);
        ensure(inside, "stack guard pages fall outside the kernel data")
    }
}

/// Everything bootstrap needs to know about the machine.
#[derive(Clone, Copy, Debug)]
pub struct BootConfig {
    pub layout: MemoryLayout,
    pub image: KernelImage,
    pub stack_guard: Option<StackGuard>,
    pub io_regions: &'static [IoRegion],
    pub allocator: AllocatorKind,
    /// The transient table the kernel entered with.
    pub boot_root: PageTable,
    /// Scratch address for the self-tests; its root entry must be empty in
    /// both the boot and the kernel table.
    pub self_test_va: usize,
}

impl BootConfig {
    pub fn new(layout: MemoryLayout, image: KernelImage, boot_root: PageTable) -> Self {
        Self {
            layout,
            image,
            stack_guard: None,
            io_regions: &[],
            allocator: AllocatorKind::default(),
            boot_root,
            self_test_va: SELF_TEST_VA,
        }
    }
}

/// Outcome of laying out frame metadata over a [`MemoryLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePlan {
    /// First frame described by the metadata.
    pub frame_base: PhysPageNum,
    /// Frames described by the metadata.
    pub frame_count: usize,
    /// Physical address of the metadata array, right after the image.
    pub metadata_pa: usize,
    /// First frame after the metadata array.
    pub free_base: PhysPageNum,
    pub free_count: usize,
}

/// Place the metadata array right after the kernel image and work out which
/// frames remain free.
pub fn plan_frames(layout: &MemoryLayout) -> MmResult<FramePlan> {
    let dram_base = round_down(layout.dram_base, PAGE_SIZE);
    let memory_end = round_down(layout.memory_end, PAGE_SIZE);
    ensure(
        dram_base <= layout.kernel_end && layout.kernel_end < memory_end,
        "kernel image lies outside physical memory",
    )?;
    let frame_base = PhysAddr::from(dram_base).floor();
    let frame_count = (memory_end - dram_base) / PAGE_SIZE;
    let metadata_pa = round_up(layout.kernel_end, PAGE_SIZE);
    let free_mem = metadata_pa + FrameRegistry::metadata_size(frame_count);
    let free_base = PhysAddr::from(free_mem).ceil();
    let end = PhysAddr::from(memory_end).floor();
    ensure(free_base < end, "no memory left after the frame metadata")?;
    Ok(FramePlan {
        frame_base,
        frame_count,
        metadata_pa,
        free_base,
        free_count: end.0 - free_base.0,
    })
}

/// Bring up memory management. `metadata` must hold exactly
/// `plan_frames(&config.layout)?.frame_count` entries.
pub fn bootstrap(
    config: &BootConfig,
    platform: Box<dyn Platform>,
    memory: Box<dyn PhysMemory>,
    metadata: &'static mut [FrameInfo],
) -> MmResult<MemoryManager> {
    let plan = plan_frames(&config.layout)?;
    ensure(
        metadata.len() == plan.frame_count,
        "metadata array does not cover physical memory",
    )?;
    let layout = &config.layout;
    log::info!("physical memory map:");
    log::info!(
        "  memory: {:#010x}, [{:#010x}, {:#010x}].",
        layout.memory_end - layout.dram_base,
        layout.dram_base,
        layout.memory_end - 1
    );
    let frames = FrameRegistry::new(plan.frame_base, metadata);
    let mm = MemoryManager::new(platform, memory, frames, config.allocator.build());
    mm.add_free_frames(plan.free_base, plan.free_count);
    mm.set_io_regions(config.io_regions);
    log::info!(
        "{} frames free from {:?}, metadata at {:#x}",
        plan.free_count,
        plan.free_base,
        plan.metadata_pa
    );

    check_alloc_page(&mm)?;
    check_pgdir(&mm, config.boot_root, config.self_test_va)?;

    let kernel_root = switch_kernel_layout(&mm, config)?;
    if let Some(guard) = config.stack_guard {
        install_stack_guards(&mm, kernel_root, config, &guard)?;
    }
    check_boot_pgdir(&mm, kernel_root, config)?;
    Ok(mm)
}

/// Allocator sanity check, independent of the strategy in use.
fn check_alloc_page(mm: &MemoryManager) -> MmResult<()> {
    let nr_free_store = mm.nr_free_pages();
    let p0 = mm.alloc_pages(1).ok_or(MmError::OutOfMemory)?;
    let p1 = mm.alloc_pages(1).ok_or(MmError::OutOfMemory)?;
    let p2 = mm.alloc_pages(1).ok_or(MmError::OutOfMemory)?;
    ensure(p0 != p1 && p0 != p2 && p1 != p2, "allocator handed out a frame twice")?;
    ensure(
        [p0, p1, p2].iter().all(|&p| mm.page_ref(p) == 0),
        "fresh frame already referenced",
    )?;
    mm.free_pages(p0, 1);
    mm.free_pages(p1, 1);
    mm.free_pages(p2, 1);
    ensure(mm.nr_free_pages() == nr_free_store, "free count not restored")?;

    let run = mm.alloc_pages(3).ok_or(MmError::OutOfMemory)?;
    ensure(
        (0..3).all(|i| mm.is_tracked(PhysPageNum(run.0 + i))),
        "run leaves managed memory",
    )?;
    mm.free_pages(run, 3);
    ensure(mm.nr_free_pages() == nr_free_store, "free count not restored")?;
    log::info!("check_alloc_page() succeeded!");
    Ok(())
}

/// Scripted insert/remove/reclaim sequence on `root` at `va`, leaving the
/// table and the free count as they were.
fn check_pgdir(mm: &MemoryManager, root: PageTable, va: usize) -> MmResult<()> {
    let nr_free_store = mm.nr_free_pages();
    let va0 = VirtAddr::from(va);
    let va1 = VirtAddr::from(va + PAGE_SIZE);
    let root_slot = PteSlot::new(root.root_ppn(), va0.floor().indexes()[0]);
    ensure(mm.read_pte(root_slot).is_empty(), "self-test gigabyte already mapped")?;
    ensure(mm.get_page(root, va0).is_none(), "self-test page already mapped")?;

    let p1 = {
        let frame = mm.alloc_frame()?;
        mm.insert(root, frame.ppn(), va0, PTEFlags::empty())?;
        frame.ppn()
    };
    let slot0 = mm.locate(root, va0, false).ok_or(MmError::InvariantViolation("walk lost"))?;
    ensure(mm.read_pte(slot0).ppn() == p1, "leaf does not point at the frame")?;
    ensure(mm.page_ref(p1) == 1, "count after first insert")?;
    let slot1 = mm.locate(root, va1, false).ok_or(MmError::InvariantViolation("walk lost"))?;
    ensure(
        slot1 == PteSlot::new(slot0.table, slot0.index + 1),
        "neighbouring pages not in one table",
    )?;

    let p2 = {
        let frame = mm.alloc_frame()?;
        mm.insert(root, frame.ppn(), va1, PTEFlags::U | PTEFlags::W)?;
        frame.ppn()
    };
    let pte = mm.read_pte(slot1);
    ensure(pte.user() && pte.writable(), "permission bits lost")?;
    ensure(mm.read_pte(root_slot).user(), "intermediate entry not user accessible")?;
    ensure(mm.page_ref(p2) == 1, "count after second insert")?;

    // same frame at the same address again
    mm.insert(root, p1, va0, PTEFlags::empty())?;
    ensure(mm.page_ref(p1) == 1, "self-remap changed the count")?;

    mm.insert(root, p1, va1, PTEFlags::empty())?;
    ensure(mm.page_ref(p1) == 2, "count after aliasing")?;
    ensure(mm.page_ref(p2) == 0, "replaced frame still referenced")?;
    let pte = mm.read_pte(slot1);
    ensure(pte.ppn() == p1 && !pte.user(), "replacement not installed")?;

    mm.remove(root, va0);
    ensure(mm.page_ref(p1) == 1 && mm.page_ref(p2) == 0, "count after remove")?;
    mm.remove(root, va1);
    mm.remove(root, va1);
    ensure(mm.page_ref(p1) == 0, "count after removing every mapping")?;

    let directory = mm.read_pte(root_slot).ppn();
    ensure(mm.page_ref(directory) == 1, "table frames carry one reference")?;
    mm.exit_range(root, va, va + 2 * PAGE_SIZE, false)?;
    ensure(mm.read_pte(root_slot).is_empty(), "empty tables not reclaimed")?;
    mm.platform().flush_tlb();

    ensure(mm.nr_free_pages() == nr_free_store, "check_pgdir leaked frames")?;
    log::info!("check_pgdir() succeeded!");
    Ok(())
}

/// Build the refined kernel table and make it the active one.
fn switch_kernel_layout(mm: &MemoryManager, config: &BootConfig) -> MmResult<PageTable> {
    let layout = &config.layout;
    let root = PageTable::from_ppn(mm.alloc_frame()?.into_ppn());
    let base = round_down(config.image.base, PAGE_SIZE);
    let text_end = round_up(config.image.text_end, PAGE_SIZE);
    let top = layout.kva(layout.memory_end);
    mm.map_segment(root, base, text_end - base, layout.pa(base), PTEFlags::R | PTEFlags::X)?;
    mm.map_segment(root, text_end, top - text_end, layout.pa(text_end), PTEFlags::R | PTEFlags::W)?;
    mm.setup_io_mapping(root, config.io_regions)?;

    mm.activate(root);
    mm.set_kernel_root(root);
    log::info!("Page table directory switch succeeded!");
    Ok(root)
}

/// Unmap the pages right below and right above the boot stack.
fn install_stack_guards(
    mm: &MemoryManager,
    root: PageTable,
    config: &BootConfig,
    guard: &StackGuard,
) -> MmResult<()> {
    guard.validate(&config.image, &config.layout)?;
    for page in guard.pages() {
        let va = VirtAddr::from(page);
        let slot = mm
            .locate(root, va, false)
            .ok_or(MmError::InvariantViolation("guard page is not mapped"))?;
        // still reachable through the mapping: make sure it is writable memory
        mm.write_frame(mm.read_pte(slot).ppn(), |bytes| bytes.fill(0));
        mm.write_pte(slot, crate::PageTableEntry::empty());
        mm.platform().invalidate_page(va);
    }
    mm.platform().flush_tlb();
    log::info!("Kernel stack guardians set succeeded!");
    Ok(())
}

/// Check the active kernel table: every kernel page maps its own physical
/// address (guard pages excepted), and the scratch gigabyte behaves.
fn check_boot_pgdir(mm: &MemoryManager, root: PageTable, config: &BootConfig) -> MmResult<()> {
    let nr_free_store = mm.nr_free_pages();
    let layout = &config.layout;
    let guards = config.stack_guard.map(|g| g.pages());
    let top = layout.kva(layout.memory_end);
    let mut va = round_down(config.image.base, PAGE_SIZE);
    while va < top {
        let pte = mm.locate(root, VirtAddr::from(va), false).map(|slot| mm.read_pte(slot));
        if guards.map_or(false, |g| g.contains(&va)) {
            ensure(pte.map_or(true, |p| !p.is_valid()), "guard page still mapped")?;
        } else {
            let expected = PhysAddr::from(layout.pa(va)).floor();
            ensure(
                pte.filter(|p| p.is_valid()).map(|p| p.ppn()) == Some(expected),
                "kernel page does not map its physical address",
            )?;
        }
        va += PAGE_SIZE;
    }

    let scratch = config.self_test_va;
    let root_slot = PteSlot::new(root.root_ppn(), VirtAddr::from(scratch).floor().indexes()[0]);
    ensure(mm.read_pte(root_slot).is_empty(), "self-test gigabyte already mapped")?;
    let (va0, va1) = (VirtAddr::from(scratch + 0x100), VirtAddr::from(scratch + 0x100 + PAGE_SIZE));
    let p = {
        let frame = mm.alloc_frame()?;
        mm.insert(root, frame.ppn(), va0, PTEFlags::W | PTEFlags::R)?;
        frame.ppn()
    };
    ensure(mm.page_ref(p) == 1, "count after first insert")?;
    mm.insert(root, p, va1, PTEFlags::W | PTEFlags::R)?;
    ensure(mm.page_ref(p) == 2, "count after second insert")?;

    const GREETING: &[u8] = b"pmm: Hello world!!";
    let through = |va: VirtAddr| mm.translate(root, va).ok_or(MmError::InvariantViolation("alias lost"));
    let pa0 = through(va0)?;
    mm.write_frame(pa0.floor(), |bytes| {
        bytes[pa0.page_offset()..pa0.page_offset() + GREETING.len()].copy_from_slice(GREETING)
    });
    let pa1 = through(va1)?;
    let seen = mm.read_frame(pa1.floor(), |bytes| {
        &bytes[pa1.page_offset()..pa1.page_offset() + GREETING.len()] == GREETING
    });
    ensure(seen, "write not visible through the alias")?;
    mm.write_frame(p, |bytes| bytes[0x100] = 0);
    ensure(mm.read_frame(pa0.floor(), |bytes| bytes[pa0.page_offset()] == 0), "frame write not visible")?;

    mm.remove(root, va0);
    mm.remove(root, va1);
    mm.exit_range(root, round_down(scratch, PAGE_SIZE), scratch + 2 * PAGE_SIZE, false)?;
    mm.platform().flush_tlb();
    ensure(mm.nr_free_pages() == nr_free_store, "check_boot_pgdir leaked frames")?;
    log::info!("check_boot_pgdir() succeeded!");
    Ok(())
}
