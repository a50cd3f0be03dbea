//! The memory manager context: registry, allocator and physical memory
//! behind one owner, with the interrupt discipline around every access.

use crate::frame::FrameRegistry;
use crate::frame_allocator::FrameAllocator;
use crate::io_region::IoRegion;
use crate::memory::{PhysMemory, Platform};
use crate::swap::SwapManager;
use crate::{MmError, MmResult, PageTable, PhysPageNum, VirtAddr};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::{Cell, RefCell};
use core::fmt::{self, Debug, Formatter};

/// State that is only touched with interrupts disabled.
pub(crate) struct MemoryInner {
    pub(crate) memory: Box<dyn PhysMemory>,
    pub(crate) frames: FrameRegistry,
    pub(crate) allocator: Box<dyn FrameAllocator>,
}

/// Owner of all physical memory bookkeeping.
///
/// Constructed once by the bootstrap sequence and then passed by reference
/// to every page-table operation. Methods take `&self`: the swap
/// collaborator may call back into the manager while an allocation is in
/// progress, so state is borrowed only for the duration of each step.
pub struct MemoryManager {
    platform: Box<dyn Platform>,
    inner: RefCell<MemoryInner>,
    swap: RefCell<Option<Arc<dyn SwapManager>>>,
    kernel_root: Cell<Option<PageTable>>,
    io_regions: Cell<&'static [IoRegion]>,
}

impl MemoryManager {
    pub fn new(
        platform: Box<dyn Platform>,
        memory: Box<dyn PhysMemory>,
        frames: FrameRegistry,
        allocator: Box<dyn FrameAllocator>,
    ) -> Self {
        log::info!("memory management: {}", allocator.name());
        Self {
            platform,
            inner: RefCell::new(MemoryInner {
                memory,
                frames,
                allocator,
            }),
            swap: RefCell::new(None),
            kernel_root: Cell::new(None),
            io_regions: Cell::new(&[]),
        }
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Run `f` on the inner state with local interrupts disabled, so that a
    /// timer interrupt can never observe the allocator mid-update.
    pub(crate) fn exclusive_session<F, V>(&self, f: F) -> V
    where
        F: FnOnce(&mut MemoryInner) -> V,
    {
        let intr_flag = self.platform.intr_save();
        let ret = f(&mut self.inner.borrow_mut());
        self.platform.intr_restore(intr_flag);
        ret
    }

    /// Hand the free run `[base, base + count)` to the allocator.
    pub fn add_free_frames(&self, base: PhysPageNum, count: usize) {
        self.exclusive_session(|inner| {
            for i in 0..count {
                inner.frames.clear_reserved(PhysPageNum(base.0 + i));
            }
            inner.allocator.init_memmap(base, count);
        });
    }

    /// Install the swap collaborator.
    pub fn set_swap_manager(&self, swap: Arc<dyn SwapManager>) {
        *self.swap.borrow_mut() = Some(swap);
    }

    /// The swap collaborator, if one is installed and ready.
    pub(crate) fn swap_manager(&self) -> Option<Arc<dyn SwapManager>> {
        self.swap.borrow().as_ref().filter(|s| s.is_ready()).cloned()
    }

    /// Root of the kernel address space, once bootstrap has switched to it.
    pub fn kernel_root(&self) -> Option<PageTable> {
        self.kernel_root.get()
    }

    pub(crate) fn set_kernel_root(&self, root: PageTable) {
        self.kernel_root.set(Some(root));
    }

    /// Memory-mapped I/O windows every address space carries.
    pub fn io_regions(&self) -> &'static [IoRegion] {
        self.io_regions.get()
    }

    pub(crate) fn set_io_regions(&self, regions: &'static [IoRegion]) {
        self.io_regions.set(regions);
    }

    /// Allocate `n` contiguous frames.
    ///
    /// A failed single-frame request asks the swap collaborator to make room
    /// and tries again, for as long as swapping out actually frees frames.
    pub fn alloc_pages(&self, n: usize) -> Option<PhysPageNum> {
        loop {
            let page = self.exclusive_session(|inner| inner.allocator.alloc(n));
            if page.is_some() || n > 1 {
                return page;
            }
            let swap = self.swap_manager()?;
            if swap.swap_out(self, n, 0) == 0 {
                log::warn!("alloc_pages: swap out freed nothing, giving up");
                return None;
            }
        }
    }

    /// Return `n` frames starting at `base` to the allocator.
    pub fn free_pages(&self, base: PhysPageNum, n: usize) {
        self.exclusive_session(|inner| {
            for i in 0..n {
                let ppn = PhysPageNum(base.0 + i);
                inner.frames.set_ref(ppn, 0);
                inner.frames.set_swap_link(ppn, None);
            }
            inner.allocator.dealloc(base, n);
        });
    }

    pub fn nr_free_pages(&self) -> usize {
        self.exclusive_session(|inner| inner.allocator.free_count())
    }

    /// Allocate one zeroed frame holding a single reference.
    pub fn alloc_frame(&self) -> MmResult<FrameTracker<'_>> {
        let ppn = self.alloc_pages(1).ok_or(MmError::OutOfMemory)?;
        self.exclusive_session(|inner| {
            inner.frames.set_ref(ppn, 1);
            inner.memory.frame_mut(ppn).fill(0);
        });
        Ok(FrameTracker { ppn, mm: self })
    }

    pub fn page_ref(&self, ppn: PhysPageNum) -> usize {
        self.exclusive_session(|inner| inner.frames.ref_count(ppn))
    }

    /// Whether `ppn` is an allocatable frame whose count is kept.
    pub fn is_tracked(&self, ppn: PhysPageNum) -> bool {
        self.exclusive_session(|inner| inner.frames.is_tracked(ppn))
    }

    /// Take one more reference on `ppn`. Untracked frames (kernel image,
    /// I/O windows) are ignored.
    pub(crate) fn get_frame(&self, ppn: PhysPageNum) {
        self.exclusive_session(|inner| {
            if inner.frames.is_tracked(ppn) {
                inner.frames.inc_ref(ppn);
            }
        });
    }

    /// Drop one reference on `ppn`, freeing it when none are left.
    ///
    /// This is the only place a tracked frame is given back after being
    /// mapped.
    pub(crate) fn put_frame(&self, ppn: PhysPageNum) {
        let freed = self.exclusive_session(|inner| {
            if !inner.frames.is_tracked(ppn) || inner.frames.dec_ref(ppn) != 0 {
                return false;
            }
            inner.frames.set_swap_link(ppn, None);
            inner.allocator.dealloc(ppn, 1);
            true
        });
        if freed {
            log::trace!("frame {:?} freed", ppn);
        }
    }

    pub fn swap_link(&self, ppn: PhysPageNum) -> Option<VirtAddr> {
        self.exclusive_session(|inner| inner.frames.swap_link(ppn))
    }

    pub(crate) fn set_swap_link(&self, ppn: PhysPageNum, va: Option<VirtAddr>) {
        self.exclusive_session(|inner| inner.frames.set_swap_link(ppn, va));
    }

    /// Read-only view of one frame's bytes.
    pub fn read_frame<V>(&self, ppn: PhysPageNum, f: impl FnOnce(&[u8]) -> V) -> V {
        self.exclusive_session(|inner| f(inner.memory.frame(ppn).bytes()))
    }

    /// Mutable view of one frame's bytes.
    pub fn write_frame<V>(&self, ppn: PhysPageNum, f: impl FnOnce(&mut [u8]) -> V) -> V {
        self.exclusive_session(|inner| f(inner.memory.frame_mut(ppn).bytes_mut()))
    }

    /// Make `pt` the active root and flush the TLB.
    pub fn activate(&self, pt: PageTable) {
        self.platform.activate(pt.token());
        self.platform.flush_tlb();
    }
}

/// One reference on a physical frame that is not (yet) owned by a mapping.
///
/// Dropping the tracker releases its reference, which frees the frame when
/// nothing mapped it in the meantime.
pub struct FrameTracker<'a> {
    ppn: PhysPageNum,
    mm: &'a MemoryManager,
}

impl<'a> FrameTracker<'a> {
    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    /// Keep the reference alive past the tracker; whoever stores the
    /// returned frame number (a page table entry) now owns it.
    pub fn into_ppn(self) -> PhysPageNum {
        let ppn = self.ppn;
        core::mem::forget(self);
        ppn
    }
}

impl Debug for FrameTracker<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FrameTracker:PPN={:#x}", self.ppn.0))
    }
}

impl Drop for FrameTracker<'_> {
    fn drop(&mut self) {
        self.mm.put_frame(self.ppn);
    }
}
