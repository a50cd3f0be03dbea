//! Contract with the swap subsystem.
//!
//! The replacement policy and the backing store live outside this crate.
//! The manager only calls out when it runs short of frames, when it maps a
//! page that may later be evicted, and when a fault hits a swapped entry.

use crate::config::PAGE_SIZE;
use crate::error::ensure;
use crate::{
    FrameTracker, MemoryManager, MmError, MmResult, PageTable, PageTableEntry, PhysPageNum,
    VirtAddr,
};

pub trait SwapManager {
    /// Whether swapping has been initialized. Until then the manager
    /// behaves as if there was no swap at all.
    fn is_ready(&self) -> bool;

    /// Evict up to `count` pages and return how many frames were freed.
    ///
    /// Called while an allocation is pending; the implementation may use any
    /// `&self` operation of `mm`, in particular [`MemoryManager::remove`].
    fn swap_out(&self, mm: &MemoryManager, count: usize, hint: usize) -> usize;

    /// `ppn`, freshly mapped at `va`, may be chosen for eviction from now on.
    fn map_swappable(&self, va: VirtAddr, ppn: PhysPageNum);

    /// Bring the page that was evicted from `va` in `root` back into a
    /// frame obtained from [`MemoryManager::alloc_frame`]. The caller maps it.
    fn swap_in<'a>(&self, mm: &'a MemoryManager, root: PageTable, va: VirtAddr) -> MmResult<FrameTracker<'a>>;
}

impl MemoryManager {
    /// Replace the mapping of `va` with the swap entry `entry` and drop the
    /// reference the mapping held. Returns the frame that was mapped.
    ///
    /// `entry` must be non-zero with `V` clear, so the fault path can tell
    /// it apart from both a valid and an empty entry. The frame contents
    /// must have been saved before calling this: when the mapping was the
    /// last reference the frame is freed.
    pub fn evict(&self, root: PageTable, va: VirtAddr, entry: usize) -> MmResult<PhysPageNum> {
        let swapped = PageTableEntry { bits: entry };
        ensure(swapped.is_swapped(), "swap entry must be non-zero and invalid")?;
        let (ppn, slot) = self
            .get_page(root, va)
            .ok_or_else(|| MmError::invalid(usize::from(va), usize::from(va) + PAGE_SIZE))?;
        self.write_pte(slot, swapped);
        self.platform().invalidate_page(va);
        self.put_frame(ppn);
        log::debug!("{:?} swapped out of {:?}", va, ppn);
        Ok(ppn)
    }
}
