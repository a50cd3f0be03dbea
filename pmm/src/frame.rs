//! Per-frame metadata, indexed by physical page number.

use crate::{PhysPageNum, VirtAddr};

/// Bookkeeping for one physical frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Mappings (or trackers) holding this frame; zero means free.
    ref_count: usize,
    /// Permanently withheld from the allocator (kernel image, this array).
    reserved: bool,
    /// Address the swap subsystem knows this frame by while it is swappable.
    swap_vaddr: Option<VirtAddr>,
}

impl FrameInfo {
    /// Fresh metadata for a frame that has not been handed out yet.
    pub const fn reserved() -> Self {
        Self {
            ref_count: 0,
            reserved: true,
            swap_vaddr: None,
        }
    }
}

/// The flat metadata array covering `[base, base + len)`.
///
/// In the kernel the array lives right after the kernel image, which is why
/// it borrows `'static` storage instead of owning a `Vec`.
pub struct FrameRegistry {
    base: PhysPageNum,
    frames: &'static mut [FrameInfo],
}

impl FrameRegistry {
    /// Take over `frames` as the metadata of the frames starting at `base`.
    /// Every frame starts reserved; the bootstrap releases the free ones.
    pub fn new(base: PhysPageNum, frames: &'static mut [FrameInfo]) -> Self {
        frames.fill(FrameInfo::default());
        let mut registry = Self { base, frames };
        for index in 0..registry.len() {
            registry.mark_reserved(registry.ppn_at(index));
        }
        registry
    }

    /// Bytes of metadata needed to describe `count` frames.
    pub const fn metadata_size(count: usize) -> usize {
        count * core::mem::size_of::<FrameInfo>()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// One past the last managed frame.
    pub fn end(&self) -> PhysPageNum {
        PhysPageNum(self.base.0 + self.frames.len())
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        self.base <= ppn && ppn < self.end()
    }

    /// Frames whose count this registry tracks: managed and not reserved.
    pub fn is_tracked(&self, ppn: PhysPageNum) -> bool {
        self.contains(ppn) && !self.info(ppn).reserved
    }

    /// Metadata index of `ppn`.
    pub fn index_of(&self, ppn: PhysPageNum) -> usize {
        assert!(
            self.contains(ppn),
            "{:?} is outside managed memory [{:?}, {:?})",
            ppn,
            self.base,
            self.end()
        );
        ppn.0 - self.base.0
    }

    /// Frame described by metadata slot `index`.
    pub fn ppn_at(&self, index: usize) -> PhysPageNum {
        assert!(index < self.frames.len(), "frame index {} out of range", index);
        PhysPageNum(self.base.0 + index)
    }

    fn info(&self, ppn: PhysPageNum) -> &FrameInfo {
        &self.frames[self.index_of(ppn)]
    }

    fn info_mut(&mut self, ppn: PhysPageNum) -> &mut FrameInfo {
        let index = self.index_of(ppn);
        &mut self.frames[index]
    }

    pub fn ref_count(&self, ppn: PhysPageNum) -> usize {
        self.info(ppn).ref_count
    }

    pub fn set_ref(&mut self, ppn: PhysPageNum, count: usize) {
        self.info_mut(ppn).ref_count = count;
    }

    pub fn inc_ref(&mut self, ppn: PhysPageNum) -> usize {
        let info = self.info_mut(ppn);
        info.ref_count += 1;
        info.ref_count
    }

    /// Drop one reference and return the new count.
    ///
    /// Reaching zero obliges the caller to give the frame back to the
    /// allocator, exactly once.
    pub fn dec_ref(&mut self, ppn: PhysPageNum) -> usize {
        let info = self.info_mut(ppn);
        assert!(info.ref_count > 0, "{:?} released more often than taken", ppn);
        info.ref_count -= 1;
        info.ref_count
    }

    pub fn mark_reserved(&mut self, ppn: PhysPageNum) {
        self.info_mut(ppn).reserved = true;
    }

    /// Make `ppn` an ordinary allocatable frame.
    pub fn clear_reserved(&mut self, ppn: PhysPageNum) {
        let info = self.info_mut(ppn);
        info.reserved = false;
        info.ref_count = 0;
    }

    pub fn is_reserved(&self, ppn: PhysPageNum) -> bool {
        self.info(ppn).reserved
    }

    pub fn swap_link(&self, ppn: PhysPageNum) -> Option<VirtAddr> {
        self.info(ppn).swap_vaddr
    }

    pub fn set_swap_link(&mut self, ppn: PhysPageNum, va: Option<VirtAddr>) {
        self.info_mut(ppn).swap_vaddr = va;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    fn registry(len: usize) -> FrameRegistry {
        let frames = Box::leak(vec![FrameInfo::default(); len].into_boxed_slice());
        FrameRegistry::new(PhysPageNum(0x80000), frames)
    }

    #[test]
    fn everything_starts_reserved() {
        let reg = registry(4);
        assert!((0..4).all(|i| reg.is_reserved(reg.ppn_at(i))));
        assert!(!reg.is_tracked(PhysPageNum(0x80000)));
    }

    #[test]
    fn address_translation_uses_the_base_offset() {
        let reg = registry(16);
        assert_eq!(reg.index_of(PhysPageNum(0x80003)), 3);
        assert_eq!(reg.ppn_at(15), PhysPageNum(0x8000f));
        assert_eq!(reg.end(), PhysPageNum(0x80010));
    }

    #[test]
    fn counts_go_up_and_down() {
        let mut reg = registry(2);
        let ppn = PhysPageNum(0x80001);
        reg.clear_reserved(ppn);
        assert_eq!(reg.inc_ref(ppn), 1);
        assert_eq!(reg.inc_ref(ppn), 2);
        assert_eq!(reg.dec_ref(ppn), 1);
        assert_eq!(reg.dec_ref(ppn), 0);
        assert!(reg.is_tracked(ppn));
    }

    #[test]
    #[should_panic(expected = "released more often than taken")]
    fn underflow_is_caught() {
        let mut reg = registry(1);
        let ppn = reg.ppn_at(0);
        reg.clear_reserved(ppn);
        reg.dec_ref(ppn);
    }

    #[test]
    #[should_panic(expected = "outside managed memory")]
    fn foreign_frames_are_rejected() {
        let reg = registry(1);
        reg.ref_count(PhysPageNum(0x90000));
    }
}
