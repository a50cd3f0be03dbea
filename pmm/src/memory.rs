//! The two seams between this crate and the machine.

use crate::config::{PAGE_SIZE, PTE_PER_TABLE};
use crate::{PageTableEntry, PhysPageNum, VirtAddr};

/// One physical page, aligned and sized like a page table so that the same
/// frame can be viewed as bytes or as 512 entries.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct FramePage {
    bytes: [u8; PAGE_SIZE],
}

impl FramePage {
    pub const fn zeroed() -> Self {
        Self {
            bytes: [0; PAGE_SIZE],
        }
    }

    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.bytes
    }

    /// The page viewed as a page table.
    pub fn entries(&self) -> &[PageTableEntry; PTE_PER_TABLE] {
        // SAFETY: `PageTableEntry` is a `repr(C)` usize for which every bit
        // pattern is valid, and the page is exactly 512 of them, 4KiB aligned.
        unsafe { &*(self as *const Self).cast::<[PageTableEntry; PTE_PER_TABLE]>() }
    }

    pub fn entries_mut(&mut self) -> &mut [PageTableEntry; PTE_PER_TABLE] {
        // SAFETY: see `entries`.
        unsafe { &mut *(self as *mut Self).cast::<[PageTableEntry; PTE_PER_TABLE]>() }
    }

    pub fn fill(&mut self, value: u8) {
        self.bytes.fill(value);
    }
}

/// Access to the contents of physical frames.
///
/// The kernel answers through its direct map (`pa + va_pa_offset`), tests
/// answer from a vector of pages. Borrowing `&mut self` for writes keeps the
/// crate from ever holding two live views of the same frame.
pub trait PhysMemory {
    fn frame(&self, ppn: PhysPageNum) -> &FramePage;
    fn frame_mut(&mut self, ppn: PhysPageNum) -> &mut FramePage;

    /// Copy a whole page from `src` into `dst`.
    fn copy_frame(&mut self, dst: PhysPageNum, src: PhysPageNum) {
        let page = self.frame(src).clone();
        *self.frame_mut(dst) = page;
    }
}

/// CPU services the manager depends on.
pub trait Platform {
    /// Disable local interrupts, returning whether they were enabled.
    fn intr_save(&self) -> bool;
    /// Undo a matching [`Platform::intr_save`].
    fn intr_restore(&self, was_enabled: bool);
    /// Drop the cached translation of one page (`sfence.vma va`).
    fn invalidate_page(&self, va: VirtAddr);
    /// Drop every cached translation (`sfence.vma`).
    fn flush_tlb(&self);
    /// Make the table behind `satp` token `token` the active root.
    fn activate(&self, token: usize);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PTEFlags;

    #[test]
    fn page_views_alias_the_same_bytes() {
        let mut page = FramePage::zeroed();
        page.entries_mut()[1] = PageTableEntry::new(PhysPageNum(0x80123), PTEFlags::V);
        let raw = usize::from_ne_bytes(page.bytes()[8..16].try_into().unwrap());
        assert_eq!(raw, (0x80123 << 10) | 1);
        assert!(page.entries()[0].is_empty());
    }
}
