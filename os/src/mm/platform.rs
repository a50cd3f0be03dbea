//! The machine side of `pmm`: CSR/TLB access and the direct map.

use crate::sync::{intr_restore, intr_save};
use core::arch::asm;
use pmm::boot::{FramePlan, MemoryLayout};
use pmm::{FrameInfo, FramePage, PhysAddr, PhysMemory, PhysPageNum, Platform, VirtAddr};
use riscv::register::satp;

/// Interrupt masking through `sstatus.sie`, TLB maintenance through
/// `sfence.vma`, root switching through `satp`.
pub struct KernelPlatform;

impl Platform for KernelPlatform {
    fn intr_save(&self) -> bool {
        intr_save()
    }

    fn intr_restore(&self, was_enabled: bool) {
        intr_restore(was_enabled)
    }

    fn invalidate_page(&self, va: VirtAddr) {
        unsafe {
            riscv::asm::sfence_vma(0, usize::from(va));
        }
    }

    fn flush_tlb(&self) {
        unsafe {
            riscv::asm::sfence_vma_all();
        }
    }

    fn activate(&self, token: usize) {
        unsafe {
            // From this point on the MMU walks the new root.
            satp::write(token);
            asm!("sfence.vma");
        }
    }
}

/// Every frame below `MEMORY_END`, seen at `pa + va_pa_offset`.
///
/// Both the boot gigapage and the kernel table map all of physical memory
/// there, so the view stays valid across the switch.
pub struct DirectMap {
    va_pa_offset: usize,
}

impl DirectMap {
    pub fn new(va_pa_offset: usize) -> Self {
        Self { va_pa_offset }
    }

    fn kva(&self, ppn: PhysPageNum) -> usize {
        let pa: PhysAddr = ppn.into();
        pa.0 + self.va_pa_offset
    }
}

impl PhysMemory for DirectMap {
    fn frame(&self, ppn: PhysPageNum) -> &FramePage {
        unsafe { &*(self.kva(ppn) as *const FramePage) }
    }

    fn frame_mut(&mut self, ppn: PhysPageNum) -> &mut FramePage {
        unsafe { &mut *(self.kva(ppn) as *mut FramePage) }
    }

    fn copy_frame(&mut self, dst: PhysPageNum, src: PhysPageNum) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.kva(src) as *const FramePage,
                self.kva(dst) as *mut FramePage,
                1,
            );
        }
    }
}

/// Initialize the frame metadata array where `plan` puts it, right after
/// the kernel image.
///
/// # Safety
///
/// `[plan.metadata_pa, plan.free_base)` must be unused memory reachable
/// through the direct map, and this must be called once.
pub unsafe fn metadata_array(layout: &MemoryLayout, plan: &FramePlan) -> &'static mut [FrameInfo] {
    let base = layout.kva(plan.metadata_pa) as *mut FrameInfo;
    for i in 0..plan.frame_count {
        base.add(i).write(FrameInfo::reserved());
    }
    core::slice::from_raw_parts_mut(base, plan.frame_count)
}
