//! Physical memory and SV39 address space management, isolated from the kernel
//!
//! Everything that decides which physical frame backs which virtual page lives
//! here: the frame registry, the pluggable frame allocator, the three-level
//! page-table walker, mapping operations, the bootstrap sequence and the
//! page-fault path of user address spaces.
//!
//! The crate never touches hardware on its own. Frame contents are reached
//! through [`PhysMemory`] and CSR/TLB work goes through [`Platform`], so the
//! kernel plugs in its direct map and `sfence.vma` while host tests plug in
//! a simulated RAM.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;

mod address;
pub mod boot;
pub mod config;
mod error;
mod fault;
mod frame;
mod frame_allocator;
mod io_region;
mod manager;
mod mapping;
mod memory;
mod memory_set;
mod page_table;
mod swap;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use error::{MmError, MmResult};
pub use fault::PageFaultKind;
pub use frame::{FrameInfo, FrameRegistry};
pub use frame_allocator::{
    AllocatorKind, BuddyFrameAllocator, FirstFitAllocator, FrameAllocator,
};
pub use io_region::IoRegion;
pub use manager::{FrameTracker, MemoryManager};
pub use memory::{FramePage, PhysMemory, Platform};
pub use memory_set::{MapArea, MapPermission, MemorySet};
pub use page_table::{PTEFlags, PageTable, PageTableEntry, PteSlot};
pub use swap::SwapManager;
