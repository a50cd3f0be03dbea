//! Constants used in the kernel

/// 0x300000byte == 3MiB
pub const KERNEL_HEAP_SIZE: usize = 0x30_0000;
/// First byte of DRAM on the qemu `virt` machine.
pub const DRAM_BASE: usize = 0x8000_0000;
/// 0x88000000 = DRAM_BASE + 128MiB
pub const MEMORY_END: usize = 0x8800_0000;
/// Where the linker script puts `stext`: 0xffffffffc0200000
pub const KERNEL_BASE: usize = 0xffff_ffff_c020_0000;
/// Physical load address of the kernel image (OpenSBI takes the 2MiB below).
pub const KERNEL_LOAD_PA: usize = 0x8020_0000;
/// Kernel virtual address minus physical address.
pub const VA_PA_OFFSET: usize = KERNEL_BASE - KERNEL_LOAD_PA;

#[cfg(feature = "board_qemu")]
pub use crate::board::MMIO;
