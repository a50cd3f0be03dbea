//! The main module and entrypoint
//!
//! Various facilities of the kernel are implemented as submodules. The most
//! important ones are:
//!
//! - [`mm`]: Brings up the `pmm` memory manager on this machine
//! - [`trap`]: Reports traps taken by the kernel itself
//!
//! Kernel code starts executing from `entry.asm`, which enables the
//! transient gigapage table and jumps to [`rust_main()`] at its kernel
//! address. Memory bring-up then replaces that table with the refined
//! kernel table and unmaps the guard pages around the boot stack.

#![deny(missing_docs)]
#![no_main]
#![no_std]

extern crate alloc;

use core::arch::global_asm;

#[cfg(feature = "board_qemu")]
#[path = "boards/qemu.rs"]
mod board;

#[macro_use]
mod console;
mod config;
mod lang_items;
mod logging;
mod mm;
mod sbi;
mod sync;
mod trap;

global_asm!(include_str!("entry.asm"));

/// clear BSS segment
fn clear_bss() {
    extern "C" {
        fn sbss();
        fn ebss();
    }

    // Dereference the memory address of sbss and ebss, and write 0
    // like(*sbss = 0, *ebss = 0)
    unsafe {
        core::slice::from_raw_parts_mut(sbss as usize as *mut u8, ebss as usize - sbss as usize)
            .fill(0);
    }
}

/// the rust entry-point of os
#[no_mangle]
fn rust_main() -> ! {
    clear_bss();
    logging::init();
    println!("[kernel] Hello, world!");
    trap::init();
    mm::init();
    mm::remap_test();
    mm::address_space_test();
    println!("[kernel] memory management is up, shutting down");
    sbi::shutdown(false)
}
