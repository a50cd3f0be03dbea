//! Trap handling functionality
//!
//! The kernel never runs user code, so the only traps are its own. All of
//! them are fatal; `__kerneltrap` (in `trap.S`) first moves to a dedicated
//! stack so that a fault on a stack guard page can still be reported.

use crate::mm::is_stack_guard;
use core::arch::global_asm;
use riscv::register::{
    mtvec::TrapMode,
    scause::{self, Exception, Trap},
    sepc, sscratch, stval, stvec,
};

global_asm!(include_str!("trap.S"));

const TRAP_STACK_SIZE: usize = 4096 * 2;

#[repr(align(16))]
struct TrapStack([u8; TRAP_STACK_SIZE]);

static mut TRAP_STACK: TrapStack = TrapStack([0; TRAP_STACK_SIZE]);

/// initialize CSR `stvec` as the entry of `__kerneltrap`, with `sscratch`
/// pointing at the top of the trap stack
pub fn init() {
    extern "C" {
        fn __kerneltrap();
    }
    unsafe {
        let top = core::ptr::addr_of!(TRAP_STACK) as usize + TRAP_STACK_SIZE;
        sscratch::write(top);
        stvec::write(__kerneltrap as usize, TrapMode::Direct);
    }
}

/// Report a trap taken in supervisor mode and stop.
#[no_mangle]
pub fn trap_from_kernel() -> ! {
    let scause = scause::read();
    let stval = stval::read();
    let sepc = sepc::read();
    match scause.cause() {
        Trap::Exception(Exception::StorePageFault)
        | Trap::Exception(Exception::LoadPageFault)
        | Trap::Exception(Exception::InstructionPageFault)
            if is_stack_guard(stval) =>
        {
            panic!(
                "kernel stack overflow: {:?} at {:#x}, bad instruction = {:#x}",
                scause.cause(),
                stval,
                sepc
            );
        }
        Trap::Exception(Exception::StorePageFault)
        | Trap::Exception(Exception::LoadPageFault)
        | Trap::Exception(Exception::InstructionPageFault) => {
            panic!(
                "[kernel] PageFault in kernel, bad addr = {:#x}, bad instruction = {:#x}",
                stval, sepc
            );
        }
        _ => {
            panic!(
                "Unsupported trap {:?}, stval = {:#x}, sepc = {:#x}!",
                scause.cause(),
                stval,
                sepc
            );
        }
    }
}
