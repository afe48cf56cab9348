// =============================================================================
// Stratum — AArch64 Register Frame & Context Switch
// =============================================================================
//
//   offset  field
//   0x000   x0 .. x30   (31 × 8 bytes)
//   0x0F8   sp          (SP_EL0 for EL0 frames, SP_EL1 for EL1h frames)
//   0x100   elr         resume address
//   0x108   spsr        M[3:0] = 0b0000 EL0t, 0b0101 EL1h; DAIF in bits 9:6
//
// The switch saves the AAPCS64 callee-saved registers (x19-x30) plus SP,
// then restores the full frame and `eret`s, so SPSR carries the interrupt
// mask per task.
//
// Syscall convention (svc #0): X8 = number, X0-X5 = arguments, X0 = return.
//
// =============================================================================

use core::sync::atomic::{AtomicUsize, Ordering};

use super::Aarch64;
use crate::context::{ContextOps, SyscallArgs};

const SPSR_EL0T: u64 = 0b0000;
const SPSR_EL1H: u64 = 0b0101;
const SPSR_MODE_MASK: u64 = 0b1111;

/// Saved register state of one AArch64 task.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aarch64Context {
    pub x: [u64; 31],
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
}

static KERNEL_STACK: AtomicUsize = AtomicUsize::new(0);

impl ContextOps for Aarch64 {
    type Context = Aarch64Context;

    unsafe fn init(ctx: &mut Aarch64Context, entry: usize, stack_top: usize, is_user: bool) {
        *ctx = Aarch64Context::default();
        let top = stack_top & !0xF;
        if is_user {
            ctx.elr = entry as u64;
            ctx.sp = top as u64;
            ctx.spsr = SPSR_EL0T;
        } else {
            // SP must stay 16-byte aligned, so the entry gets a whole slot.
            let sp = top - 16;
            // SAFETY: the caller guarantees the slot below `stack_top` is ours.
            unsafe { (sp as *mut u64).write(entry as u64) };
            ctx.elr = Self::trampoline_address() as u64;
            ctx.sp = sp as u64;
            ctx.spsr = SPSR_EL1H;
        }
    }

    fn syscall_args(ctx: &Aarch64Context) -> SyscallArgs {
        let mut args = [0usize; 6];
        for (slot, reg) in args.iter_mut().zip(&ctx.x[..6]) {
            *slot = *reg as usize;
        }
        SyscallArgs { nr: ctx.x[8] as usize, args }
    }

    #[inline]
    fn set_return(ctx: &mut Aarch64Context, value: usize) {
        ctx.x[0] = value as u64;
    }

    #[inline]
    fn return_value(ctx: &Aarch64Context) -> isize {
        ctx.x[0] as i64 as isize
    }

    fn instruction_pointer(ctx: &Aarch64Context) -> usize {
        ctx.elr as usize
    }

    fn stack_pointer(ctx: &Aarch64Context) -> usize {
        ctx.sp as usize
    }

    fn is_user_mode(ctx: &Aarch64Context) -> bool {
        ctx.spsr & SPSR_MODE_MASK == SPSR_EL0T
    }

    fn set_kernel_stack(top: usize) {
        KERNEL_STACK.store(top, Ordering::Release);
    }

    fn kernel_stack() -> usize {
        KERNEL_STACK.load(Ordering::Acquire)
    }

    fn trampoline_address() -> usize {
        #[cfg(all(target_os = "none", target_arch = "aarch64"))]
        {
            hal_context_enter_kernel_thread as usize
        }
        #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
        {
            crate::context::foreign_trampoline as usize
        }
    }

    unsafe fn switch(old: *mut Aarch64Context, new: *const Aarch64Context) {
        #[cfg(all(target_os = "none", target_arch = "aarch64"))]
        unsafe {
            hal_context_switch(old, new)
        }
        #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
        {
            let _ = (old, new);
            panic!("AArch64 context switch requires bare-metal AArch64");
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
core::arch::global_asm!(
    ".global hal_context_switch",
    "hal_context_switch:",
    // x0 = old (may be null), x1 = new
    "cbz x0, 2f",
    "stp x19, x20, [x0, #152]",
    "stp x21, x22, [x0, #168]",
    "stp x23, x24, [x0, #184]",
    "stp x25, x26, [x0, #200]",
    "stp x27, x28, [x0, #216]",
    "stp x29, x30, [x0, #232]",
    "str xzr, [x0]",
    "mov x9, sp",
    "str x9, [x0, #248]",
    "str x30, [x0, #256]",
    "mrs x9, daif",
    "orr x9, x9, #5",
    "str x9, [x0, #264]",
    "2:",
    "ldr x9, [x1, #264]",
    "msr spsr_el1, x9",
    "ldr x10, [x1, #256]",
    "msr elr_el1, x10",
    "ldr x10, [x1, #248]",
    "tst x9, #0xf",
    "b.ne 3f",
    "msr sp_el0, x10",
    "b 4f",
    "3:",
    "mov sp, x10",
    "4:",
    "ldp x2, x3, [x1, #16]",
    "ldp x4, x5, [x1, #32]",
    "ldp x6, x7, [x1, #48]",
    "ldp x8, x9, [x1, #64]",
    "ldp x10, x11, [x1, #80]",
    "ldp x12, x13, [x1, #96]",
    "ldp x14, x15, [x1, #112]",
    "ldp x16, x17, [x1, #128]",
    "ldr x18, [x1, #144]",
    "ldp x19, x20, [x1, #152]",
    "ldp x21, x22, [x1, #168]",
    "ldp x23, x24, [x1, #184]",
    "ldp x25, x26, [x1, #200]",
    "ldp x27, x28, [x1, #216]",
    "ldp x29, x30, [x1, #232]",
    "ldp x0, x1, [x1]",
    "eret",
    "",
    ".global hal_context_enter_kernel_thread",
    "hal_context_enter_kernel_thread:",
    "ldr x9, [sp], #16",
    "blr x9",
    "bl hal_kernel_thread_return",
    "brk #0",
);

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
unsafe extern "C" {
    fn hal_context_switch(old: *mut Aarch64Context, new: *const Aarch64Context);
    fn hal_context_enter_kernel_thread();
}
