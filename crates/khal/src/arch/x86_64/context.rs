// =============================================================================
// Stratum — x86_64 Register Frame & Context Switch
// =============================================================================
//
// The frame holds every general-purpose register plus the five words of an
// `iretq` frame. The switch saves the callee-saved registers of the caller
// (rax = 0 so a resumed caller sees `context_switch` return normally), then
// builds an `iretq` frame from the new context and loads everything else.
// `iretq` restores RFLAGS, so each task carries its own interrupt state.
//
//   offset  field          offset  field
//   0x00    r15            0x50    rsi
//   0x08    r14            0x58    rdx
//   0x10    r13            0x60    rcx
//   0x18    r12            0x68    rbx
//   0x20    r11            0x70    rax
//   0x28    r10            0x78    rip
//   0x30    r9             0x80    cs
//   0x38    r8             0x88    rflags
//   0x40    rbp            0x90    rsp
//   0x48    rdi            0x98    ss
//
// Syscall convention: RAX = number, RDI RSI RDX R10 R8 R9 = arguments,
// RAX = return value (negative errno on failure).
//
// =============================================================================

use core::sync::atomic::{AtomicUsize, Ordering};

use ::x86_64::PrivilegeLevel;
use ::x86_64::registers::rflags::RFlags;
use ::x86_64::structures::gdt::SegmentSelector;

use super::X86_64;
use crate::context::{ContextOps, SyscallArgs};

const KERNEL_CS: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
const KERNEL_SS: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
const USER_SS: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3);
const USER_CS: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);

/// IF set, plus the always-one reserved bit 1.
const INITIAL_RFLAGS: u64 = RFlags::INTERRUPT_FLAG.bits() | 0x2;

/// Saved register state of one x86_64 task.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X86_64Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

static KERNEL_STACK: AtomicUsize = AtomicUsize::new(0);

impl ContextOps for X86_64 {
    type Context = X86_64Context;

    unsafe fn init(ctx: &mut X86_64Context, entry: usize, stack_top: usize, is_user: bool) {
        *ctx = X86_64Context::default();
        let top = stack_top & !0xF;
        ctx.rflags = INITIAL_RFLAGS;
        if is_user {
            ctx.rip = entry as u64;
            ctx.rsp = top as u64;
            ctx.cs = u64::from(USER_CS.0);
            ctx.ss = u64::from(USER_SS.0);
        } else {
            // After the trampoline pops the entry, rsp is 16-byte aligned
            // again and its `call` leaves the SysV-expected misalignment.
            let sp = top - 8;
            // SAFETY: the caller guarantees the word below `stack_top` is ours.
            unsafe { (sp as *mut u64).write(entry as u64) };
            ctx.rip = Self::trampoline_address() as u64;
            ctx.rsp = sp as u64;
            ctx.cs = u64::from(KERNEL_CS.0);
            ctx.ss = u64::from(KERNEL_SS.0);
        }
    }

    fn syscall_args(ctx: &X86_64Context) -> SyscallArgs {
        SyscallArgs {
            nr: ctx.rax as usize,
            args: [ctx.rdi, ctx.rsi, ctx.rdx, ctx.r10, ctx.r8, ctx.r9].map(|r| r as usize),
        }
    }

    #[inline]
    fn set_return(ctx: &mut X86_64Context, value: usize) {
        ctx.rax = value as u64;
    }

    #[inline]
    fn return_value(ctx: &X86_64Context) -> isize {
        ctx.rax as i64 as isize
    }

    fn instruction_pointer(ctx: &X86_64Context) -> usize {
        ctx.rip as usize
    }

    fn stack_pointer(ctx: &X86_64Context) -> usize {
        ctx.rsp as usize
    }

    fn is_user_mode(ctx: &X86_64Context) -> bool {
        ctx.cs & 3 == 3
    }

    fn set_kernel_stack(top: usize) {
        KERNEL_STACK.store(top, Ordering::Release);
    }

    fn kernel_stack() -> usize {
        KERNEL_STACK.load(Ordering::Acquire)
    }

    fn trampoline_address() -> usize {
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        {
            hal_context_enter_kernel_thread as usize
        }
        #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
        {
            crate::context::foreign_trampoline as usize
        }
    }

    unsafe fn switch(old: *mut X86_64Context, new: *const X86_64Context) {
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        unsafe {
            hal_context_switch(old, new)
        }
        #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
        {
            let _ = (old, new);
            panic!("x86_64 context switch requires bare-metal x86_64");
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
core::arch::global_asm!(
    ".global hal_context_switch",
    "hal_context_switch:",
    // rdi = old (may be null), rsi = new
    "test rdi, rdi",
    "jz 2f",
    "mov [rdi + 0x00], r15",
    "mov [rdi + 0x08], r14",
    "mov [rdi + 0x10], r13",
    "mov [rdi + 0x18], r12",
    "mov [rdi + 0x40], rbp",
    "mov [rdi + 0x68], rbx",
    "mov qword ptr [rdi + 0x70], 0",
    // Resume point: our return address, with the stack as the caller sees it.
    "mov rax, [rsp]",
    "mov [rdi + 0x78], rax",
    "lea rax, [rsp + 8]",
    "mov [rdi + 0x90], rax",
    "mov ax, cs",
    "movzx eax, ax",
    "mov [rdi + 0x80], rax",
    "mov ax, ss",
    "movzx eax, ax",
    "mov [rdi + 0x98], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 0x88], rax",
    "2:",
    "push qword ptr [rsi + 0x98]",
    "push qword ptr [rsi + 0x90]",
    "push qword ptr [rsi + 0x88]",
    "push qword ptr [rsi + 0x80]",
    "push qword ptr [rsi + 0x78]",
    "mov r15, [rsi + 0x00]",
    "mov r14, [rsi + 0x08]",
    "mov r13, [rsi + 0x10]",
    "mov r12, [rsi + 0x18]",
    "mov r11, [rsi + 0x20]",
    "mov r10, [rsi + 0x28]",
    "mov r9,  [rsi + 0x30]",
    "mov r8,  [rsi + 0x38]",
    "mov rbp, [rsi + 0x40]",
    "mov rdi, [rsi + 0x48]",
    "mov rdx, [rsi + 0x58]",
    "mov rcx, [rsi + 0x60]",
    "mov rbx, [rsi + 0x68]",
    "mov rax, [rsi + 0x70]",
    "mov rsi, [rsi + 0x50]",
    "iretq",
    "",
    ".global hal_context_enter_kernel_thread",
    "hal_context_enter_kernel_thread:",
    "pop rax",
    "call rax",
    "call hal_kernel_thread_return",
    "ud2",
);

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
unsafe extern "C" {
    fn hal_context_switch(old: *mut X86_64Context, new: *const X86_64Context);
    fn hal_context_enter_kernel_thread();
}
