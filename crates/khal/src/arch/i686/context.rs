// =============================================================================
// Stratum — i686 Register Frame & Context Switch
// =============================================================================
//
//   offset  field     offset  field
//   0x00    edi       0x20    es
//   0x04    esi       0x24    fs
//   0x08    ebp       0x28    gs
//   0x0C    ebx       0x2C    eip
//   0x10    edx       0x30    cs
//   0x14    ecx       0x34    eflags
//   0x18    eax       0x38    esp
//   0x1C    ds        0x3C    ss
//
// A 32-bit `iret` only pops ESP/SS when it changes privilege, so the switch
// loads ESP directly for kernel targets and pushes SS:ESP for user targets.
//
// Syscall convention (int 0x80): EAX = number, EBX ECX EDX ESI EDI EBP =
// arguments, EAX = return value.
//
// GDT layout assumed: 0x08 kernel code, 0x10 kernel data, 0x18 user code,
// 0x20 user data.
//
// =============================================================================

use core::sync::atomic::{AtomicUsize, Ordering};

use super::I686;
use crate::context::{ContextOps, SyscallArgs};

const KERNEL_CS: u32 = 0x08;
const KERNEL_DS: u32 = 0x10;
const USER_CS: u32 = 0x18 | 3;
const USER_DS: u32 = 0x20 | 3;

/// IF set, plus the always-one reserved bit 1.
const INITIAL_EFLAGS: u32 = 0x202;

/// Saved register state of one i686 task.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct I686Context {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

static KERNEL_STACK: AtomicUsize = AtomicUsize::new(0);

impl I686Context {
    fn load_segments(&mut self, code: u32, data: u32) {
        self.cs = code;
        self.ds = data;
        self.es = data;
        self.fs = data;
        self.gs = data;
        self.ss = data;
    }
}

impl ContextOps for I686 {
    type Context = I686Context;

    unsafe fn init(ctx: &mut I686Context, entry: usize, stack_top: usize, is_user: bool) {
        *ctx = I686Context::default();
        let top = stack_top & !0xF;
        ctx.eflags = INITIAL_EFLAGS;
        if is_user {
            ctx.eip = entry as u32;
            ctx.esp = top as u32;
            ctx.load_segments(USER_CS, USER_DS);
        } else {
            let sp = top - 4;
            // SAFETY: the caller guarantees the word below `stack_top` is ours.
            unsafe { (sp as *mut u32).write(entry as u32) };
            ctx.eip = Self::trampoline_address() as u32;
            ctx.esp = sp as u32;
            ctx.load_segments(KERNEL_CS, KERNEL_DS);
        }
    }

    fn syscall_args(ctx: &I686Context) -> SyscallArgs {
        SyscallArgs {
            nr: ctx.eax as usize,
            args: [ctx.ebx, ctx.ecx, ctx.edx, ctx.esi, ctx.edi, ctx.ebp].map(|r| r as usize),
        }
    }

    #[inline]
    fn set_return(ctx: &mut I686Context, value: usize) {
        ctx.eax = value as u32;
    }

    #[inline]
    fn return_value(ctx: &I686Context) -> isize {
        ctx.eax as i32 as isize
    }

    fn instruction_pointer(ctx: &I686Context) -> usize {
        ctx.eip as usize
    }

    fn stack_pointer(ctx: &I686Context) -> usize {
        ctx.esp as usize
    }

    fn is_user_mode(ctx: &I686Context) -> bool {
        ctx.cs & 3 == 3
    }

    fn set_kernel_stack(top: usize) {
        KERNEL_STACK.store(top, Ordering::Release);
    }

    fn kernel_stack() -> usize {
        KERNEL_STACK.load(Ordering::Acquire)
    }

    fn trampoline_address() -> usize {
        #[cfg(all(target_os = "none", target_arch = "x86"))]
        {
            hal_context_enter_kernel_thread as usize
        }
        #[cfg(not(all(target_os = "none", target_arch = "x86")))]
        {
            crate::context::foreign_trampoline as usize
        }
    }

    unsafe fn switch(old: *mut I686Context, new: *const I686Context) {
        #[cfg(all(target_os = "none", target_arch = "x86"))]
        unsafe {
            hal_context_switch(old, new)
        }
        #[cfg(not(all(target_os = "none", target_arch = "x86")))]
        {
            let _ = (old, new);
            panic!("i686 context switch requires bare-metal i686");
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
core::arch::global_asm!(
    ".global hal_context_switch",
    "hal_context_switch:",
    // cdecl: [esp+4] = old (may be null), [esp+8] = new
    "mov eax, [esp + 4]",
    "mov edx, [esp + 8]",
    "test eax, eax",
    "jz 2f",
    "mov [eax + 0x00], edi",
    "mov [eax + 0x04], esi",
    "mov [eax + 0x08], ebp",
    "mov [eax + 0x0C], ebx",
    "mov dword ptr [eax + 0x18], 0",
    "mov ecx, [esp]",
    "mov [eax + 0x2C], ecx",
    "lea ecx, [esp + 4]",
    "mov [eax + 0x38], ecx",
    "mov cx, cs",
    "movzx ecx, cx",
    "mov [eax + 0x30], ecx",
    "mov cx, ss",
    "movzx ecx, cx",
    "mov [eax + 0x3C], ecx",
    "mov cx, ds",
    "movzx ecx, cx",
    "mov [eax + 0x1C], ecx",
    "mov cx, es",
    "movzx ecx, cx",
    "mov [eax + 0x20], ecx",
    "mov cx, fs",
    "movzx ecx, cx",
    "mov [eax + 0x24], ecx",
    "mov cx, gs",
    "movzx ecx, cx",
    "mov [eax + 0x28], ecx",
    "pushfd",
    "pop ecx",
    "mov [eax + 0x34], ecx",
    "2:",
    "mov ecx, [edx + 0x30]",
    "test ecx, 3",
    "jz 3f",
    "push dword ptr [edx + 0x3C]",
    "push dword ptr [edx + 0x38]",
    "jmp 4f",
    "3:",
    "mov esp, [edx + 0x38]",
    "4:",
    "push dword ptr [edx + 0x34]",
    "push dword ptr [edx + 0x30]",
    "push dword ptr [edx + 0x2C]",
    "mov ecx, [edx + 0x1C]",
    "mov ds, cx",
    "mov ecx, [edx + 0x20]",
    "mov es, cx",
    "mov ecx, [edx + 0x24]",
    "mov fs, cx",
    "mov ecx, [edx + 0x28]",
    "mov gs, cx",
    "mov edi, [edx + 0x00]",
    "mov esi, [edx + 0x04]",
    "mov ebp, [edx + 0x08]",
    "mov ebx, [edx + 0x0C]",
    "mov ecx, [edx + 0x14]",
    "mov eax, [edx + 0x18]",
    "mov edx, [edx + 0x10]",
    "iretd",
    "",
    ".global hal_context_enter_kernel_thread",
    "hal_context_enter_kernel_thread:",
    "pop eax",
    "call eax",
    "call hal_kernel_thread_return",
    "ud2",
);

#[cfg(all(target_os = "none", target_arch = "x86"))]
unsafe extern "C" {
    fn hal_context_switch(old: *mut I686Context, new: *const I686Context);
    fn hal_context_enter_kernel_thread();
}
