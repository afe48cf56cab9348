// =============================================================================
// Stratum — CPU Context & Syscall Convention Abstraction
// =============================================================================
//
// The scheduler and the syscall dispatcher are written once. Everything that
// depends on the register file lives behind `ContextOps`:
//
//   - the saved register frame layout (`Context`)
//   - how a fresh task's frame is built (`init`)
//   - which registers carry the syscall number, arguments and return value
//
// KERNEL THREAD ENTRY:
//   The restore path of `context_switch` is a raw register load that cannot
//   take an extra argument. A kernel thread therefore resumes in a fixed
//   trampoline (`hal_context_enter_kernel_thread`), and `init` pushes the
//   real entry address on the new stack for the trampoline to pop and call.
//   When the entry function returns, the trampoline calls
//   `hal_kernel_thread_return`, which hands control to the hook the
//   scheduler registered with `set_thread_exit_hook`.
//
// =============================================================================

use spin::Once;

/// Uniform syscall request decoded from a register frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub nr: usize,
    pub args: [usize; 6],
}

/// Per-architecture register frame operations.
pub trait ContextOps {
    /// Saved register state of one task.
    type Context: Default + Clone + core::fmt::Debug;

    /// Builds a fresh frame.
    ///
    /// User tasks resume at `entry` with `stack_top` as their stack. Kernel
    /// threads resume in the trampoline with `entry` stored on their stack.
    ///
    /// # Safety
    /// For kernel threads `stack_top` must be the writable top of a stack
    /// owned by the new thread; one word below it is written.
    unsafe fn init(ctx: &mut Self::Context, entry: usize, stack_top: usize, is_user: bool);

    fn syscall_args(ctx: &Self::Context) -> SyscallArgs;

    /// Stores `value` in the primary return register.
    fn set_return(ctx: &mut Self::Context, value: usize);

    /// Reads the primary return register, sign-extended from the native width.
    fn return_value(ctx: &Self::Context) -> isize;

    /// Reports failure: the return register holds `-errno`.
    fn set_errno(ctx: &mut Self::Context, errno: i32) {
        Self::set_return(ctx, (-(errno as isize)) as usize);
    }

    fn instruction_pointer(ctx: &Self::Context) -> usize;
    fn stack_pointer(ctx: &Self::Context) -> usize;
    fn is_user_mode(ctx: &Self::Context) -> bool;

    /// Stack loaded on the next user→kernel transition.
    fn set_kernel_stack(top: usize);
    fn kernel_stack() -> usize;

    /// Address a kernel-thread frame resumes at.
    fn trampoline_address() -> usize;

    /// Saves the running state into `old` and resumes `new`.
    ///
    /// A null `old` discards the caller's state (first launch). Returns when
    /// something later switches back to `old`.
    ///
    /// # Safety
    /// `new` must have been built by `init` or saved by a previous switch,
    /// and its stack and address space must be live. Only the native
    /// architecture can switch.
    unsafe fn switch(old: *mut Self::Context, new: *const Self::Context);

    #[inline]
    fn context_size() -> usize {
        core::mem::size_of::<Self::Context>()
    }
}

static THREAD_EXIT: Once<fn() -> !> = Once::new();

/// Registers what runs when a kernel thread's entry function returns.
///
/// Only the first registration takes effect.
pub fn set_thread_exit_hook(hook: fn() -> !) {
    THREAD_EXIT.call_once(|| hook);
}

/// Called by the kernel-thread trampoline after the entry function returns.
#[unsafe(no_mangle)]
pub extern "C" fn hal_kernel_thread_return() -> ! {
    match THREAD_EXIT.get() {
        Some(hook) => hook(),
        None => crate::cpu::halt_forever(),
    }
}

/// Stand-in trampoline for frames built for a foreign architecture.
///
/// Hosted builds construct i686, x86_64 and AArch64 frames side by side; only
/// the native one has a real trampoline to point at.
pub(crate) extern "C" fn foreign_trampoline() -> ! {
    panic!("resumed a kernel-thread frame built for another architecture");
}
