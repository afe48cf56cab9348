// =============================================================================
// Stratum — System Call Dispatcher
// =============================================================================
//
// The trap stub saves the caller's registers into a `ContextOps::Context`
// and calls `SyscallTable::dispatch`. The dispatcher is architecture-neutral:
// `ContextOps::syscall_args` decides which registers carry the number and
// the six arguments (EAX/EBX.. on i686, RAX/RDI.. on x86_64, X8/X0.. on
// AArch64) and `set_return` / `set_errno` write the result back.
//
// RETURN CONVENTION:
//   success  → the handler's value, unchanged
//   failure  → -errno (see `errno`), so userland tests `ret < 0`
//
// =============================================================================

use khal::{ContextOps, HalError, HalResult, PageTableFormat, VirtAddr};

/// Positive errno values placed (negated) in the return register.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const ETIMEDOUT: i32 = 110;
}

/// A system call implementation: six raw arguments in, value or error out.
pub type SyscallHandler = fn(&[usize; 6]) -> HalResult<usize>;

/// Fixed table of `N` syscall numbers.
pub struct SyscallTable<const N: usize> {
    handlers: [Option<SyscallHandler>; N],
}

impl<const N: usize> SyscallTable<N> {
    pub const fn new() -> Self {
        Self { handlers: [None; N] }
    }

    pub fn register(&mut self, nr: usize, handler: SyscallHandler) -> HalResult<()> {
        let slot = self.handlers.get_mut(nr).ok_or(HalError::InvalidParam)?;
        if slot.is_some() {
            return Err(HalError::AlreadyExists);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Runs the syscall described by `ctx` and writes the result back into
    /// it. Returns what userland will see in the return register.
    pub fn dispatch<C: ContextOps>(&self, ctx: &mut C::Context) -> isize {
        let call = C::syscall_args(ctx);
        match self.handlers.get(call.nr).copied().flatten() {
            Some(handler) => match handler(&call.args) {
                Ok(value) => C::set_return(ctx, value),
                Err(e) => {
                    klog::debug!("syscall {}: {}", call.nr, e.as_str());
                    C::set_errno(ctx, e.errno());
                }
            },
            None => {
                klog::debug!("syscall {}: no such call", call.nr);
                C::set_errno(ctx, errno::ENOSYS);
            }
        }
        C::return_value(ctx)
    }
}

impl<const N: usize> Default for SyscallTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks that `[ptr, ptr + len)` lies entirely in user space.
///
/// Handlers check every user pointer with this before touching it.
pub fn validate_user_range<A: PageTableFormat>(ptr: usize, len: usize) -> bool {
    let start = ptr as u64;
    let Some(end) = start.checked_add(len as u64) else {
        return false;
    };
    A::is_user(VirtAddr::new(start)) && end <= A::USER_SPACE_END
}
