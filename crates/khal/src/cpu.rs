// =============================================================================
// Stratum — Interrupt Masking
// =============================================================================
//
// On a single core, masking interrupts is the lock: nothing else can run
// until they are unmasked. The PMM bitmap, the refcount array and every page
// table walk are protected this way.
//
// SINGLE-CORE: an SMP port must pair every `interrupts_disable` critical
// section around PMM/VMM state with a real spinlock. Masking only stops the
// local core.
//
// The saved state is restored exactly, so nested critical sections compose:
// an inner restore never re-enables interrupts an outer section disabled.
//
// Hosted builds (unit tests) keep a software interrupt flag with the same
// semantics.
//
// =============================================================================

/// Interrupt-enable state captured by [`interrupts_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "dropping the state leaves interrupts disabled"]
pub struct InterruptState(bool);

impl InterruptState {
    pub const fn was_enabled(self) -> bool {
        self.0
    }
}

#[inline]
pub fn interrupts_enabled() -> bool {
    imp::enabled()
}

/// Masks interrupts and returns the previous state.
#[inline]
pub fn interrupts_disable() -> InterruptState {
    let was = imp::enabled();
    imp::disable();
    InterruptState(was)
}

/// Restores the state captured by [`interrupts_disable`].
#[inline]
pub fn interrupts_restore(state: InterruptState) {
    if state.0 {
        imp::enable();
    }
}

/// Runs `f` with interrupts masked.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let state = interrupts_disable();
    let r = f();
    interrupts_restore(state);
    r
}

/// RAII interrupt-disabled critical section.
pub struct IrqGuard {
    state: InterruptState,
}

impl IrqGuard {
    #[inline]
    pub fn new() -> Self {
        Self { state: interrupts_disable() }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        interrupts_restore(self.state);
    }
}

/// Masks interrupts and parks the CPU for good.
pub fn halt_forever() -> ! {
    imp::disable();
    loop {
        imp::wait();
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    use ::x86_64::instructions::{hlt, interrupts};

    #[inline(always)]
    pub fn enabled() -> bool {
        interrupts::are_enabled()
    }

    #[inline(always)]
    pub fn disable() {
        interrupts::disable();
    }

    #[inline(always)]
    pub fn enable() {
        interrupts::enable();
    }

    #[inline(always)]
    pub fn wait() {
        hlt();
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod imp {
    use core::arch::asm;

    #[inline(always)]
    pub fn enabled() -> bool {
        let eflags: u32;
        // SAFETY: reads EFLAGS through the stack, no other side effects.
        unsafe { asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags)) };
        eflags & (1 << 9) != 0
    }

    #[inline(always)]
    pub fn disable() {
        // SAFETY: kernel code runs at CPL 0.
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    #[inline(always)]
    pub fn enable() {
        // SAFETY: only restores a state previously observed as enabled.
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    #[inline(always)]
    pub fn wait() {
        // SAFETY: HLT with interrupts masked parks the core.
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod imp {
    use core::arch::asm;

    /// DAIF.I: IRQs masked when set.
    const DAIF_I: u64 = 1 << 7;

    #[inline(always)]
    pub fn enabled() -> bool {
        let daif: u64;
        // SAFETY: DAIF is readable at EL1.
        unsafe { asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags)) };
        daif & DAIF_I == 0
    }

    #[inline(always)]
    pub fn disable() {
        // SAFETY: masking IRQs at EL1 has no memory effects.
        unsafe { asm!("msr daifset, #2", options(nomem, nostack)) };
    }

    #[inline(always)]
    pub fn enable() {
        // SAFETY: only restores a state previously observed as enabled.
        unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
    }

    #[inline(always)]
    pub fn wait() {
        // SAFETY: WFI just idles the core.
        unsafe { asm!("wfi", options(nomem, nostack)) };
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static SOFT_IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn enabled() -> bool {
        SOFT_IF.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn disable() {
        SOFT_IF.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn enable() {
        SOFT_IF.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn wait() {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_sections_restore_exactly() {
        let outer = interrupts_disable();
        assert!(!interrupts_enabled());
        {
            let _inner = IrqGuard::new();
            assert!(!interrupts_enabled());
        }
        // Inner guard saw "disabled" and must not have re-enabled.
        assert!(!interrupts_enabled());
        interrupts_restore(outer);
        assert_eq!(interrupts_enabled(), outer.was_enabled());
    }
}
