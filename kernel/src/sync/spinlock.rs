// =============================================================================
// Stratum — Ticket Spinlock
// =============================================================================
//
// Two counters: `next_ticket` is handed out to each locker, `now_serving`
// names the ticket allowed in. Waiters are admitted in arrival order, so no
// locker starves.
//
// IRQ SAFETY:
//   Interrupts are masked before the ticket is taken and the previous state
//   is restored when the guard drops. A handler that fires while the lock is
//   held therefore cannot spin on it forever, and nested guards compose
//   because each one restores exactly what it saw.
//
// SINGLE-CORE: with one core the masking alone already excludes every other
// context; the ticket counters only start to matter on an SMP port. Keep
// them anyway so the lock stays correct when that port lands.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use khal::cpu::{self, InterruptState};

/// A ticket-based spinlock that masks interrupts while held.
pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serialises every access to `data`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, masking interrupts first.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq = cpu::interrupts_disable();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self, irq }
    }

    /// Acquires the lock only if nobody holds or waits for it.
    ///
    /// Safe to call from interrupt context: if the interrupted code holds the
    /// lock this fails instead of deadlocking.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq = cpu::interrupts_disable();
        let serving = self.now_serving.load(Ordering::Relaxed);
        match self.next_ticket.compare_exchange(
            serving,
            serving.wrapping_add(1),
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => Some(SpinLockGuard { lock: self, irq }),
            Err(_) => {
                cpu::interrupts_restore(irq);
                None
            }
        }
    }

    /// True while some context holds the lock. Racy; diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for a held [`SpinLock`].
///
/// Dropping it admits the next ticket and restores the interrupt state
/// captured by `lock`.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq: InterruptState,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        cpu::interrupts_restore(self.irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(5u32);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        let mut again = lock.try_lock().expect("lock is free");
        *again += 1;
        drop(again);
        assert_eq!(lock.into_inner(), 6);
    }

    #[test]
    fn increments_from_many_threads_are_not_lost() {
        let lock = Arc::new(SpinLock::new(0usize));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("worker panicked");
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
