// =============================================================================
// Stratum — Kernel Synchronization Primitives
// =============================================================================
//
//   SpinLock   busy-waits with interrupts masked; never suspends
//   Mutex      recursive, sleeps through the scheduler when contended
//   Semaphore  counting, sleeps through the scheduler at zero
//
// `Mutex::lock` and `Semaphore::wait` are the only suspension points in the
// kernel. Everything in the PMM/VMM core is non-blocking so it can run from
// a fault handler or the timer IRQ.
//
// Lock ordering (outermost first):
//   task table → mutex / semaphore state → VMM critical section → PMM lock
//
// =============================================================================

pub mod mutex;
pub mod semaphore;
pub mod spinlock;
pub mod wait_queue;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use wait_queue::WaitQueue;

use crate::task::TaskId;

/// Waiters a single mutex or semaphore can queue.
pub const MAX_WAITERS: usize = 16;

/// What a sleeping primitive needs from the scheduler.
pub trait Scheduler {
    /// The task executing this call.
    fn current(&self) -> TaskId;

    /// Takes `id` off the run queue. It keeps running until it yields.
    fn mark_blocked(&self, id: TaskId);

    /// Makes `id` runnable again. Waking a task that has not yielded yet
    /// must make its next `yield_now` return promptly.
    fn wake(&self, id: TaskId);

    /// Gives up the CPU; returns once the caller is runnable again.
    fn yield_now(&self);
}
