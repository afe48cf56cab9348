//! Recursive sleeping mutex.
//!
//! The owner may lock again; each `lock` needs a matching `unlock`. A task
//! that finds the mutex held by someone else queues itself, marks itself
//! blocked and yields. `unlock` wakes the oldest waiter, which then competes
//! for the mutex again.

use khal::{HalError, HalResult};

use super::{MAX_WAITERS, Scheduler, SpinLock, WaitQueue};
use crate::task::TaskId;

struct State {
    owner: Option<TaskId>,
    depth: usize,
    waiters: WaitQueue<MAX_WAITERS>,
}

pub struct Mutex {
    state: SpinLock<State>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(State { owner: None, depth: 0, waiters: WaitQueue::new() }),
        }
    }

    /// Acquires the mutex for the current task, sleeping while another task
    /// owns it.
    pub fn lock<S: Scheduler + ?Sized>(&self, sched: &S) {
        let me = sched.current();
        loop {
            {
                let mut st = self.state.lock();
                match st.owner {
                    None => {
                        st.owner = Some(me);
                        st.depth = 1;
                        return;
                    }
                    Some(owner) if owner == me => {
                        st.depth += 1;
                        return;
                    }
                    Some(_) => {
                        // A full queue degrades to polling: yield without
                        // blocking and try again.
                        if st.waiters.contains(me) || st.waiters.push(me).is_ok() {
                            // Marked while the state lock is held, so an
                            // unlock cannot slip in between.
                            sched.mark_blocked(me);
                        }
                    }
                }
            }
            sched.yield_now();
        }
    }

    /// Acquires the mutex only if that needs no sleep.
    pub fn try_lock<S: Scheduler + ?Sized>(&self, sched: &S) -> bool {
        let me = sched.current();
        let mut st = self.state.lock();
        match st.owner {
            None => {
                st.owner = Some(me);
                st.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                st.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Releases one level of ownership. The last level wakes a waiter.
    ///
    /// Fails with `Permission` when the caller is not the owner.
    pub fn unlock<S: Scheduler + ?Sized>(&self, sched: &S) -> HalResult<()> {
        let me = sched.current();
        let mut st = self.state.lock();
        if st.owner != Some(me) {
            return Err(HalError::Permission);
        }
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            if let Some(next) = st.waiters.pop() {
                sched.wake(next);
            }
        }
        Ok(())
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn guard<'a, S: Scheduler + ?Sized>(&'a self, sched: &'a S) -> MutexGuard<'a, S> {
        self.lock(sched);
        MutexGuard { mutex: self, sched }
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }

    /// Recursion depth of the current owner; 0 when free.
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutexGuard<'a, S: Scheduler + ?Sized> {
    mutex: &'a Mutex,
    sched: &'a S,
}

impl<S: Scheduler + ?Sized> Drop for MutexGuard<'_, S> {
    fn drop(&mut self) {
        // The guard only exists while its task owns the mutex.
        let _ = self.mutex.unlock(self.sched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ThreadScheduler;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn owner_may_relock_and_must_unlock_each_level() {
        let sched = ThreadScheduler::new();
        let _me = sched.enter(TaskId(1));
        let m = Mutex::new();
        m.lock(&sched);
        m.lock(&sched);
        assert!(m.try_lock(&sched));
        assert_eq!(m.depth(), 3);
        m.unlock(&sched).unwrap();
        m.unlock(&sched).unwrap();
        assert_eq!(m.owner(), Some(TaskId(1)));
        m.unlock(&sched).unwrap();
        assert_eq!(m.owner(), None);
        assert_eq!(m.unlock(&sched), Err(HalError::Permission));
    }

    #[test]
    fn non_owner_cannot_unlock_or_try_lock() {
        let sched = Arc::new(ThreadScheduler::new());
        let m = Arc::new(Mutex::new());
        {
            let _me = sched.enter(TaskId(1));
            m.lock(&*sched);
        }
        let (s, mm) = (Arc::clone(&sched), Arc::clone(&m));
        thread::spawn(move || {
            let _me = s.enter(TaskId(2));
            assert!(!mm.try_lock(&*s));
            assert_eq!(mm.unlock(&*s), Err(HalError::Permission));
        })
        .join()
        .expect("intruder panicked");
        assert_eq!(m.owner(), Some(TaskId(1)));
    }

    #[test]
    fn contended_lock_serialises_read_modify_write() {
        let sched = Arc::new(ThreadScheduler::new());
        let m = Arc::new(Mutex::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (1..=4)
            .map(|id| {
                let (sched, m, counter) = (Arc::clone(&sched), Arc::clone(&m), Arc::clone(&counter));
                thread::spawn(move || {
                    let _me = sched.enter(TaskId(id));
                    for _ in 0..200 {
                        let _g = m.guard(&*sched);
                        // Non-atomic increment: only correct under the mutex.
                        let v = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("worker panicked");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
        assert_eq!(m.owner(), None);
    }
}
