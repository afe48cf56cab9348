//! Counting semaphore.

use super::{MAX_WAITERS, Scheduler, SpinLock, WaitQueue};

struct State {
    count: usize,
    waiters: WaitQueue<MAX_WAITERS>,
}

pub struct Semaphore {
    state: SpinLock<State>,
}

impl Semaphore {
    pub const fn new(initial: usize) -> Self {
        Self { state: SpinLock::new(State { count: initial, waiters: WaitQueue::new() }) }
    }

    /// Takes one unit, sleeping while the count is zero.
    pub fn wait<S: Scheduler + ?Sized>(&self, sched: &S) {
        let me = sched.current();
        loop {
            {
                let mut st = self.state.lock();
                if st.count > 0 {
                    st.count -= 1;
                    return;
                }
                if st.waiters.contains(me) || st.waiters.push(me).is_ok() {
                    sched.mark_blocked(me);
                }
            }
            sched.yield_now();
        }
    }

    pub fn try_wait(&self) -> bool {
        let mut st = self.state.lock();
        if st.count == 0 {
            return false;
        }
        st.count -= 1;
        true
    }

    /// Adds one unit and wakes the oldest waiter.
    pub fn signal<S: Scheduler + ?Sized>(&self, sched: &S) {
        let mut st = self.state.lock();
        st.count += 1;
        if let Some(next) = st.waiters.pop() {
            sched.wake(next);
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }
}
