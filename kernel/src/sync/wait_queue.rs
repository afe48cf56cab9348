//! Fixed-capacity FIFO of blocked task ids.

use crate::task::TaskId;

/// Ring buffer of waiters. Lives inside the lock of the primitive that owns
/// it, so it needs no synchronisation of its own.
#[derive(Debug)]
pub struct WaitQueue<const N: usize> {
    slots: [TaskId; N],
    head: usize,
    len: usize,
}

impl<const N: usize> WaitQueue<N> {
    pub const fn new() -> Self {
        Self { slots: [TaskId(0); N], head: 0, len: 0 }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn is_full(&self) -> bool {
        self.len == N
    }

    /// Appends `id`. Hands it back when the queue is full.
    pub fn push(&mut self, id: TaskId) -> Result<(), TaskId> {
        if self.is_full() {
            return Err(id);
        }
        self.slots[(self.head + self.len) % N] = id;
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        if self.is_empty() {
            return None;
        }
        let id = self.slots[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        Some(id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.iter().any(|queued| queued == id)
    }

    /// Drops `id` from the queue, keeping the order of the others.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let Some(pos) = self.iter().position(|queued| queued == id) else {
            return false;
        };
        for i in pos..self.len - 1 {
            self.slots[(self.head + i) % N] = self.slots[(self.head + i + 1) % N];
        }
        self.len -= 1;
        true
    }

    fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.len).map(move |i| self.slots[(self.head + i) % N])
    }
}

impl<const N: usize> Default for WaitQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_survives_wraparound() {
        let mut q = WaitQueue::<3>::new();
        q.push(TaskId(1)).unwrap();
        q.push(TaskId(2)).unwrap();
        assert_eq!(q.pop(), Some(TaskId(1)));
        q.push(TaskId(3)).unwrap();
        q.push(TaskId(4)).unwrap();
        assert_eq!(q.push(TaskId(5)), Err(TaskId(5)));
        assert_eq!(q.pop(), Some(TaskId(2)));
        assert_eq!(q.pop(), Some(TaskId(3)));
        assert_eq!(q.pop(), Some(TaskId(4)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let mut q = WaitQueue::<4>::new();
        for id in 1..=4 {
            q.push(TaskId(id)).unwrap();
        }
        assert!(q.remove(TaskId(2)));
        assert!(!q.remove(TaskId(9)));
        assert!(!q.contains(TaskId(2)));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(TaskId(1)));
        assert_eq!(q.pop(), Some(TaskId(3)));
        assert_eq!(q.pop(), Some(TaskId(4)));
    }
}
