// =============================================================================
// Stratum — Task Table
// =============================================================================
//
// A fixed array of task slots. Each task owns a saved register frame
// (`ContextOps::Context`), a page directory and a kernel stack. The table
// is generic over the architecture so the same scheduling logic is tested
// on the host for every register layout.
//
// LIFECYCLE:
//
//   spawn_kernel / spawn_user / fork ──► Ready ◄──► Running
//                                          ▲           │
//                                   wake   │           │ block
//                                          └─ Blocked ◄┘
//
//   exit: address space torn down synchronously, then the slot is reused.
//
// SINGLE-CORE: at most one task is Running at a time; `current` names it.
//
// =============================================================================

use khal::{ContextOps, HalError, HalResult, Mmu, PageTableFormat, PhysAddr};

use crate::memory::Vmm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
}

pub struct Task<C: ContextOps> {
    pub id: TaskId,
    pub state: TaskState,
    pub context: C::Context,
    /// Root of this task's address space.
    pub directory: PhysAddr,
    /// Top of the stack loaded on user→kernel transitions.
    pub kernel_stack: usize,
    pub parent: Option<TaskId>,
}

pub struct TaskTable<C: ContextOps, const N: usize> {
    slots: [Option<Task<C>>; N],
    next_id: u32,
    current: Option<TaskId>,
    /// Slot after which `pick_next` starts looking.
    cursor: usize,
}

impl<C: ContextOps, const N: usize> TaskTable<C, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            next_id: 1,
            current: None,
            cursor: N.saturating_sub(1),
        }
    }

    fn free_slot(&self) -> HalResult<usize> {
        self.slots.iter().position(Option::is_none).ok_or(HalError::NoMemory)
    }

    fn slot_of(&self, id: TaskId) -> Option<usize> {
        self.slots.iter().position(|s| s.as_ref().is_some_and(|t| t.id == id))
    }

    fn insert(
        &mut self,
        slot: usize,
        context: C::Context,
        directory: PhysAddr,
        kernel_stack: usize,
        parent: Option<TaskId>,
    ) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.slots[slot] = Some(Task { id, state: TaskState::Ready, context, directory, kernel_stack, parent });
        id
    }

    /// Creates a kernel thread that starts at `entry` on the stack ending at
    /// `stack_top`, running in `dir`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the top of a writable stack owned by the new
    /// thread for as long as it lives.
    pub unsafe fn spawn_kernel(&mut self, entry: usize, stack_top: usize, dir: PhysAddr) -> HalResult<TaskId> {
        let slot = self.free_slot()?;
        let mut ctx = C::Context::default();
        // SAFETY: forwarded from the caller.
        unsafe { C::init(&mut ctx, entry, stack_top, false) };
        Ok(self.insert(slot, ctx, dir, stack_top, None))
    }

    /// Creates a user task entering at `entry` with `stack_top` as its user
    /// stack. `kernel_stack` serves its syscalls and interrupts.
    pub fn spawn_user(
        &mut self,
        entry: usize,
        stack_top: usize,
        kernel_stack: usize,
        dir: PhysAddr,
    ) -> HalResult<TaskId> {
        let slot = self.free_slot()?;
        let mut ctx = C::Context::default();
        // SAFETY: user frames are built in registers only; nothing below
        // `stack_top` is written.
        unsafe { C::init(&mut ctx, entry, stack_top, true) };
        Ok(self.insert(slot, ctx, dir, kernel_stack, None))
    }

    /// Duplicates `parent`: COW clone of its address space, copy of its
    /// register frame. The child sees 0 in its return register, the parent
    /// sees the child's id.
    pub fn fork<A: PageTableFormat, M: Mmu>(
        &mut self,
        parent: TaskId,
        kernel_stack: usize,
        vmm: &Vmm<'_, A, M>,
    ) -> HalResult<TaskId> {
        let slot = self.free_slot()?;
        let p = self.get(parent).ok_or(HalError::NotFound)?;
        if p.directory == vmm.kernel_directory() {
            return Err(HalError::InvalidParam);
        }
        let directory = vmm.clone_page_directory(p.directory).ok_or(HalError::NoMemory)?;
        let mut context = p.context.clone();
        C::set_return(&mut context, 0);

        let child = self.insert(slot, context, directory, kernel_stack, Some(parent));
        if let Some(p) = self.get_mut(parent) {
            C::set_return(&mut p.context, child.0 as usize);
        }
        klog::debug!("task: fork {:?} -> {:?} (dir {:?})", parent, child, directory);
        Ok(child)
    }

    /// Tears down `id`'s address space and frees its slot.
    ///
    /// If the dying directory is active the MMU is moved to the master first.
    pub fn exit<A: PageTableFormat, M: Mmu>(&mut self, id: TaskId, vmm: &Vmm<'_, A, M>) -> HalResult<()> {
        let slot = self.slot_of(id).ok_or(HalError::NotFound)?;
        let Some(task) = self.slots[slot].take() else {
            return Err(HalError::NotFound);
        };
        let master = vmm.kernel_directory();
        if task.directory != master {
            if vmm.current_directory() == task.directory {
                // SAFETY: the master maps the whole kernel.
                unsafe { vmm.switch_page_directory(master)? };
            }
            if !vmm.free_page_directory(task.directory) {
                klog::warn!("task: {:?} exited but directory {:?} was not freed", id, task.directory);
            }
        }
        if self.current == Some(id) {
            self.current = None;
        }
        klog::debug!("task: {:?} exited", id);
        Ok(())
    }

    pub fn block(&mut self, id: TaskId) -> HalResult<()> {
        let task = self.get_mut(id).ok_or(HalError::NotFound)?;
        task.state = TaskState::Blocked;
        Ok(())
    }

    /// Makes a blocked task runnable. Waking a task that is not blocked does
    /// nothing.
    pub fn wake(&mut self, id: TaskId) -> HalResult<()> {
        let task = self.get_mut(id).ok_or(HalError::NotFound)?;
        if task.state == TaskState::Blocked {
            task.state = TaskState::Ready;
        }
        Ok(())
    }

    /// Round-robin: the next Ready task after the last one picked becomes
    /// Running; the previous Running task goes back to Ready. With nothing
    /// else Ready the current task keeps the CPU.
    pub fn pick_next(&mut self) -> Option<TaskId> {
        let next = (1..=N)
            .map(|step| (self.cursor + step) % N)
            .find(|&i| self.slots[i].as_ref().is_some_and(|t| t.state == TaskState::Ready));

        let Some(index) = next else {
            return self.current.filter(|&id| self.get(id).is_some_and(|t| t.state == TaskState::Running));
        };
        if let Some(prev) = self.current.and_then(|id| self.get_mut(id)) {
            if prev.state == TaskState::Running {
                prev.state = TaskState::Ready;
            }
        }
        let task = self.slots[index].as_mut()?;
        task.state = TaskState::Running;
        self.cursor = index;
        self.current = Some(task.id);
        self.current
    }

    pub fn get(&self, id: TaskId) -> Option<&Task<C>> {
        self.slots.iter().flatten().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task<C>> {
        self.slots.iter_mut().flatten().find(|t| t.id == id)
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: ContextOps, const N: usize> Default for TaskTable<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{USER_PAGE, with_vmm};
    use khal::PageFlags;
    use khal::arch::X86_64;

    #[repr(C, align(16))]
    struct Stack([u64; 64]);

    impl Stack {
        fn top(&mut self) -> usize {
            self.0.as_mut_ptr() as usize + core::mem::size_of::<Self>()
        }
    }

    #[test]
    fn table_full_reports_no_memory() {
        let mut table = TaskTable::<X86_64, 2>::new();
        let dir = PhysAddr::new(0x1000);
        let a = table.spawn_user(0x40_0000, 0x7FFF_0000, 0, dir).unwrap();
        let b = table.spawn_user(0x40_0000, 0x7FFF_0000, 0, dir).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.spawn_user(0x40_0000, 0x7FFF_0000, 0, dir), Err(HalError::NoMemory));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn kernel_thread_frame_points_at_trampoline() {
        let mut stack = Stack([0; 64]);
        let top = stack.top();
        let mut table = TaskTable::<X86_64, 4>::new();
        let id = unsafe { table.spawn_kernel(0xDEAD_B000, top, PhysAddr::new(0x2000)) }.unwrap();
        let task = table.get(id).unwrap();
        assert_eq!(task.kernel_stack, top);
        assert!(!X86_64::is_user_mode(&task.context));
        assert_eq!(X86_64::instruction_pointer(&task.context), X86_64::trampoline_address());
        assert_eq!(stack.0[63], 0xDEAD_B000);
    }

    #[test]
    fn round_robin_skips_blocked_tasks() {
        let mut table = TaskTable::<X86_64, 4>::new();
        let dir = PhysAddr::new(0x1000);
        let ids: Vec<_> = (0..3).map(|_| table.spawn_user(0x40_0000, 0x8000_0000, 0, dir).unwrap()).collect();

        assert_eq!(table.pick_next(), Some(ids[0]));
        table.block(ids[1]).unwrap();
        assert_eq!(table.pick_next(), Some(ids[2]));
        assert_eq!(table.get(ids[0]).unwrap().state, TaskState::Ready);
        assert_eq!(table.pick_next(), Some(ids[0]));
        table.wake(ids[1]).unwrap();
        assert_eq!(table.pick_next(), Some(ids[1]));
        assert_eq!(table.current(), Some(ids[1]));

        table.block(ids[0]).unwrap();
        table.block(ids[2]).unwrap();
        assert_eq!(table.pick_next(), Some(ids[1]), "sole runner keeps the CPU");
        assert_eq!(table.block(TaskId(99)), Err(HalError::NotFound));
    }

    #[test]
    fn fork_and_exit_manage_address_spaces() {
        with_vmm::<X86_64>(128, |_, vmm| {
            let pmm = vmm.pmm();
            let dir = vmm.create_page_directory().unwrap();
            let frame = pmm.alloc_frame().unwrap();
            vmm.map_page_in_directory(dir, USER_PAGE, frame, PageFlags::USER_DATA).unwrap();

            let mut table = TaskTable::<X86_64, 4>::new();
            let parent = table.spawn_user(USER_PAGE.as_u64() as usize, 0x7FFF_0000, 0, dir).unwrap();
            let child = table.fork(parent, 0xFFFF_8000_0001_0000, vmm).unwrap();

            let c = table.get(child).unwrap();
            assert_eq!(c.parent, Some(parent));
            assert_ne!(c.directory, dir);
            assert_eq!(X86_64::return_value(&c.context), 0);
            assert_eq!(X86_64::return_value(&table.get(parent).unwrap().context), child.0 as isize);
            assert_eq!(pmm.refcount(frame), 2);

            unsafe { vmm.switch_page_directory(c.directory) }.unwrap();
            let free_before = pmm.free_frame_count();
            table.exit(child, vmm).unwrap();
            assert_eq!(vmm.current_directory(), vmm.kernel_directory());
            assert_eq!(pmm.refcount(frame), 1);
            assert!(pmm.free_frame_count() > free_before);
            assert!(table.get(child).is_none());
            assert_eq!(table.exit(child, vmm), Err(HalError::NotFound));
        });
    }

    #[test]
    fn fork_of_a_kernel_thread_is_refused() {
        with_vmm::<X86_64>(64, |_, vmm| {
            let mut stack = Stack([0; 64]);
            let top = stack.top();
            let mut table = TaskTable::<X86_64, 2>::new();
            let k = unsafe { table.spawn_kernel(0x1000, top, vmm.kernel_directory()) }.unwrap();
            assert_eq!(table.fork(k, 0, vmm).map(|_| ()), Err(HalError::InvalidParam));
            assert_eq!(table.fork(TaskId(42), 0, vmm).map(|_| ()), Err(HalError::NotFound));
            table.exit(k, vmm).unwrap();
            assert!(table.is_empty());
        });
    }
}
