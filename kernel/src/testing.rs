//! Host test harness.
//!
//! `SimRam` stands in for physical memory: a page-aligned heap buffer whose
//! host address is the `PhysWindow` offset, so physical address 0 is the
//! first byte of the buffer. The PMM and VMM run on it unmodified, with
//! `SoftMmu` in place of the root register.
//!
//! `ThreadScheduler` lets each host thread play one task for the sleeping
//! sync primitives.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;

use khal::mmu::SoftMmu;
use khal::{PAGE_SIZE, PageFlags, PageTableFormat, PhysAddr, PhysWindow, VirtAddr};

use crate::memory::{FrameAllocator, MemoryRegion, Vmm};
use crate::sync::Scheduler;
use crate::task::TaskId;

/// Frames reserved as the "kernel image" by [`SimRam::pmm`].
pub const SIM_KERNEL_FRAMES: u64 = 4;

/// First page of user space on every supported format.
pub const USER_PAGE: VirtAddr = VirtAddr::new(0x0040_0000);

pub struct SimRam {
    base: *mut u8,
    layout: Layout,
}

impl SimRam {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE as usize, PAGE_SIZE as usize)
            .expect("simulated RAM layout");
        // SAFETY: the layout is non-zero sized.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "out of host memory");
        Self { base, layout }
    }

    pub fn window(&self) -> PhysWindow {
        PhysWindow::new(self.base as u64)
    }

    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    /// One usable region covering the whole buffer.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        vec![MemoryRegion::usable(0, self.size())]
    }

    /// An initialised allocator with the first few frames as kernel image.
    pub fn pmm(&self) -> FrameAllocator {
        let pmm = FrameAllocator::new();
        let kernel = PhysAddr::new(0)..PhysAddr::new(SIM_KERNEL_FRAMES * PAGE_SIZE);
        // SAFETY: the buffer outlives every test that uses the allocator and
        // nothing else touches it.
        unsafe { pmm.init(self.window(), &self.regions(), kernel) }.expect("pmm init");
        pmm
    }

    fn frame_ptr(&self, frame: PhysAddr) -> *mut u8 {
        assert!(frame.is_page_aligned() && frame.as_u64() < self.size(), "{:?} outside SimRam", frame);
        self.window().ptr::<u8>(frame)
    }

    pub fn bytes(&self, frame: PhysAddr) -> &[u8] {
        // SAFETY: bounds checked by `frame_ptr`.
        unsafe { std::slice::from_raw_parts(self.frame_ptr(frame), PAGE_SIZE as usize) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self, frame: PhysAddr) -> &mut [u8] {
        // SAFETY: bounds checked by `frame_ptr`; tests never hold two views
        // of the same frame at once.
        unsafe { std::slice::from_raw_parts_mut(self.frame_ptr(frame), PAGE_SIZE as usize) }
    }
}

impl Drop for SimRam {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Writable user data flags the format can express.
pub fn user_rw<A: PageTableFormat>() -> PageFlags {
    if A::SUPPORTS_NX { PageFlags::USER_DATA } else { PageFlags::WRITABLE | PageFlags::USER }
}

/// Runs `f` against a VMM over `frames` frames of fresh RAM, with an empty
/// master directory already active.
pub fn with_vmm<A: PageTableFormat>(frames: usize, f: impl FnOnce(&SimRam, &Vmm<'_, A, &SoftMmu>)) {
    let ram = SimRam::new(frames);
    let pmm = ram.pmm();
    let mmu = SoftMmu::new();
    let vmm = Vmm::<A, _>::bootstrap(&pmm, &mmu, ram.window()).expect("master directory");
    unsafe { vmm.switch_page_directory(vmm.kernel_directory()) }.expect("activate master");
    f(&ram, &vmm);
}

// ── Scheduler ───────────────────────────────────────────────────

thread_local! {
    static CURRENT: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Host threads as tasks. A blocked task spins in `yield_now` until woken.
#[derive(Default)]
pub struct ThreadScheduler {
    blocked: Mutex<HashSet<TaskId>>,
}

/// Restores the thread's previous task identity on drop.
pub struct Entered {
    previous: Option<TaskId>,
}

impl Drop for Entered {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the calling thread run as task `id`.
    pub fn enter(&self, id: TaskId) -> Entered {
        Entered { previous: CURRENT.with(|c| c.replace(Some(id))) }
    }

    fn is_blocked(&self, id: TaskId) -> bool {
        self.blocked.lock().expect("scheduler lock").contains(&id)
    }
}

impl Scheduler for ThreadScheduler {
    fn current(&self) -> TaskId {
        CURRENT.with(|c| c.get()).expect("thread has not entered a task")
    }

    fn mark_blocked(&self, id: TaskId) {
        self.blocked.lock().expect("scheduler lock").insert(id);
    }

    fn wake(&self, id: TaskId) {
        self.blocked.lock().expect("scheduler lock").remove(&id);
    }

    fn yield_now(&self) {
        let me = self.current();
        thread::yield_now();
        while self.is_blocked(me) {
            thread::yield_now();
        }
    }
}
