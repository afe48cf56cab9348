//! Translation root and TLB maintenance.
//!
//! The VMM only needs four things from the MMU: read the active root, load
//! a new one, and invalidate one page or everything. Each architecture has a
//! hardware implementation for bare metal; `SoftMmu` records the same
//! operations in memory so the VMM runs unchanged on the host.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::addr::{PhysAddr, VirtAddr};

pub trait Mmu {
    /// Physical address of the active top-level table.
    fn active_root(&self) -> PhysAddr;

    /// Loads a new top-level table.
    ///
    /// # Safety
    /// `root` must be a fully formed directory that maps the running kernel.
    unsafe fn set_active_root(&self, root: PhysAddr);

    fn flush_page(&self, virt: VirtAddr);

    fn flush_all(&self);
}

/// In-memory root register for hosted builds and tests.
#[derive(Debug)]
pub struct SoftMmu {
    root: AtomicU64,
    page_flushes: AtomicUsize,
    full_flushes: AtomicUsize,
}

impl SoftMmu {
    pub const fn new() -> Self {
        Self {
            root: AtomicU64::new(0),
            page_flushes: AtomicUsize::new(0),
            full_flushes: AtomicUsize::new(0),
        }
    }

    pub fn page_flushes(&self) -> usize {
        self.page_flushes.load(Ordering::Relaxed)
    }

    pub fn full_flushes(&self) -> usize {
        self.full_flushes.load(Ordering::Relaxed)
    }
}

impl Default for SoftMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu for SoftMmu {
    fn active_root(&self) -> PhysAddr {
        PhysAddr::new(self.root.load(Ordering::Acquire))
    }

    unsafe fn set_active_root(&self, root: PhysAddr) {
        self.root.store(root.as_u64(), Ordering::Release);
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_page(&self, _virt: VirtAddr) {
        self.page_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_all(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

impl<M: Mmu + ?Sized> Mmu for &M {
    fn active_root(&self) -> PhysAddr {
        (**self).active_root()
    }

    unsafe fn set_active_root(&self, root: PhysAddr) {
        unsafe { (**self).set_active_root(root) }
    }

    fn flush_page(&self, virt: VirtAddr) {
        (**self).flush_page(virt)
    }

    fn flush_all(&self) {
        (**self).flush_all()
    }
}
