// =============================================================================
// Stratum — Virtual Memory Manager
// =============================================================================
//
// Architecture-neutral address-space management on top of a `PageTableFormat`
// (entry encoding) and an `Mmu` (root register + TLB). One `Vmm` serves the
// whole kernel; every task owns one page directory.
//
// DIRECTORY OWNERSHIP:
//
//   master directory          task directory
//   ┌──────────────┐          ┌──────────────┐
//   │ user: empty  │          │ user: owned  │──► tables + frames (refcounted)
//   ├──────────────┤          ├──────────────┤
//   │ kernel slots │──┐    ┌──│ kernel slots │
//   └──────────────┘  │    │  └──────────────┘
//                     ▼    ▼
//               kernel page tables (owned by the master, never freed)
//
//   Kernel root entries are copied by value into each new directory, so all
//   directories point at the same kernel tables. Tearing down a task walks
//   the user slots only. Kernel-region mappings are always installed through
//   the master's tables; a new kernel root entry reaches older directories
//   lazily through `handle_kernel_page_fault`, or never needs to when the
//   master's root slots were all filled up front (`preallocate_kernel_tables`).
//
// COPY-ON-WRITE:
//   `clone_page_directory` deep-copies the user tables, turns every writable
//   leaf into read-only+COW in both directories and takes one extra
//   reference on each shared frame. The first write then faults into
//   `handle_cow_page_fault`, which either restores write access in place
//   (sole owner) or copies the frame.
//
// FRAME REFERENCES:
//   A present user leaf holds one reference on its frame. `map_page*` takes
//   over the caller's reference; `unmap_page*` hands it back; teardown and
//   `release_page` drop it.
//
// SINGLE-CORE: page tables are mutated through `&self` with interrupts
// masked for the whole operation. That is the only thing keeping a fault
// handler or a context switch from seeing a half-built table.
//
// =============================================================================

use core::marker::PhantomData;

use khal::cpu::IrqGuard;
use khal::paging::{EntryError, read_entry, write_entry};
use khal::{FaultCode, HalError, HalResult, Mmu, PageFlags, PageTableFormat, PhysAddr, PhysWindow, VirtAddr};

use super::frame::Frame;
use super::pmm::FrameAllocator;

/// Why `map_page_in_directory` refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Misaligned, outside both regions, or `USER` on a kernel address.
    InvalidAddress,
    AlreadyMapped,
    /// A huge page / block already covers the address.
    HugePageConflict,
    OutOfMemory,
    /// The format cannot express a requested attribute (NX on i686).
    NotSupported,
    /// An existing entry on the path failed format validation.
    Corrupted,
}

impl From<MapError> for HalError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::InvalidAddress | MapError::Corrupted => HalError::InvalidParam,
            MapError::AlreadyMapped => HalError::AlreadyExists,
            MapError::HugePageConflict => HalError::Busy,
            MapError::OutOfMemory => HalError::NoMemory,
            MapError::NotSupported => HalError::NotSupported,
        }
    }
}

impl From<EntryError> for MapError {
    fn from(_: EntryError) -> Self {
        MapError::Corrupted
    }
}

/// Why a write fault could not be resolved as copy-on-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowError {
    /// Not a write to a present COW user page: a genuine fault.
    NotCow,
    /// Sharing had to be broken but no frame was free.
    OutOfMemory,
    Corrupted,
}

impl From<CowError> for HalError {
    fn from(e: CowError) -> Self {
        match e {
            CowError::NotCow => HalError::Permission,
            CowError::OutOfMemory => HalError::NoMemory,
            CowError::Corrupted => HalError::InvalidParam,
        }
    }
}

impl From<EntryError> for CowError {
    fn from(_: EntryError) -> Self {
        CowError::Corrupted
    }
}

/// A present translation, as reported by [`Vmm::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: PhysAddr,
    pub flags: PageFlags,
    /// 0 for a 4 KiB page, higher for a huge page / block.
    pub level: usize,
    /// Tables read to reach the entry.
    pub tables_walked: usize,
}

/// Where a walk stopped: the entry at `table[index]` on `level`.
#[derive(Clone, Copy)]
struct Slot {
    table: PhysAddr,
    index: usize,
    level: usize,
    raw: u64,
    tables_walked: usize,
}

/// Tables allocated by one `map` call, so a failure can unlink them again.
struct FreshTables {
    /// (parent table, index in parent, level of the parent entry, new table)
    entries: [(PhysAddr, usize, usize, PhysAddr); 4],
    len: usize,
}

impl FreshTables {
    const fn new() -> Self {
        Self { entries: [(PhysAddr::zero(), 0, 0, PhysAddr::zero()); 4], len: 0 }
    }

    fn push(&mut self, parent: PhysAddr, index: usize, level: usize, table: PhysAddr) {
        self.entries[self.len] = (parent, index, level, table);
        self.len += 1;
    }
}

pub struct Vmm<'a, A: PageTableFormat, M: Mmu> {
    pmm: &'a FrameAllocator,
    mmu: M,
    window: PhysWindow,
    master: PhysAddr,
    _format: PhantomData<fn() -> A>,
}

impl<'a, A: PageTableFormat, M: Mmu> Vmm<'a, A, M> {
    /// Adopts `master` as the kernel template directory.
    ///
    /// # Safety
    ///
    /// `master` must be a live top-level table of format `A`, and `window`
    /// must reach it, every table below it and every frame `pmm` hands out.
    pub unsafe fn new(pmm: &'a FrameAllocator, mmu: M, window: PhysWindow, master: PhysAddr) -> Self {
        Self { pmm, mmu, window, master, _format: PhantomData }
    }

    /// Allocates an empty master directory. It is not activated: map the
    /// kernel into it first, then call `switch_page_directory`.
    pub fn bootstrap(pmm: &'a FrameAllocator, mmu: M, window: PhysWindow) -> Option<Self> {
        let master = pmm.allocate()?.into_raw();
        klog::debug!("VMM[{}]: master directory at {:?}", A::NAME, master);
        Some(Self { pmm, mmu, window, master, _format: PhantomData })
    }

    pub fn pmm(&self) -> &'a FrameAllocator {
        self.pmm
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn window(&self) -> PhysWindow {
        self.window
    }

    // ── Raw entry access ────────────────────────────────────────

    #[inline]
    fn read(&self, table: PhysAddr, index: usize) -> u64 {
        // SAFETY: only live tables of format `A` reach this point, and the
        // window covers them (constructor contract).
        unsafe { read_entry::<A>(self.window.ptr::<u8>(table), index) }
    }

    #[inline]
    fn write(&self, table: PhysAddr, index: usize, level: usize, raw: u64) {
        debug_assert!(
            A::validate_entry(raw, level).is_ok(),
            "{}: malformed entry {:#x} at level {}",
            A::NAME,
            raw,
            level
        );
        // SAFETY: as in `read`.
        unsafe { write_entry::<A>(self.window.ptr::<u8>(table), index, raw) }
    }

    /// Reads one root entry of `dir`; 0 for an out-of-range index or a
    /// directory this VMM does not know.
    pub fn root_entry(&self, dir: PhysAddr, index: usize) -> u64 {
        if index >= A::ENTRIES || !self.owns_directory(dir) {
            return 0;
        }
        self.read(dir, index)
    }

    /// Walks from `root` towards `virt` and stops at the leaf entry, the
    /// first non-present entry, or a block.
    fn find_slot(&self, root: PhysAddr, virt: VirtAddr) -> Result<Slot, EntryError> {
        let mut table = root;
        let mut level = A::LEVELS - 1;
        let mut tables_walked = 0;
        loop {
            let index = A::index(virt, level);
            let raw = self.read(table, index);
            tables_walked += 1;
            A::validate_entry(raw, level)?;
            if level == 0 || !A::is_present(raw) || A::is_block(raw, level) {
                return Ok(Slot { table, index, level, raw, tables_walked });
            }
            table = A::entry_addr(raw);
            level -= 1;
        }
    }

    /// True for the master and for allocated, aligned frames: anything else
    /// handed in as a directory would send a walk through foreign memory.
    fn owns_directory(&self, dir: PhysAddr) -> bool {
        dir.is_valid() && dir.is_page_aligned() && (dir == self.master || self.pmm.is_allocated(dir))
    }

    /// Root used for `virt`: kernel addresses always live in the master.
    #[inline]
    fn root_for(&self, dir: PhysAddr, virt: VirtAddr) -> PhysAddr {
        if A::is_kernel(virt) { self.master } else { dir }
    }

    #[inline]
    fn flush_if_visible(&self, dir: PhysAddr, virt: VirtAddr) {
        if A::is_kernel(virt) || self.mmu.active_root() == dir {
            self.mmu.flush_page(virt);
        }
    }

    // ── Directory lifecycle ─────────────────────────────────────

    pub fn kernel_directory(&self) -> PhysAddr {
        self.master
    }

    pub fn current_directory(&self) -> PhysAddr {
        self.mmu.active_root()
    }

    /// Loads `dir` into the MMU.
    ///
    /// # Safety
    ///
    /// `dir` must be the master or a live directory created by this VMM, and
    /// its kernel half must map the code that is running.
    pub unsafe fn switch_page_directory(&self, dir: PhysAddr) -> HalResult<()> {
        if !self.owns_directory(dir) {
            return Err(HalError::InvalidParam);
        }
        // SAFETY: forwarded from the caller.
        unsafe { self.mmu.set_active_root(dir) };
        Ok(())
    }

    /// Fills every empty kernel root slot of the master with a fresh table,
    /// so directories created afterwards never go stale.
    pub fn preallocate_kernel_tables(&self) -> HalResult<usize> {
        let _irq = IrqGuard::new();
        let root = A::LEVELS - 1;
        let mut added = 0;
        for index in A::kernel_root_range() {
            if A::is_present(self.read(self.master, index)) {
                continue;
            }
            let table = self.pmm.allocate().ok_or(HalError::NoMemory)?;
            self.write(self.master, index, root, A::table_entry(table.into_raw(), false));
            added += 1;
        }
        klog::debug!("VMM[{}]: preallocated {} kernel tables", A::NAME, added);
        Ok(added)
    }

    /// New directory: kernel root entries copied from the master, user
    /// region empty.
    pub fn create_page_directory(&self) -> Option<PhysAddr> {
        let _irq = IrqGuard::new();
        let dir = self.pmm.allocate()?.into_raw();
        let root = A::LEVELS - 1;
        for index in A::kernel_root_range() {
            self.write(dir, index, root, self.read(self.master, index));
        }
        Some(dir)
    }

    /// Duplicates the user half of `src` for fork.
    ///
    /// Writable leaves become read-only+COW in both directories; read-only
    /// and already-COW leaves are shared as they are. Every shared frame
    /// gains one reference. On failure the partial clone is torn down and
    /// `None` is returned.
    pub fn clone_page_directory(&self, src: PhysAddr) -> Option<PhysAddr> {
        if src == self.master || !self.owns_directory(src) {
            return None;
        }
        let _irq = IrqGuard::new();
        let dst = self.create_page_directory()?;
        let root = A::LEVELS - 1;
        let ok = A::user_root_range().all(|index| self.clone_entry(src, dst, index, root));
        // Leaves of `src` may have lost write access even on failure.
        if self.mmu.active_root() == src {
            self.mmu.flush_all();
        }
        if !ok {
            self.teardown(dst);
            return None;
        }
        klog::trace!("VMM[{}]: cloned {:?} -> {:?}", A::NAME, src, dst);
        Some(dst)
    }

    fn clone_entry(&self, src: PhysAddr, dst: PhysAddr, index: usize, level: usize) -> bool {
        let raw = self.read(src, index);
        if !A::is_present(raw) {
            return true;
        }
        if A::validate_entry(raw, level).is_err() {
            return false;
        }
        if level == 0 {
            let flags = A::leaf_flags(raw);
            let shared = if flags.contains(PageFlags::WRITABLE) {
                let cow = A::with_leaf_flags(raw, flags.difference(PageFlags::WRITABLE) | PageFlags::COW);
                self.write(src, index, 0, cow);
                cow
            } else {
                raw
            };
            self.write(dst, index, 0, shared);
            self.pmm.ref_inc(A::entry_addr(raw));
            return true;
        }
        // User huge pages are never created, so one here is foreign.
        if A::is_block(raw, level) {
            return false;
        }
        let Some(table) = self.pmm.allocate() else {
            return false;
        };
        // The entry owns the table from here; teardown frees it on failure.
        let table = table.into_raw();
        self.write(dst, index, level, A::table_entry(table, true));
        let src_table = A::entry_addr(raw);
        (0..A::ENTRIES).all(|i| self.clone_entry(src_table, table, i, level - 1))
    }

    /// Tears down a task directory: drops every user leaf reference, frees
    /// the user tables, then the directory frame.
    ///
    /// Refuses (returns false) the master and the active directory.
    pub fn free_page_directory(&self, dir: PhysAddr) -> bool {
        if dir == self.master || !self.owns_directory(dir) {
            return false;
        }
        if self.mmu.active_root() == dir {
            return false;
        }
        let _irq = IrqGuard::new();
        self.teardown(dir);
        true
    }

    fn teardown(&self, dir: PhysAddr) {
        let root = A::LEVELS - 1;
        for index in A::user_root_range() {
            self.free_entry(dir, index, root);
        }
        self.pmm.free_frame(dir);
    }

    fn free_entry(&self, table: PhysAddr, index: usize, level: usize) {
        let raw = self.read(table, index);
        // A corrupted entry is leaked rather than trusted.
        if !A::is_present(raw) || A::validate_entry(raw, level).is_err() {
            return;
        }
        let target = A::entry_addr(raw);
        if level > 0 && !A::is_block(raw, level) {
            for i in 0..A::ENTRIES {
                self.free_entry(target, i, level - 1);
            }
        }
        self.pmm.free_frame(target);
    }

    // ── Mapping ─────────────────────────────────────────────────

    /// Maps `virt` → `phys` in the active directory.
    pub fn map_page(&self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> bool {
        self.map_page_in_directory(self.current_directory(), virt, phys, flags).is_ok()
    }

    /// Maps one 4 KiB page in `dir`, allocating intermediate tables on
    /// demand. The mapping takes over the caller's reference on `phys`.
    ///
    /// Tables allocated by a failed call are unlinked and freed again.
    pub fn map_page_in_directory(
        &self,
        dir: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !self.owns_directory(dir) {
            return Err(MapError::InvalidAddress);
        }
        if !virt.is_page_aligned() || !phys.is_valid() || !phys.is_page_aligned() || !A::phys_fits(phys) {
            return Err(MapError::InvalidAddress);
        }
        let kernel = A::is_kernel(virt);
        if !kernel && !A::is_user(virt) {
            return Err(MapError::InvalidAddress);
        }
        if kernel && flags.contains(PageFlags::USER) {
            return Err(MapError::InvalidAddress);
        }
        if flags.contains(PageFlags::NO_EXECUTE) && !A::SUPPORTS_NX {
            return Err(MapError::NotSupported);
        }

        let _irq = IrqGuard::new();
        let root = self.root_for(dir, virt);
        let mut fresh = FreshTables::new();
        let result = self.install(root, virt, A::leaf_entry(phys, flags), !kernel, &mut fresh);
        if result.is_err() {
            for &(parent, index, level, table) in fresh.entries[..fresh.len].iter().rev() {
                self.write(parent, index, level, 0);
                // SAFETY: the entry just cleared held the table's only reference.
                drop(unsafe { Frame::from_raw(self.pmm, table) });
            }
            return result;
        }
        if kernel && dir != self.master {
            let index = A::index(virt, A::LEVELS - 1);
            self.write(dir, index, A::LEVELS - 1, self.read(self.master, index));
        }
        self.flush_if_visible(dir, virt);
        Ok(())
    }

    fn install(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        leaf: u64,
        user: bool,
        fresh: &mut FreshTables,
    ) -> Result<(), MapError> {
        let mut table = root;
        for level in (1..A::LEVELS).rev() {
            let index = A::index(virt, level);
            let raw = self.read(table, index);
            A::validate_entry(raw, level)?;
            if !A::is_present(raw) {
                let next = self.pmm.allocate().ok_or(MapError::OutOfMemory)?.into_raw();
                self.write(table, index, level, A::table_entry(next, user));
                fresh.push(table, index, level, next);
                table = next;
            } else if A::is_block(raw, level) {
                return Err(MapError::HugePageConflict);
            } else {
                table = A::entry_addr(raw);
            }
        }
        let index = A::index(virt, 0);
        let raw = self.read(table, index);
        A::validate_entry(raw, 0)?;
        if A::is_present(raw) {
            return Err(MapError::AlreadyMapped);
        }
        self.write(table, index, 0, leaf);
        Ok(())
    }

    /// Unmaps `virt` from the active directory.
    pub fn unmap_page(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.unmap_page_in_directory(self.current_directory(), virt)
    }

    /// Removes the 4 KiB mapping of `virt` and returns its frame together
    /// with the reference the mapping held.
    pub fn unmap_page_in_directory(&self, dir: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        if !self.owns_directory(dir) || !virt.is_page_aligned() || !(A::is_user(virt) || A::is_kernel(virt)) {
            return None;
        }
        let _irq = IrqGuard::new();
        let slot = self.find_slot(self.root_for(dir, virt), virt).ok()?;
        if slot.level != 0 || !A::is_present(slot.raw) {
            return None;
        }
        self.write(slot.table, slot.index, 0, 0);
        self.flush_if_visible(dir, virt);
        Some(A::entry_addr(slot.raw))
    }

    /// Unmaps `virt` and drops the mapping's frame reference.
    pub fn release_page(&self, dir: PhysAddr, virt: VirtAddr) -> bool {
        match self.unmap_page_in_directory(dir, virt) {
            Some(frame) => {
                self.pmm.free_frame(frame);
                true
            }
            None => false,
        }
    }

    // ── Lookup ──────────────────────────────────────────────────

    pub fn query(&self, dir: PhysAddr, virt: VirtAddr) -> Option<Mapping> {
        if !self.owns_directory(dir) || !(A::is_user(virt) || A::is_kernel(virt)) {
            return None;
        }
        let slot = self.find_slot(self.root_for(dir, virt), virt).ok()?;
        if !A::is_present(slot.raw) {
            return None;
        }
        Some(Mapping {
            frame: A::entry_addr(slot.raw),
            flags: A::leaf_flags(slot.raw),
            level: slot.level,
            tables_walked: slot.tables_walked,
        })
    }

    /// Physical address `virt` resolves to in `dir`, offset included.
    pub fn translate(&self, dir: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        let m = self.query(dir, virt)?;
        let span = A::level_span(m.level);
        Some(m.frame + (virt.as_u64() & (span - 1)))
    }

    // ── Faults ──────────────────────────────────────────────────

    /// Resolves a write fault on a COW page of the active directory.
    pub fn handle_cow_page_fault(&self, addr: VirtAddr, code: FaultCode) -> Result<(), CowError> {
        self.handle_cow_page_fault_in(self.current_directory(), addr, code)
    }

    /// Sole owner (refcount 1): write access is restored in place. Shared:
    /// the page is copied into a fresh frame, remapped writable, and one
    /// reference on the original is dropped.
    pub fn handle_cow_page_fault_in(
        &self,
        dir: PhysAddr,
        addr: VirtAddr,
        code: FaultCode,
    ) -> Result<(), CowError> {
        let page = addr.page_align_down();
        if !self.owns_directory(dir) || !code.contains(FaultCode::WRITE) || !A::is_user(page) {
            return Err(CowError::NotCow);
        }
        let _irq = IrqGuard::new();
        let slot = self.find_slot(dir, page)?;
        if slot.level != 0 || !A::is_present(slot.raw) {
            return Err(CowError::NotCow);
        }
        let flags = A::leaf_flags(slot.raw);
        if !flags.contains(PageFlags::COW) {
            return Err(CowError::NotCow);
        }
        let writable = flags.difference(PageFlags::COW) | PageFlags::WRITABLE;
        let original = A::entry_addr(slot.raw);

        if self.pmm.refcount(original) <= 1 {
            self.write(slot.table, slot.index, 0, A::with_leaf_flags(slot.raw, writable));
        } else {
            let copy = self.pmm.allocate().ok_or(CowError::OutOfMemory)?;
            // SAFETY: both frames are allocated and reachable through the
            // window; `copy` is fresh so they cannot overlap.
            unsafe { self.window.copy_frame(original, copy.addr()) };
            self.write(slot.table, slot.index, 0, A::rebuild_leaf(slot.raw, copy.into_raw(), writable));
            // SAFETY: the entry just overwritten held one reference.
            drop(unsafe { Frame::from_raw(self.pmm, original) });
        }
        if self.mmu.active_root() == dir {
            self.mmu.flush_page(page);
        }
        Ok(())
    }

    /// Resyncs a stale kernel root entry of the active directory.
    pub fn handle_kernel_page_fault(&self, addr: VirtAddr) -> bool {
        self.handle_kernel_page_fault_in(self.current_directory(), addr)
    }

    /// Copies the master's root entry for `addr` into `dir` when `dir`
    /// missed it. False when the address is unmapped in the master too.
    pub fn handle_kernel_page_fault_in(&self, dir: PhysAddr, addr: VirtAddr) -> bool {
        if !A::is_kernel(addr) || dir == self.master || !self.owns_directory(dir) {
            return false;
        }
        let root = A::LEVELS - 1;
        let index = A::index(addr, root);
        let _irq = IrqGuard::new();
        let master_entry = self.read(self.master, index);
        if !A::is_present(master_entry) || self.read(dir, index) == master_entry {
            return false;
        }
        self.write(dir, index, root, master_entry);
        self.mmu.flush_page(addr.page_align_down());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimRam, USER_PAGE, user_rw, with_vmm};
    use khal::arch::{Aarch64, I686, X86_64};
    use khal::mmu::SoftMmu;

    fn kernel_page<A: PageTableFormat>() -> VirtAddr {
        VirtAddr::new(A::KERNEL_VIRTUAL_BASE + 0x20_0000)
    }

    fn map_and_translate<A: PageTableFormat>() {
        with_vmm::<A>(256, |_, vmm| {
            let dir = vmm.create_page_directory().unwrap();
            let frame = vmm.pmm().alloc_frame().unwrap();
            vmm.map_page_in_directory(dir, USER_PAGE, frame, user_rw::<A>()).unwrap();
            assert_eq!(vmm.translate(dir, USER_PAGE + 0x123), Some(frame + 0x123));
            let m = vmm.query(dir, USER_PAGE).unwrap();
            assert_eq!(m.tables_walked, A::LEVELS);
            assert!(m.flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER));
            assert_eq!(
                vmm.map_page_in_directory(dir, USER_PAGE, frame, user_rw::<A>()),
                Err(MapError::AlreadyMapped)
            );
            assert_eq!(vmm.unmap_page_in_directory(dir, USER_PAGE), Some(frame));
            assert_eq!(vmm.translate(dir, USER_PAGE), None);
            vmm.pmm().free_frame(frame);
            assert!(vmm.free_page_directory(dir));
        });
    }

    #[test]
    fn map_translate_unmap_all_arches() {
        map_and_translate::<I686>();
        map_and_translate::<X86_64>();
        map_and_translate::<Aarch64>();
    }

    fn rejects_bad_requests<A: PageTableFormat>() {
        with_vmm::<A>(128, |_, vmm| {
            let dir = vmm.create_page_directory().unwrap();
            let f = vmm.pmm().alloc_frame().unwrap();
            let kernel = kernel_page::<A>();
            let bad = [
                (USER_PAGE + 1, f),
                (USER_PAGE, f + 8),
                (VirtAddr::new(0x1000), f),
                (USER_PAGE, PhysAddr::INVALID),
            ];
            for (v, p) in bad {
                assert_eq!(
                    vmm.map_page_in_directory(dir, v, p, user_rw::<A>()),
                    Err(MapError::InvalidAddress),
                    "{:?} -> {:?}",
                    v,
                    p
                );
            }
            assert_eq!(
                vmm.map_page_in_directory(dir, kernel, f, PageFlags::WRITABLE | PageFlags::USER),
                Err(MapError::InvalidAddress)
            );
            let nx = vmm.map_page_in_directory(dir, USER_PAGE, f, PageFlags::USER | PageFlags::NO_EXECUTE);
            if A::SUPPORTS_NX {
                assert_eq!(nx, Ok(()));
            } else {
                assert_eq!(nx, Err(MapError::NotSupported));
            }
        });
    }

    #[test]
    fn invalid_requests_are_rejected_all_arches() {
        rejects_bad_requests::<I686>();
        rejects_bad_requests::<X86_64>();
        rejects_bad_requests::<Aarch64>();
    }

    #[test]
    fn failed_map_frees_the_tables_it_allocated() {
        with_vmm::<X86_64>(64, |_, vmm| {
            let dir = vmm.create_page_directory().unwrap();
            // Leave exactly two frames: the PML4 slot needs three tables.
            let mut hoard = Vec::new();
            while vmm.pmm().free_frame_count() > 2 {
                hoard.push(vmm.pmm().alloc_frame().unwrap());
            }
            let frame = hoard.pop().unwrap();
            let before = vmm.pmm().free_frame_count();
            assert_eq!(
                vmm.map_page_in_directory(dir, USER_PAGE, frame, PageFlags::USER_DATA),
                Err(MapError::OutOfMemory)
            );
            assert_eq!(vmm.pmm().free_frame_count(), before);
            assert_eq!(vmm.root_entry(dir, 0), 0, "unlinked again");
        });
    }

    #[test]
    fn unknown_directories_are_refused() {
        with_vmm::<X86_64>(64, |_, vmm| {
            let f = vmm.pmm().alloc_frame().unwrap();
            let stale = vmm.create_page_directory().unwrap();
            assert!(vmm.free_page_directory(stale));
            let write = FaultCode::PRESENT | FaultCode::WRITE | FaultCode::USER;
            for dir in [PhysAddr::INVALID, f + 8, stale] {
                assert_eq!(
                    vmm.map_page_in_directory(dir, USER_PAGE, f, PageFlags::USER_DATA),
                    Err(MapError::InvalidAddress),
                    "{:?}",
                    dir
                );
                assert_eq!(vmm.unmap_page_in_directory(dir, USER_PAGE), None);
                assert!(!vmm.release_page(dir, USER_PAGE));
                assert_eq!(vmm.query(dir, USER_PAGE), None);
                assert_eq!(vmm.translate(dir, USER_PAGE), None);
                assert_eq!(vmm.handle_cow_page_fault_in(dir, USER_PAGE, write), Err(CowError::NotCow));
                assert!(!vmm.handle_kernel_page_fault_in(dir, kernel_page::<X86_64>()));
                assert_eq!(vmm.root_entry(dir, 0), 0);
                assert_eq!(vmm.clone_page_directory(dir), None);
                assert!(unsafe { vmm.switch_page_directory(dir) }.is_err());
            }
            assert!(!vmm.pmm().is_allocated(stale), "nothing was built in the freed frame");
            assert_eq!(vmm.pmm().refcount(f), 1);
        });
    }

    #[test]
    fn failed_clone_returns_every_frame() {
        with_vmm::<X86_64>(64, |_, vmm| {
            let src = vmm.create_page_directory().unwrap();
            let second = VirtAddr::new(X86_64::level_span(X86_64::LEVELS - 1));
            let a = vmm.pmm().alloc_frame().unwrap();
            let b = vmm.pmm().alloc_frame().unwrap();
            vmm.map_page_in_directory(src, USER_PAGE, a, PageFlags::USER_DATA).unwrap();
            vmm.map_page_in_directory(src, second, b, PageFlags::USER_DATA).unwrap();
            assert_ne!(X86_64::index(USER_PAGE, 3), X86_64::index(second, 3));

            // The new directory plus PDPT/PD/PT for the first root slot.
            let mut hoard = Vec::new();
            while vmm.pmm().free_frame_count() > 4 {
                hoard.push(vmm.pmm().alloc_frame().unwrap());
            }
            let before = vmm.pmm().free_frame_count();
            assert_eq!(vmm.clone_page_directory(src), None);
            assert_eq!(vmm.pmm().free_frame_count(), before);
            assert_eq!(vmm.pmm().refcount(a), 1);
            assert_eq!(vmm.pmm().refcount(b), 1);
            assert_eq!(vmm.translate(src, USER_PAGE), Some(a));
            assert_eq!(vmm.translate(src, second), Some(b));
        });
    }

    #[test]
    fn cow_keeps_the_leaf_memory_type() {
        // Bit 7 of an x86 4 KiB leaf selects the PAT entry.
        const PAT: u64 = 1 << 7;
        with_vmm::<X86_64>(64, |ram, vmm| {
            let parent = vmm.create_page_directory().unwrap();
            let f = vmm.pmm().alloc_frame().unwrap();
            ram.bytes_mut(f)[0] = 0x5A;
            vmm.map_page_in_directory(parent, USER_PAGE, f, PageFlags::USER_DATA).unwrap();
            let leaf = vmm.find_slot(parent, USER_PAGE).unwrap();
            vmm.write(leaf.table, leaf.index, 0, leaf.raw | PAT);

            let child = vmm.clone_page_directory(parent).unwrap();
            let write = FaultCode::PRESENT | FaultCode::WRITE | FaultCode::USER;
            // Shared: the child gets a copy.
            vmm.handle_cow_page_fault_in(child, USER_PAGE, write).unwrap();
            let copied = vmm.find_slot(child, USER_PAGE).unwrap();
            let copy = X86_64::entry_addr(copied.raw);
            assert_ne!(copy, f);
            assert_eq!(ram.bytes(copy)[0], 0x5A);
            assert_eq!(copied.raw & PAT, PAT);
            assert_eq!(vmm.pmm().refcount(copy), 1);
            // Sole owner again: the parent gets write access back in place.
            assert_eq!(vmm.pmm().refcount(f), 1);
            vmm.handle_cow_page_fault_in(parent, USER_PAGE, write).unwrap();
            let restored = vmm.find_slot(parent, USER_PAGE).unwrap();
            assert_eq!(X86_64::entry_addr(restored.raw), f);
            assert_eq!(restored.raw & PAT, PAT);
            assert!(vmm.query(parent, USER_PAGE).unwrap().flags.contains(PageFlags::WRITABLE));
        });
    }

    #[test]
    fn huge_page_blocks_a_small_mapping() {
        with_vmm::<X86_64>(64, |_, vmm| {
            let dir = vmm.create_page_directory().unwrap();
            let f = vmm.pmm().alloc_frame().unwrap();
            vmm.map_page_in_directory(dir, USER_PAGE, f, PageFlags::USER_DATA).unwrap();
            // Turn the PD entry covering USER_PAGE into a 2 MiB page.
            let m = vmm.query(dir, USER_PAGE).unwrap();
            assert_eq!(m.level, 0);
            let pdpt = X86_64::entry_addr(vmm.root_entry(dir, 0));
            let pd = X86_64::entry_addr(vmm.read(pdpt, 0));
            let pd_index = X86_64::index(USER_PAGE, 1);
            vmm.write(pd, pd_index, 1, 0x0020_0000 | 0x87);
            let next = USER_PAGE + 0x1000;
            let g = vmm.pmm().alloc_frame().unwrap();
            assert_eq!(
                vmm.map_page_in_directory(dir, next, g, PageFlags::USER_DATA),
                Err(MapError::HugePageConflict)
            );
            assert_eq!(vmm.translate(dir, next + 4), Some(PhysAddr::new(0x0020_1004)));
        });
    }

    fn kernel_mappings_go_through_master<A: PageTableFormat>() {
        with_vmm::<A>(256, |_, vmm| {
            let early = vmm.create_page_directory().unwrap();
            let frame = vmm.pmm().alloc_frame().unwrap();
            let kpage = kernel_page::<A>();
            vmm.map_page_in_directory(early, kpage, frame, PageFlags::WRITABLE).unwrap();
            let master = vmm.kernel_directory();
            assert_eq!(vmm.translate(master, kpage), Some(frame));
            assert_eq!(vmm.translate(early, kpage), Some(frame));

            // A second kernel slot appears after `late` was created from
            // the first state: `late` misses it until resynced.
            let late = vmm.create_page_directory().unwrap();
            let far = VirtAddr::new(A::VIRT_MAX - 0xFFF - A::level_span(A::LEVELS - 1));
            let other = vmm.pmm().alloc_frame().unwrap();
            assert!(vmm.map_page(far, other, PageFlags::WRITABLE));
            let root = A::index(far, A::LEVELS - 1);
            assert_ne!(vmm.root_entry(late, root), vmm.root_entry(master, root));
            assert!(vmm.handle_kernel_page_fault_in(late, far));
            assert_eq!(vmm.root_entry(late, root), vmm.root_entry(master, root));
            assert!(!vmm.handle_kernel_page_fault_in(late, far), "already in sync");
            assert!(!vmm.handle_kernel_page_fault_in(late, USER_PAGE));
        });
    }

    #[test]
    fn kernel_region_is_shared_through_master_all_arches() {
        kernel_mappings_go_through_master::<I686>();
        kernel_mappings_go_through_master::<X86_64>();
        kernel_mappings_go_through_master::<Aarch64>();
    }

    #[test]
    fn preallocated_kernel_tables_leave_nothing_to_resync() {
        with_vmm::<I686>(512, |_, vmm| {
            let added = vmm.preallocate_kernel_tables().unwrap();
            assert_eq!(added, I686::kernel_root_range().len());
            assert_eq!(vmm.preallocate_kernel_tables(), Ok(0));
            let dir = vmm.create_page_directory().unwrap();
            let f = vmm.pmm().alloc_frame().unwrap();
            let kpage = kernel_page::<I686>();
            assert!(vmm.map_page(kpage, f, PageFlags::WRITABLE));
            assert!(!vmm.handle_kernel_page_fault_in(dir, kpage));
            assert_eq!(vmm.translate(dir, kpage), Some(f));
        });
    }

    #[test]
    fn master_and_active_directories_are_not_freed() {
        with_vmm::<X86_64>(64, |_, vmm| {
            assert!(!vmm.free_page_directory(vmm.kernel_directory()));
            let dir = vmm.create_page_directory().unwrap();
            unsafe { vmm.switch_page_directory(dir) }.unwrap();
            assert!(!vmm.free_page_directory(dir));
            unsafe { vmm.switch_page_directory(vmm.kernel_directory()) }.unwrap();
            assert!(vmm.free_page_directory(dir));
            assert!(!vmm.free_page_directory(dir), "second free is refused");
        });
    }

    #[test]
    fn flushes_only_what_the_cpu_can_see() {
        let ram = SimRam::new(64);
        let pmm = ram.pmm();
        let mmu = SoftMmu::new();
        let vmm = Vmm::<X86_64, _>::bootstrap(&pmm, &mmu, ram.window()).unwrap();
        let dir = vmm.create_page_directory().unwrap();
        unsafe { vmm.switch_page_directory(dir) }.unwrap();
        let f = pmm.alloc_frame().unwrap();
        assert!(vmm.map_page(USER_PAGE, f, PageFlags::USER_DATA));
        assert_eq!(mmu.page_flushes(), 1);

        let inactive = vmm.create_page_directory().unwrap();
        let g = pmm.alloc_frame().unwrap();
        vmm.map_page_in_directory(inactive, USER_PAGE, g, PageFlags::USER_DATA).unwrap();
        assert_eq!(mmu.page_flushes(), 1);

        let full = mmu.full_flushes();
        let child = vmm.clone_page_directory(dir).unwrap();
        assert_eq!(mmu.full_flushes(), full + 1, "active source lost write access");
        let _ = vmm.clone_page_directory(inactive).unwrap();
        assert_eq!(mmu.full_flushes(), full + 1);
        assert!(vmm.release_page(child, USER_PAGE));
        assert_eq!(mmu.page_flushes(), 1);
    }
}
