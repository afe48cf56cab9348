// =============================================================================
// Stratum — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual one is the classic paging bug:
// the compiler should refuse to let one stand in for the other. Both are
// newtypes over u64 on every architecture. i686 only ever produces values
// below 4 GiB; the per-architecture page-table format rejects anything wider.
//
// PHYSICAL WINDOW:
//   The kernel reaches physical memory through a linear alias:
//     virt = window.offset + phys
//   On x86_64/AArch64 this is the Limine HHDM, on i686 the higher-half
//   direct map at 0xC000_0000, and in hosted tests a page-aligned buffer.
//   The window is a value, not a global, so the allocators can be built
//   against any backing store.
//
// =============================================================================

use core::fmt;

/// Size of a standard page (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

/// Bit shift for standard pages (4K = 2^12).
pub const PAGE_SHIFT: u64 = 12;

/// Raw "no frame" sentinel for interfaces that cannot carry an `Option`.
///
/// Zero is a legitimate physical address, so it cannot be the sentinel.
pub const PADDR_INVALID: u64 = u64::MAX;

// =============================================================================
// PhysAddr — A physical memory address
// =============================================================================

/// A physical memory address, 64 bits wide on every architecture.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// The invalid sentinel as a typed value.
    pub const INVALID: PhysAddr = PhysAddr(PADDR_INVALID);

    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Builds the address of page frame `pfn`.
    #[inline]
    pub const fn from_pfn(pfn: usize) -> Self {
        Self((pfn as u64) << PAGE_SHIFT)
    }

    /// Page-frame number: index into the PMM bitmap and refcount array.
    #[inline]
    pub const fn pfn(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != PADDR_INVALID
    }

    /// Returns true if this address is aligned to a 4KB page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Aligns up to the next 4 KiB boundary, saturating at the top of the
    /// address space.
    #[inline]
    pub const fn page_align_up(self) -> Self {
        match self.0.checked_add(PAGE_SIZE - 1) {
            Some(v) => Self(v & !(PAGE_SIZE - 1)),
            None => Self(u64::MAX & !(PAGE_SIZE - 1)),
        }
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// The `P:` prefix distinguishes it from virtual addresses in log output.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "P:{:#010X}", self.0)
        } else {
            f.write_str("P:INVALID")
        }
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl core::ops::Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: PhysAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// VirtAddr — A virtual memory address
// =============================================================================

/// A virtual memory address.
///
/// Word-sized on the hardware (32-bit on i686, 64-bit elsewhere) but stored
/// as u64 so the architecture-neutral VMM can handle every format with one
/// type. Range checks live in `PageTableFormat`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Bits 48-63 are copies of bit 47 (x86_64 / AArch64 48-bit rule).
    #[inline]
    pub const fn is_canonical(self) -> bool {
        ((self.0 << 16) as i64 >> 16) as u64 == self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> u16 {
        (self.0 & (PAGE_SIZE - 1)) as u16
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

// =============================================================================
// PhysWindow — kernel alias of physical memory
// =============================================================================

/// Linear mapping through which the kernel touches physical frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysWindow {
    offset: u64,
}

impl PhysWindow {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(self) -> u64 {
        self.offset
    }

    #[inline]
    pub const fn virt(self, phys: PhysAddr) -> VirtAddr {
        VirtAddr(self.offset.wrapping_add(phys.0))
    }

    #[inline]
    pub const fn ptr<T>(self, phys: PhysAddr) -> *mut T {
        self.offset.wrapping_add(phys.0) as usize as *mut T
    }

    /// Fills one frame with zeros.
    ///
    /// # Safety
    /// `frame` must be page-aligned and reachable through the window, and no
    /// live reference may point into it.
    pub unsafe fn zero_frame(self, frame: PhysAddr) {
        unsafe { core::ptr::write_bytes(self.ptr::<u8>(frame), 0, PAGE_SIZE as usize) }
    }

    /// Copies one whole frame.
    ///
    /// # Safety
    /// Both frames must be reachable through the window and must not overlap.
    pub unsafe fn copy_frame(self, src: PhysAddr, dst: PhysAddr) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ptr::<u8>(src) as *const u8,
                self.ptr::<u8>(dst),
                PAGE_SIZE as usize,
            )
        }
    }
}
