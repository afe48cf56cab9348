// =============================================================================
// Stratum — Page-Table Format Abstraction
// =============================================================================
//
// Each architecture stores mappings in its own native format:
//
//   i686     2 levels × 1024 entries × 4 bytes    PDE[31:22] PTE[21:12]
//   x86_64   4 levels ×  512 entries × 8 bytes    PML4 PDPT PD PT
//   AArch64  4 levels ×  512 entries × 8 bytes    L0 L1 L2 L3 (4 KiB granule)
//
// The VMM never touches those bits directly. It speaks `PageFlags` and asks a
// `PageTableFormat` implementor to encode, decode and validate entries. The
// implementor is a zero-sized marker type picked at build time, so the walk
// compiles down to the same code as a hand-written single-arch VMM.
//
// LEVEL NUMBERING:
//   Level 0 is the leaf table (PT / L3). Level LEVELS-1 is the root
//   (page directory / PML4 / L0). This matches the order of
//   `index(virt, level)` shifts: 12 + level × bits-per-level.
//
// =============================================================================

use core::ops::Range;

use bitflags::bitflags;

use crate::addr::{PAGE_SHIFT, PhysAddr, VirtAddr};
use crate::error::HalError;

bitflags! {
    /// Architecture-neutral mapping attributes.
    ///
    /// Formats translate these into their own bits. `PRESENT` is reported by
    /// decoding and implied when encoding a leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const GLOBAL        = 1 << 8;
        /// Software bit: read-only because the frame is shared copy-on-write.
        const COW           = 1 << 9;
        const NO_EXECUTE    = 1 << 31;
    }
}

impl PageFlags {
    /// Kernel data: read/write, never executable.
    pub const KERNEL_DATA: Self = Self::WRITABLE.union(Self::NO_EXECUTE);

    /// User data: read/write from ring 3 / EL0, never executable.
    pub const USER_DATA: Self = Self::WRITABLE.union(Self::USER).union(Self::NO_EXECUTE);

    /// User text: readable and executable from ring 3 / EL0.
    pub const USER_CODE: Self = Self::USER;
}

/// Why a raw entry failed format validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    /// Output address not aligned to the size this entry maps.
    Misaligned,
    /// Bits the architecture reserves (or this kernel never sets) are set.
    ReservedBits,
    /// Output address wider than the architecture's physical address space.
    AddressTooWide,
}

impl From<EntryError> for HalError {
    fn from(_: EntryError) -> Self {
        HalError::InvalidParam
    }
}

/// Native page-table format of one architecture.
pub trait PageTableFormat {
    const NAME: &'static str;
    const LEVELS: usize;
    const ENTRIES: usize;
    const ENTRY_SIZE: usize;

    const USER_SPACE_START: u64;
    const USER_SPACE_END: u64;
    const KERNEL_VIRTUAL_BASE: u64;
    /// Highest virtual address the format can express.
    const VIRT_MAX: u64;
    const PHYS_ADDR_BITS: u32;
    const SUPPORTS_NX: bool;
    /// Leaf bits `PageFlags` does not model (memory type selectors, spare
    /// software bits). `with_leaf_flags` carries them over unchanged.
    const LEAF_KEPT_BITS: u64 = 0;

    /// Entry encoding for a next-level table.
    fn table_entry(table: PhysAddr, user: bool) -> u64;

    /// Entry encoding for a 4 KiB leaf mapping. `PRESENT` is implied.
    fn leaf_entry(frame: PhysAddr, flags: PageFlags) -> u64;

    fn is_present(raw: u64) -> bool;

    /// True for a present entry above level 0 that maps memory directly
    /// (huge page / block descriptor) instead of pointing at a table.
    fn is_block(raw: u64, level: usize) -> bool;

    fn entry_addr(raw: u64) -> PhysAddr;

    /// Decodes a leaf entry. Empty for a non-present entry.
    fn leaf_flags(raw: u64) -> PageFlags;

    /// Checks a raw entry at `level` for format violations.
    fn validate_entry(raw: u64, level: usize) -> Result<(), EntryError>;

    /// Re-encodes a leaf with the same frame and new attributes.
    fn with_leaf_flags(raw: u64, flags: PageFlags) -> u64 {
        Self::rebuild_leaf(raw, Self::entry_addr(raw), flags)
    }

    /// A leaf for `frame` with `flags` that keeps the unmodelled bits of
    /// `raw`, the entry it replaces.
    fn rebuild_leaf(raw: u64, frame: PhysAddr, flags: PageFlags) -> u64 {
        (raw & Self::LEAF_KEPT_BITS) | (Self::leaf_entry(frame, flags) & !Self::LEAF_KEPT_BITS)
    }

    #[inline]
    fn bits_per_level() -> u32 {
        Self::ENTRIES.trailing_zeros()
    }

    /// Table index of `virt` at `level` (0 = leaf table).
    #[inline]
    fn index(virt: VirtAddr, level: usize) -> usize {
        let shift = PAGE_SHIFT as u32 + level as u32 * Self::bits_per_level();
        ((virt.as_u64() >> shift) as usize) & (Self::ENTRIES - 1)
    }

    /// Bytes covered by one entry at `level`.
    #[inline]
    fn level_span(level: usize) -> u64 {
        1u64 << (PAGE_SHIFT as u32 + level as u32 * Self::bits_per_level())
    }

    /// Root slots shared by every directory: owned by the master directory.
    fn kernel_root_range() -> Range<usize> {
        Self::index(VirtAddr::new(Self::KERNEL_VIRTUAL_BASE), Self::LEVELS - 1)..Self::ENTRIES
    }

    /// Root slots owned by each task.
    fn user_root_range() -> Range<usize> {
        0..Self::kernel_root_range().start
    }

    #[inline]
    fn is_user(virt: VirtAddr) -> bool {
        let v = virt.as_u64();
        v >= Self::USER_SPACE_START && v < Self::USER_SPACE_END
    }

    #[inline]
    fn is_kernel(virt: VirtAddr) -> bool {
        let v = virt.as_u64();
        v >= Self::KERNEL_VIRTUAL_BASE && v <= Self::VIRT_MAX
    }

    #[inline]
    fn phys_fits(phys: PhysAddr) -> bool {
        Self::PHYS_ADDR_BITS >= 64 || phys.as_u64() >> Self::PHYS_ADDR_BITS == 0
    }
}

/// Reads entry `index` of the table at `table`.
///
/// # Safety
/// `table` must point at a live page table of format `F`, and `index` must
/// be below `F::ENTRIES`.
#[inline]
pub unsafe fn read_entry<F: PageTableFormat>(table: *const u8, index: usize) -> u64 {
    debug_assert!(index < F::ENTRIES);
    unsafe {
        match F::ENTRY_SIZE {
            4 => u64::from((table as *const u32).add(index).read_volatile()),
            _ => (table as *const u64).add(index).read_volatile(),
        }
    }
}

/// Writes entry `index` of the table at `table`.
///
/// # Safety
/// Same as [`read_entry`]; additionally the caller is responsible for TLB
/// maintenance after changing a live mapping.
#[inline]
pub unsafe fn write_entry<F: PageTableFormat>(table: *mut u8, index: usize, raw: u64) {
    debug_assert!(index < F::ENTRIES);
    unsafe {
        match F::ENTRY_SIZE {
            4 => (table as *mut u32).add(index).write_volatile(raw as u32),
            _ => (table as *mut u64).add(index).write_volatile(raw),
        }
    }
}
