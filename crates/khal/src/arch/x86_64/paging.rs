// =============================================================================
// Stratum — x86_64 Page Table Format
// =============================================================================
//
//   63  62..52  51..12       11..9   8   7   6   5   4   3   2   1   0
//   ┌───┬──────┬────────────┬───────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │NXE│ Avail│ Phys Addr  │ Avail │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └───┴──────┴────────────┴───────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//
//   Bit 9 (available) carries the COW marker.
//   PS in the PML4 is reserved; PS in a PDPT/PD entry maps a 1 GiB / 2 MiB
//   page, whose address must be aligned to that size (bit 12 is then PAT).
//
//   The upper canonical half (PML4 slots 256..512) is kernel space, shared by
//   every directory.
//
// =============================================================================

use super::X86_64;
use crate::addr::PhysAddr;
use crate::arch::x86_common::{self as bits, HUGE_PAGE, HUGE_PAT, PRESENT};
use crate::paging::{EntryError, PageFlags, PageTableFormat};

/// Physical address bits 51:12.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const NO_EXECUTE: u64 = 1 << 63;

/// Available bits 62:52; this kernel never sets them.
const HIGH_AVAILABLE: u64 = 0x7FF0_0000_0000_0000;

impl PageTableFormat for X86_64 {
    const NAME: &'static str = "x86_64";
    const LEVELS: usize = 4;
    const ENTRIES: usize = 512;
    const ENTRY_SIZE: usize = 8;

    const USER_SPACE_START: u64 = 0x0000_0000_0040_0000;
    const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
    const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_8000_0000_0000;
    const VIRT_MAX: u64 = u64::MAX;
    const PHYS_ADDR_BITS: u32 = 52;
    const SUPPORTS_NX: bool = true;
    const LEAF_KEPT_BITS: u64 = bits::LEAF_PAT | bits::SPARE;

    #[inline]
    fn table_entry(table: PhysAddr, user: bool) -> u64 {
        bits::table_entry(table.as_u64() & ADDR_MASK, user)
    }

    #[inline]
    fn leaf_entry(frame: PhysAddr, flags: PageFlags) -> u64 {
        let nx = if flags.contains(PageFlags::NO_EXECUTE) { NO_EXECUTE } else { 0 };
        (frame.as_u64() & ADDR_MASK) | bits::encode_low(flags) | nx
    }

    #[inline]
    fn is_present(raw: u64) -> bool {
        raw & PRESENT != 0
    }

    #[inline]
    fn is_block(raw: u64, level: usize) -> bool {
        level > 0 && Self::is_present(raw) && raw & HUGE_PAGE != 0
    }

    #[inline]
    fn entry_addr(raw: u64) -> PhysAddr {
        PhysAddr::new(raw & ADDR_MASK)
    }

    fn leaf_flags(raw: u64) -> PageFlags {
        let mut flags = bits::decode_low(raw);
        if !flags.is_empty() && raw & NO_EXECUTE != 0 {
            flags |= PageFlags::NO_EXECUTE;
        }
        flags
    }

    fn validate_entry(raw: u64, level: usize) -> Result<(), EntryError> {
        if !Self::is_present(raw) {
            return Ok(());
        }
        if raw & HIGH_AVAILABLE != 0 {
            return Err(EntryError::ReservedBits);
        }
        if raw & HUGE_PAGE != 0 && level > 0 {
            if level == Self::LEVELS - 1 {
                return Err(EntryError::ReservedBits);
            }
            let addr = raw & ADDR_MASK & !HUGE_PAT;
            if addr & (Self::level_span(level) - 1) != 0 {
                return Err(EntryError::Misaligned);
            }
        }
        Ok(())
    }
}
