// =============================================================================
// Stratum — i686 Page Table Format (non-PAE)
// =============================================================================
//
//   31        12 11  9  8   7   6   5   4   3   2   1   0
//   ┌───────────┬─────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │ Phys Addr │Avail│ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └───────────┴─────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//
//   Virtual address split: PDE index [31:22], PTE index [21:12].
//   Directory slots 768..1024 (0xC000_0000 and up) are kernel space.
//   Bit 9 carries the COW marker. Entries are 4 bytes wide.
//
// =============================================================================

use super::I686;
use crate::addr::PhysAddr;
use crate::arch::x86_common::{self as bits, HUGE_PAGE, PRESENT};
use crate::paging::{EntryError, PageFlags, PageTableFormat};

const ADDR_MASK: u64 = 0xFFFF_F000;

/// PSE-36 / reserved bits of a 4 MiB directory entry.
const HUGE_RESERVED: u64 = 0x003F_E000;

impl PageTableFormat for I686 {
    const NAME: &'static str = "i686";
    const LEVELS: usize = 2;
    const ENTRIES: usize = 1024;
    const ENTRY_SIZE: usize = 4;

    const USER_SPACE_START: u64 = 0x0040_0000;
    const USER_SPACE_END: u64 = 0xC000_0000;
    const KERNEL_VIRTUAL_BASE: u64 = 0xC000_0000;
    const VIRT_MAX: u64 = 0xFFFF_FFFF;
    const PHYS_ADDR_BITS: u32 = 32;
    const SUPPORTS_NX: bool = false;
    const LEAF_KEPT_BITS: u64 = bits::LEAF_PAT | bits::SPARE;

    #[inline]
    fn table_entry(table: PhysAddr, user: bool) -> u64 {
        bits::table_entry(table.as_u64() & ADDR_MASK, user)
    }

    #[inline]
    fn leaf_entry(frame: PhysAddr, flags: PageFlags) -> u64 {
        (frame.as_u64() & ADDR_MASK) | bits::encode_low(flags)
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
        bits::decode_low(raw)
    }

    fn validate_entry(raw: u64, level: usize) -> Result<(), EntryError> {
        if raw > u64::from(u32::MAX) {
            return Err(EntryError::AddressTooWide);
        }
        if !Self::is_present(raw) {
            return Ok(());
        }
        // Directory PS would be a 4 MiB page; this kernel never builds them.
        if level > 0 && raw & HUGE_PAGE != 0 && raw & HUGE_RESERVED != 0 {
            return Err(EntryError::Misaligned);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VirtAddr;

    #[test]
    fn ten_bit_indices() {
        let v = VirtAddr::new(0xC012_3456);
        assert_eq!(I686::index(v, 1), 0x300);
        assert_eq!(I686::index(v, 0), 0x123);
        assert_eq!(I686::kernel_root_range(), 768..1024);
        assert_eq!(I686::level_span(1), 4 << 20);
    }

    #[test]
    fn no_execute_is_not_encoded() {
        let raw = I686::leaf_entry(PhysAddr::new(0x7000), PageFlags::USER_DATA);
        assert_eq!(raw, 0x7000 | 0b111);
        assert!(!I686::leaf_flags(raw).contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn leaf_pat_survives_a_flag_change() {
        let raw = I686::leaf_entry(PhysAddr::new(0x3000), PageFlags::USER_DATA) | bits::LEAF_PAT;
        let ro = I686::with_leaf_flags(raw, PageFlags::USER | PageFlags::COW);
        assert_eq!(ro, 0x3000 | bits::LEAF_PAT | bits::COW | 0b101);
    }

    #[test]
    fn wide_entries_are_rejected() {
        assert_eq!(I686::validate_entry(1 << 32 | 1, 0), Err(EntryError::AddressTooWide));
        assert_eq!(I686::validate_entry(0x0040_0000 | 0x81, 1), Ok(()));
        assert_eq!(I686::validate_entry(0x0040_2000 | 0x81, 1), Err(EntryError::Misaligned));
    }

    #[test]
    fn kernel_region_bounds() {
        assert!(I686::is_kernel(VirtAddr::new(0xC000_0000)));
        assert!(!I686::is_kernel(VirtAddr::new(0x1_0000_0000)));
        assert!(I686::is_user(VirtAddr::new(0x0040_0000)));
        assert!(!I686::is_user(VirtAddr::new(0x0000_1000)));
    }
}
