// =============================================================================
// Stratum — AArch64 Translation Table Format (4 KiB granule, 48-bit)
// =============================================================================
//
//   63  59 58  55 54  53  52 51  48 47          12 11  10  9 8  7 6  5  4 2  1  0
//   ┌─────┬──────┬───┬───┬──┬─────┬──────────────┬──┬───┬───┬────┬──┬────┬──┬──┐
//   │ ign │ SW   │UXN│PXN│C │ res0│ Output addr  │nG│AF │SH │ AP │NS│Attr│T │V │
//   └─────┴──────┴───┴───┴──┴─────┴──────────────┴──┴───┴───┴────┴──┴────┴──┴──┘
//
//   V=1,T=1  table (L0-L2) or page (L3)
//   V=1,T=0  block (L1 = 1 GiB, L2 = 2 MiB); invalid at L0 and L3
//   AP[2] (bit 7) = read-only, AP[1] (bit 6) = EL0 accessible
//   AttrIndx selects a MAIR_EL1 slot: 0 normal WB, 1 device nGnRE, 2 normal WT
//   Software bit 56 carries the COW marker.
//
//   Kernel pages are always UXN; user pages are always PXN so the kernel
//   never executes user memory.
//
// =============================================================================

use super::Aarch64;
use crate::addr::PhysAddr;
use crate::paging::{EntryError, PageFlags, PageTableFormat};

const VALID: u64 = 1 << 0;
const TABLE_OR_PAGE: u64 = 1 << 1;
const ATTR_SHIFT: u64 = 2;
const ATTR_MASK: u64 = 0b111 << ATTR_SHIFT;
const ATTR_NORMAL: u64 = 0;
const ATTR_DEVICE: u64 = 1;
const ATTR_WRITE_THROUGH: u64 = 2;
const AP_EL0: u64 = 1 << 6;
const AP_RO: u64 = 1 << 7;
const SH_INNER: u64 = 0b11 << 8;
const AF: u64 = 1 << 10;
const NOT_GLOBAL: u64 = 1 << 11;
const PXN: u64 = 1 << 53;
const UXN: u64 = 1 << 54;
const SW_COW: u64 = 1 << 56;
const NON_SECURE: u64 = 1 << 5;
/// Software bits 55, 57 and 58; 56 is the COW marker.
const SW_SPARE: u64 = (1 << 55) | (0b11 << 57);

/// Output address bits 47:12.
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Bits 51:48: output address bits of 52-bit mode, res0 here.
const OA_HIGH: u64 = 0xF << 48;

impl PageTableFormat for Aarch64 {
    const NAME: &'static str = "aarch64";
    const LEVELS: usize = 4;
    const ENTRIES: usize = 512;
    const ENTRY_SIZE: usize = 8;

    const USER_SPACE_START: u64 = 0x0000_0000_0040_0000;
    const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
    const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_8000_0000_0000;
    const VIRT_MAX: u64 = u64::MAX;
    const PHYS_ADDR_BITS: u32 = 48;
    const SUPPORTS_NX: bool = true;
    const LEAF_KEPT_BITS: u64 = NON_SECURE | SW_SPARE;

    #[inline]
    fn table_entry(table: PhysAddr, _user: bool) -> u64 {
        (table.as_u64() & ADDR_MASK) | VALID | TABLE_OR_PAGE
    }

    fn leaf_entry(frame: PhysAddr, flags: PageFlags) -> u64 {
        let attr = if flags.contains(PageFlags::NO_CACHE) {
            ATTR_DEVICE
        } else if flags.contains(PageFlags::WRITE_THROUGH) {
            ATTR_WRITE_THROUGH
        } else {
            ATTR_NORMAL
        };
        let mut raw = (frame.as_u64() & ADDR_MASK)
            | VALID
            | TABLE_OR_PAGE
            | AF
            | SH_INNER
            | (attr << ATTR_SHIFT);
        if !flags.contains(PageFlags::WRITABLE) {
            raw |= AP_RO;
        }
        if flags.contains(PageFlags::USER) {
            raw |= AP_EL0 | PXN;
            if flags.contains(PageFlags::NO_EXECUTE) {
                raw |= UXN;
            }
        } else {
            raw |= UXN;
            if flags.contains(PageFlags::NO_EXECUTE) {
                raw |= PXN;
            }
        }
        if !flags.contains(PageFlags::GLOBAL) {
            raw |= NOT_GLOBAL;
        }
        if flags.contains(PageFlags::COW) {
            raw |= SW_COW;
        }
        raw
    }

    fn rebuild_leaf(raw: u64, frame: PhysAddr, flags: PageFlags) -> u64 {
        let kept = Self::LEAF_KEPT_BITS;
        let out = (raw & kept) | (Self::leaf_entry(frame, flags) & !kept);
        // MAIR slots past the three `PageFlags` can name stay as they were.
        if (raw & ATTR_MASK) >> ATTR_SHIFT > ATTR_WRITE_THROUGH {
            (out & !ATTR_MASK) | (raw & ATTR_MASK)
        } else {
            out
        }
    }

    #[inline]
    fn is_present(raw: u64) -> bool {
        raw & VALID != 0
    }

    #[inline]
    fn is_block(raw: u64, level: usize) -> bool {
        level > 0 && Self::is_present(raw) && raw & TABLE_OR_PAGE == 0
    }

    #[inline]
    fn entry_addr(raw: u64) -> PhysAddr {
        PhysAddr::new(raw & ADDR_MASK)
    }

    fn leaf_flags(raw: u64) -> PageFlags {
        if !Self::is_present(raw) {
            return PageFlags::empty();
        }
        let mut flags = PageFlags::PRESENT;
        if raw & AP_RO == 0 {
            flags |= PageFlags::WRITABLE;
        }
        let user = raw & AP_EL0 != 0;
        if user {
            flags |= PageFlags::USER;
        }
        if raw & (if user { UXN } else { PXN }) != 0 {
            flags |= PageFlags::NO_EXECUTE;
        }
        match (raw & ATTR_MASK) >> ATTR_SHIFT {
            ATTR_DEVICE => flags |= PageFlags::NO_CACHE,
            ATTR_WRITE_THROUGH => flags |= PageFlags::WRITE_THROUGH,
            _ => {}
        }
        if raw & AF != 0 {
            flags |= PageFlags::ACCESSED;
        }
        if raw & NOT_GLOBAL == 0 {
            flags |= PageFlags::GLOBAL;
        }
        if raw & SW_COW != 0 {
            flags |= PageFlags::COW;
        }
        flags
    }

    fn validate_entry(raw: u64, level: usize) -> Result<(), EntryError> {
        if !Self::is_present(raw) {
            return Ok(());
        }
        if raw & OA_HIGH != 0 {
            return Err(EntryError::AddressTooWide);
        }
        if raw & TABLE_OR_PAGE != 0 {
            return Ok(());
        }
        // Block descriptor: only legal at L1/L2 and aligned to its span.
        if level == 0 || level == Self::LEVELS - 1 {
            return Err(EntryError::ReservedBits);
        }
        if raw & ADDR_MASK & (Self::level_span(level) - 1) != 0 {
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
    fn cow_is_software_bit_56() {
        let raw = Aarch64::leaf_entry(PhysAddr::new(0x4000_0000), PageFlags::USER | PageFlags::COW);
        assert_ne!(raw & (1 << 56), 0);
        assert_ne!(raw & AP_RO, 0, "COW pages are read-only");
        let flags = Aarch64::leaf_flags(raw);
        assert!(flags.contains(PageFlags::USER | PageFlags::COW | PageFlags::PRESENT));
        assert!(!flags.contains(PageFlags::WRITABLE));
    }

    #[test]
    fn execute_never_bits_follow_privilege() {
        let user = Aarch64::leaf_entry(PhysAddr::new(0x1000), PageFlags::USER_DATA);
        assert_eq!(user & (PXN | UXN), PXN | UXN);
        let text = Aarch64::leaf_entry(PhysAddr::new(0x1000), PageFlags::USER_CODE);
        assert_eq!(text & (PXN | UXN), PXN);
        let kernel = Aarch64::leaf_entry(PhysAddr::new(0x1000), PageFlags::KERNEL_DATA);
        assert_eq!(kernel & (PXN | UXN), PXN | UXN);
        assert!(Aarch64::leaf_flags(kernel).contains(PageFlags::NO_EXECUTE));
        assert!(!Aarch64::leaf_flags(text).contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn reencode_keeps_unmodelled_attributes() {
        let base = Aarch64::leaf_entry(PhysAddr::new(0x8000), PageFlags::USER_DATA);
        let raw = (base & !ATTR_MASK) | (3 << ATTR_SHIFT) | (1 << 55) | NON_SECURE;
        let cow = Aarch64::with_leaf_flags(raw, PageFlags::USER | PageFlags::COW);
        assert_eq!((cow & ATTR_MASK) >> ATTR_SHIFT, 3);
        assert_eq!(cow & ((1 << 55) | NON_SECURE), (1 << 55) | NON_SECURE);
        assert_ne!(cow & AP_RO, 0);
        assert_ne!(cow & SW_COW, 0);

        // A modelled memory type still follows the new flags.
        let device = Aarch64::with_leaf_flags(base, PageFlags::USER | PageFlags::NO_CACHE);
        assert_eq!((device & ATTR_MASK) >> ATTR_SHIFT, ATTR_DEVICE);
    }

    #[test]
    fn block_descriptors_are_validated() {
        let block_2m = 0x0020_0000 | VALID;
        assert_eq!(Aarch64::validate_entry(block_2m, 1), Ok(()));
        assert_eq!(Aarch64::validate_entry(0x0020_1000 | VALID, 1), Err(EntryError::Misaligned));
        assert_eq!(Aarch64::validate_entry(block_2m, 0), Err(EntryError::ReservedBits));
        assert_eq!(Aarch64::validate_entry(block_2m, 3), Err(EntryError::ReservedBits));
        assert_eq!(
            Aarch64::validate_entry((1 << 48) | 0b11, 0),
            Err(EntryError::AddressTooWide)
        );
    }

    #[test]
    fn kernel_half_shares_root_slots_with_x86_64_layout() {
        assert_eq!(Aarch64::index(VirtAddr::new(0xFFFF_8000_0000_0000), 3), 256);
        assert_eq!(Aarch64::kernel_root_range(), 256..512);
    }
}
