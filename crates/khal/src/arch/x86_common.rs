//! Entry bits shared by the i686 and x86_64 paging formats.
//!
//! Bits 0-8 have the same meaning in both: P, R/W, U/S, PWT, PCD, A, D, PS
//! (in directories) / PAT (in leaves), G. Bit 9 is available to software and
//! carries the COW marker. Leaf PAT and bits 10-11 are not modelled by
//! `PageFlags`; both formats keep them across a re-encode.

use crate::paging::PageFlags;

pub const PRESENT: u64 = 1 << 0;
pub const WRITABLE: u64 = 1 << 1;
pub const USER: u64 = 1 << 2;
pub const WRITE_THROUGH: u64 = 1 << 3;
pub const NO_CACHE: u64 = 1 << 4;
pub const ACCESSED: u64 = 1 << 5;
pub const DIRTY: u64 = 1 << 6;
pub const HUGE_PAGE: u64 = 1 << 7;
pub const GLOBAL: u64 = 1 << 8;
pub const COW: u64 = 1 << 9;

/// PAT selector of a huge-page entry; part of the flags, not the address.
pub const HUGE_PAT: u64 = 1 << 12;

/// PAT selector of a 4 KiB leaf (the bit that is PS one level up).
pub const LEAF_PAT: u64 = 1 << 7;
/// Bits 10-11, free for software next to the COW marker.
pub const SPARE: u64 = 0b11 << 10;

const TABLE: [(u64, PageFlags); 8] = [
    (WRITABLE, PageFlags::WRITABLE),
    (USER, PageFlags::USER),
    (WRITE_THROUGH, PageFlags::WRITE_THROUGH),
    (NO_CACHE, PageFlags::NO_CACHE),
    (ACCESSED, PageFlags::ACCESSED),
    (DIRTY, PageFlags::DIRTY),
    (GLOBAL, PageFlags::GLOBAL),
    (COW, PageFlags::COW),
];

pub fn encode_low(flags: PageFlags) -> u64 {
    TABLE
        .iter()
        .filter(|(_, f)| flags.contains(*f))
        .fold(PRESENT, |raw, (bit, _)| raw | bit)
}

pub fn decode_low(raw: u64) -> PageFlags {
    if raw & PRESENT == 0 {
        return PageFlags::empty();
    }
    TABLE
        .iter()
        .filter(|(bit, _)| raw & bit != 0)
        .fold(PageFlags::PRESENT, |flags, (_, f)| flags | *f)
}

pub fn table_entry(addr: u64, user: bool) -> u64 {
    addr | PRESENT | WRITABLE | if user { USER } else { 0 }
}

/// x86 page-fault error code: P, W/R, U/S in bits 0-2, I/D in bit 4.
pub fn decode_error_code(raw: u64) -> crate::fault::FaultCode {
    crate::fault::FaultCode::from_bits_truncate((raw & 0x17) as u32)
}
