//! Architecture-neutral page-fault description.

use bitflags::bitflags;

bitflags! {
    /// What the hardware reported about a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// The translation existed; the access violated its permissions.
        const PRESENT     = 1 << 0;
        const WRITE       = 1 << 1;
        /// The access came from user mode.
        const USER        = 1 << 2;
        const INSTRUCTION = 1 << 4;
    }
}

impl FaultCode {
    /// A write to a present, read-only page: the only shape a COW fault has.
    #[inline]
    pub const fn is_protection_write(self) -> bool {
        self.contains(FaultCode::PRESENT.union(FaultCode::WRITE))
    }
}
