//! TTBR and TLB maintenance on bare-metal AArch64.

use core::arch::asm;

use crate::addr::{PhysAddr, VirtAddr};
use crate::mmu::Mmu;

#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    fn active_root(&self) -> PhysAddr {
        let ttbr: u64;
        // SAFETY: TTBR0_EL1 is readable at EL1.
        unsafe { asm!("mrs {}, ttbr0_el1", out(reg) ttbr, options(nomem, nostack, preserves_flags)) };
        PhysAddr::new(ttbr & 0x0000_FFFF_FFFF_F000)
    }

    unsafe fn set_active_root(&self, root: PhysAddr) {
        let ttbr = root.as_u64();
        // The same root serves both halves; see the module docs.
        // SAFETY: forwarded from the caller: `root` maps the running kernel.
        unsafe {
            asm!(
                "msr ttbr0_el1, {0}",
                "msr ttbr1_el1, {0}",
                "isb",
                "tlbi vmalle1",
                "dsb ish",
                "isb",
                in(reg) ttbr,
                options(nostack, preserves_flags),
            )
        };
    }

    fn flush_page(&self, virt: VirtAddr) {
        let operand = (virt.as_u64() >> 12) & 0x0000_0FFF_FFFF_FFFF;
        // SAFETY: TLB invalidation has no effect beyond the TLB.
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vae1, {}",
                "dsb ish",
                "isb",
                in(reg) operand,
                options(nostack, preserves_flags),
            )
        };
    }

    fn flush_all(&self) {
        // SAFETY: as above.
        unsafe {
            asm!("dsb ishst", "tlbi vmalle1", "dsb ish", "isb", options(nostack, preserves_flags))
        };
    }
}
