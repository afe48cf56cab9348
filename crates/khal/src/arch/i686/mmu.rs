//! CR3 and TLB access on bare-metal i686.

use core::arch::asm;

use crate::addr::{PhysAddr, VirtAddr};
use crate::mmu::Mmu;

#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    fn active_root(&self) -> PhysAddr {
        let cr3: u32;
        // SAFETY: reading CR3 at CPL 0 has no side effects.
        unsafe { asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags)) };
        PhysAddr::new(u64::from(cr3 & 0xFFFF_F000))
    }

    unsafe fn set_active_root(&self, root: PhysAddr) {
        let cr3 = root.as_u64() as u32;
        // SAFETY: forwarded from the caller: `root` maps the running kernel.
        unsafe { asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags)) };
    }

    fn flush_page(&self, virt: VirtAddr) {
        let addr = virt.as_u64() as u32;
        // SAFETY: INVLPG only drops a TLB entry.
        unsafe { asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags)) };
    }

    fn flush_all(&self) {
        // Reloading CR3 drops every non-global entry.
        // SAFETY: writes back the value just read.
        unsafe {
            asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags),
            )
        };
    }
}
