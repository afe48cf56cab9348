//! CR3 and TLB access on bare-metal x86_64.

use ::x86_64::instructions::tlb;
use ::x86_64::registers::control::{Cr3, Cr3Flags};
use ::x86_64::structures::paging::PhysFrame;

use crate::addr::{PhysAddr, VirtAddr};
use crate::mmu::Mmu;

/// The running CPU's MMU.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    fn active_root(&self) -> PhysAddr {
        let (frame, _) = Cr3::read();
        PhysAddr::new(frame.start_address().as_u64())
    }

    unsafe fn set_active_root(&self, root: PhysAddr) {
        let frame = PhysFrame::containing_address(::x86_64::PhysAddr::new(root.as_u64()));
        // SAFETY: forwarded from the caller: `root` maps the running kernel.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    fn flush_page(&self, virt: VirtAddr) {
        tlb::flush(::x86_64::VirtAddr::new_truncate(virt.as_u64()));
    }

    fn flush_all(&self) {
        tlb::flush_all();
    }
}
