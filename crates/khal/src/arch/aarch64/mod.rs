//! AArch64: 4 KiB granule, 4-level translation, EL0/EL1 frames, GICv2 on
//! the QEMU `virt` board.
//!
//! One root table is loaded into both TTBR0_EL1 and TTBR1_EL1. With 48-bit
//! regions on both sides, L0 slots 0..256 resolve user addresses and slots
//! 256..512 resolve the `0xFFFF_8000_0000_0000` kernel half, which keeps the
//! "kernel root slots are shared" model identical to x86_64.

mod context;
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod mmu;
mod paging;

pub use context::Aarch64Context;
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub use mmu::HardwareMmu;

use super::Platform;
use crate::caps::{HalCapabilities, MAX_PAGE_SIZES};
use crate::context::ContextOps;
use crate::fault::FaultCode;
use crate::irq::{IrqType, QEMU_VIRT_GIC_IRQS};
use crate::paging::PageTableFormat;

/// Marker type selecting the AArch64 implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aarch64;

// ESR_EL1 exception classes.
const EC_IABT_LOWER: u64 = 0x20;
const EC_IABT_CURRENT: u64 = 0x21;
const EC_DABT_LOWER: u64 = 0x24;
const EC_DABT_CURRENT: u64 = 0x25;

/// ISS.WnR: the aborting access was a write.
const ISS_WNR: u64 = 1 << 6;

impl Platform for Aarch64 {
    const IRQ_TABLE: [i32; IrqType::COUNT] = QEMU_VIRT_GIC_IRQS;

    fn capabilities() -> HalCapabilities {
        let mut page_sizes = [0; MAX_PAGE_SIZES];
        page_sizes[..3].copy_from_slice(&[4096, 2 << 20, 1 << 30]);
        HalCapabilities {
            has_huge_pages: true,
            has_nx_bit: Self::SUPPORTS_NX,
            has_port_io: false,
            cache_coherent_dma: false,
            has_iommu: false,
            has_smp: false,
            has_fpu: true,
            has_simd: true,
            page_table_levels: Self::LEVELS,
            page_sizes,
            page_size_count: 3,
            phys_addr_bits: Self::PHYS_ADDR_BITS,
            kernel_base: Self::KERNEL_VIRTUAL_BASE,
            user_space_end: Self::USER_SPACE_END,
            gpr_count: 31,
            gpr_size: 8,
            context_size: <Self as ContextOps>::context_size(),
        }
    }

    /// Decodes ESR_EL1 of a data or instruction abort.
    fn decode_fault(raw: u64) -> FaultCode {
        let ec = (raw >> 26) & 0x3F;
        let fsc = raw & 0x3F;
        let mut code = FaultCode::empty();
        match ec {
            EC_IABT_LOWER => code |= FaultCode::USER | FaultCode::INSTRUCTION,
            EC_IABT_CURRENT => code |= FaultCode::INSTRUCTION,
            EC_DABT_LOWER => code |= FaultCode::USER,
            EC_DABT_CURRENT => {}
            _ => return code,
        }
        if matches!(ec, EC_DABT_LOWER | EC_DABT_CURRENT) && raw & ISS_WNR != 0 {
            code |= FaultCode::WRITE;
        }
        // Access-flag (0b0010xx) and permission (0b0011xx) faults mean the
        // translation exists; translation faults (0b0001xx) mean it does not.
        if matches!(fsc & 0x3C, 0x08 | 0x0C) {
            code |= FaultCode::PRESENT;
        }
        code
    }
}
