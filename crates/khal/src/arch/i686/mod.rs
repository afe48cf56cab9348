//! i686: 2-level 32-bit paging, cdecl register frame, legacy PIC wiring.
//!
//! No PAE, no PSE: 4 KiB pages only and no no-execute bit.

mod context;
#[cfg(all(target_os = "none", target_arch = "x86"))]
mod mmu;
mod paging;

pub use context::I686Context;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub use mmu::HardwareMmu;

use super::Platform;
use super::x86_common;
use crate::caps::{HalCapabilities, MAX_PAGE_SIZES};
use crate::context::ContextOps;
use crate::fault::FaultCode;
use crate::irq::{IrqType, PC_PIC_IRQS};
use crate::paging::PageTableFormat;

/// Marker type selecting the i686 implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct I686;

impl Platform for I686 {
    const IRQ_TABLE: [i32; IrqType::COUNT] = PC_PIC_IRQS;

    fn capabilities() -> HalCapabilities {
        let mut page_sizes = [0; MAX_PAGE_SIZES];
        page_sizes[0] = 4096;
        HalCapabilities {
            has_huge_pages: false,
            has_nx_bit: Self::SUPPORTS_NX,
            has_port_io: true,
            cache_coherent_dma: true,
            has_iommu: false,
            has_smp: false,
            has_fpu: true,
            has_simd: false,
            page_table_levels: Self::LEVELS,
            page_sizes,
            page_size_count: 1,
            phys_addr_bits: Self::PHYS_ADDR_BITS,
            kernel_base: Self::KERNEL_VIRTUAL_BASE,
            user_space_end: Self::USER_SPACE_END,
            gpr_count: 8,
            gpr_size: 4,
            context_size: <Self as ContextOps>::context_size(),
        }
    }

    fn decode_fault(raw: u64) -> FaultCode {
        x86_common::decode_error_code(raw)
    }
}
