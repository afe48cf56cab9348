//! x86_64: 4-level paging, SysV register frame, legacy PIC wiring.

mod context;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod mmu;
mod paging;

pub use context::X86_64Context;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use mmu::HardwareMmu;

use super::Platform;
use super::x86_common;
use crate::caps::{HalCapabilities, MAX_PAGE_SIZES};
use crate::context::ContextOps;
use crate::fault::FaultCode;
use crate::irq::{IrqType, PC_PIC_IRQS};
use crate::paging::PageTableFormat;

/// Marker type selecting the x86_64 implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64;

impl Platform for X86_64 {
    const IRQ_TABLE: [i32; IrqType::COUNT] = PC_PIC_IRQS;

    fn capabilities() -> HalCapabilities {
        let mut page_sizes = [0; MAX_PAGE_SIZES];
        page_sizes[..3].copy_from_slice(&[4096, 2 << 20, 1 << 30]);
        HalCapabilities {
            has_huge_pages: true,
            has_nx_bit: Self::SUPPORTS_NX,
            has_port_io: true,
            cache_coherent_dma: true,
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
            gpr_count: 16,
            gpr_size: 8,
            context_size: <Self as ContextOps>::context_size(),
        }
    }

    fn decode_fault(raw: u64) -> FaultCode {
        x86_common::decode_error_code(raw)
    }
}
