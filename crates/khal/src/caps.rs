//! Hardware capability descriptor.
//!
//! Kernel code that needs to branch on hardware features asks for a
//! `HalCapabilities` value instead of testing `cfg(target_arch)`.

use crate::error::{HalError, HalResult};

/// Upper bound on the number of distinct page sizes any format supports.
pub const MAX_PAGE_SIZES: usize = 4;

/// Single-flag identifiers for [`HalCapabilities::has`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Capability {
    HugePages = 0,
    NxBit = 1,
    PortIo = 2,
    CacheCoherentDma = 3,
    Iommu = 4,
    Smp = 5,
    Fpu = 6,
    Simd = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalCapabilities {
    pub has_huge_pages: bool,
    pub has_nx_bit: bool,
    pub has_port_io: bool,
    pub cache_coherent_dma: bool,
    pub has_iommu: bool,
    pub has_smp: bool,
    pub has_fpu: bool,
    pub has_simd: bool,

    pub page_table_levels: usize,
    pub page_sizes: [u64; MAX_PAGE_SIZES],
    pub page_size_count: usize,

    pub phys_addr_bits: u32,
    pub kernel_base: u64,
    pub user_space_end: u64,

    pub gpr_count: usize,
    pub gpr_size: usize,
    pub context_size: usize,
}

impl HalCapabilities {
    /// Fast path for a single feature flag.
    pub const fn has(&self, cap: Capability) -> bool {
        match cap {
            Capability::HugePages => self.has_huge_pages,
            Capability::NxBit => self.has_nx_bit,
            Capability::PortIo => self.has_port_io,
            Capability::CacheCoherentDma => self.cache_coherent_dma,
            Capability::Iommu => self.has_iommu,
            Capability::Smp => self.has_smp,
            Capability::Fpu => self.has_fpu,
            Capability::Simd => self.has_simd,
        }
    }

    /// `NotSupported` when the feature is absent.
    pub fn require(&self, cap: Capability) -> HalResult<()> {
        if self.has(cap) { Ok(()) } else { Err(HalError::NotSupported) }
    }

    pub fn page_sizes(&self) -> &[u64] {
        &self.page_sizes[..self.page_size_count]
    }

    pub fn supports_page_size(&self, size: u64) -> bool {
        self.page_sizes().contains(&size)
    }
}
