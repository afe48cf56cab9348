//! Per-architecture implementations.
//!
//! Every architecture is a zero-sized marker type implementing
//! [`PageTableFormat`], [`ContextOps`] and [`Platform`]. All three are always
//! compiled so their formats and register frames can be tested on the host;
//! the assembly and privileged instructions are only assembled for the
//! matching bare-metal target. [`Native`] names the one the kernel runs on.

use crate::caps::HalCapabilities;
use crate::context::ContextOps;
use crate::fault::FaultCode;
use crate::irq::{self, IrqType};
use crate::paging::PageTableFormat;

pub mod aarch64;
pub mod i686;
pub mod x86_64;

mod x86_common;

pub use self::aarch64::Aarch64;
pub use self::i686::I686;
pub use self::x86_64::X86_64;

/// Everything the architecture-neutral kernel needs from one architecture.
pub trait Platform: PageTableFormat + ContextOps {
    /// Logical IRQ → physical line, `-1` when absent.
    const IRQ_TABLE: [i32; IrqType::COUNT];

    fn capabilities() -> HalCapabilities;

    /// Translates the raw fault syndrome (x86 error code, AArch64 ESR_EL1).
    fn decode_fault(raw: u64) -> FaultCode;

    #[inline]
    fn irq_number(irq: IrqType) -> i32 {
        irq::lookup(&Self::IRQ_TABLE, irq)
    }
}

#[cfg(target_arch = "x86")]
pub type Native = I686;

#[cfg(target_arch = "x86_64")]
pub type Native = X86_64;

#[cfg(target_arch = "aarch64")]
pub type Native = Aarch64;

#[cfg(all(target_os = "none", target_arch = "x86"))]
pub type NativeMmu = i686::HardwareMmu;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub type NativeMmu = self::x86_64::HardwareMmu;

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub type NativeMmu = aarch64::HardwareMmu;
