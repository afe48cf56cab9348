//! Stratum hardware abstraction layer.
//!
//! Architecture-neutral kernel code programs against the traits and value
//! types here. Each supported architecture (i686, x86_64, AArch64) supplies a
//! marker type under [`arch`] implementing [`paging::PageTableFormat`],
//! [`context::ContextOps`] and [`arch::Platform`]; the kernel picks one at
//! build time through generics, so there is no runtime dispatch.
#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod caps;
pub mod context;
pub mod cpu;
pub mod error;
pub mod fault;
pub mod irq;
pub mod mmu;
pub mod paging;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod port;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod serial;

pub use addr::{PADDR_INVALID, PAGE_SHIFT, PAGE_SIZE, PhysAddr, PhysWindow, VirtAddr};
pub use arch::Platform;
pub use caps::{Capability, HalCapabilities};
pub use context::{ContextOps, SyscallArgs};
pub use error::{HAL_OK, HalError, HalResult};
pub use fault::FaultCode;
pub use irq::IrqType;
pub use mmu::Mmu;
pub use paging::{PageFlags, PageTableFormat};
