//! Stratum kernel core.
//!
//! Everything here is architecture-neutral: it is generic over
//! `khal::PageTableFormat` / `khal::ContextOps` / `khal::Platform`, so the
//! bare-metal binary instantiates it with `khal::arch::Native` while the
//! host test suite runs it for i686, x86_64 and AArch64 side by side.
#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod irq;
pub mod memory;
pub mod sync;
pub mod syscall;
pub mod task;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use config::KernelConfig;
