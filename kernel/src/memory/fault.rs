//! Page-fault policy.
//!
//! The VMM reports *what* happened (`CowError`, a failed resync); this module
//! decides what the kernel does about it and is the only place that logs a
//! fault. The architecture trap stub decodes nothing itself: it hands the
//! faulting address and the raw syndrome here and acts on the outcome.

use khal::{FaultCode, Mmu, Platform, VirtAddr};

use super::vmm::{CowError, Vmm};
use crate::config::KernelConfig;

/// What the trap handler must do once `handle_page_fault` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Return to the faulting instruction.
    Resolved,
    /// Terminate the current task; the kernel keeps running.
    KillTask,
    /// Unrecoverable kernel state.
    Halt,
}

/// What to do when breaking COW sharing finds no free frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowOomPolicy {
    Halt,
    KillTask,
}

impl CowOomPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "halt" => Some(Self::Halt),
            "kill" => Some(Self::KillTask),
            _ => None,
        }
    }

    const fn outcome(self) -> FaultOutcome {
        match self {
            Self::Halt => FaultOutcome::Halt,
            Self::KillTask => FaultOutcome::KillTask,
        }
    }
}

/// Resolves or classifies one page fault on `P`.
///
/// Order: kernel addresses (stale root entry resync), then COW on write
/// protection faults, then plain classification by privilege level.
pub fn handle_page_fault<P: Platform, M: Mmu>(
    vmm: &Vmm<'_, P, M>,
    addr: VirtAddr,
    raw_code: u64,
    cfg: &KernelConfig,
) -> FaultOutcome {
    let code = P::decode_fault(raw_code);

    if P::is_kernel(addr) {
        if code.contains(FaultCode::USER) {
            klog::warn!("#PF: user access to kernel address {:?} ({:?}), killing task", addr, code);
            return FaultOutcome::KillTask;
        }
        if !code.contains(FaultCode::PRESENT) && vmm.handle_kernel_page_fault(addr) {
            klog::warn!(
                "#PF: resynced stale kernel root entry for {:?} in {:?}",
                addr,
                vmm.current_directory()
            );
            return FaultOutcome::Resolved;
        }
        klog::error!("#PF: kernel fault at {:?} ({:?})", addr, code);
        return FaultOutcome::Halt;
    }

    if code.is_protection_write() {
        match vmm.handle_cow_page_fault(addr, code) {
            Ok(()) => {
                klog::trace!("#PF: COW resolved at {:?}", addr);
                return FaultOutcome::Resolved;
            }
            Err(CowError::OutOfMemory) => {
                klog::error!("#PF: out of memory breaking COW at {:?} ({:?})", addr, cfg.cow_oom);
                return cfg.cow_oom.outcome();
            }
            Err(CowError::Corrupted) => {
                klog::error!("#PF: corrupted page table entry for {:?}", addr);
                return FaultOutcome::Halt;
            }
            Err(CowError::NotCow) => {}
        }
    }

    if code.contains(FaultCode::USER) {
        klog::warn!("#PF: task fault at {:?} ({:?}), killing task", addr, code);
        FaultOutcome::KillTask
    } else {
        klog::error!("#PF: kernel-mode fault at user address {:?} ({:?})", addr, code);
        FaultOutcome::Halt
    }
}
