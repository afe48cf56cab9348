//! Exception vectors for bare-metal x86_64.
//!
//! Only the vectors the memory core reacts to are installed: page faults go
//! through the kernel's fault policy, double faults are logged and halt.
//! Limine's GDT stays loaded, so handlers run on the kernel code selector
//! it set up.

use spin::Once;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use kernel::memory::FaultOutcome;

use crate::boot;

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub fn init() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt
    });
    idt.load();
    klog::debug!("IDT loaded (#PF, #DF)");
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, code: PageFaultErrorCode) {
    let addr = Cr2::read_raw();
    match boot::page_fault(addr, code.bits()) {
        FaultOutcome::Resolved => {}
        // No scheduler runs tasks yet, so there is nothing to kill and
        // return to.
        FaultOutcome::KillTask | FaultOutcome::Halt => {
            klog::error!("unrecoverable page fault at {:#018x} ({:?})", addr, code);
            klog::error!("{:#?}", frame);
            khal::cpu::halt_forever()
        }
    }
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, code: u64) -> ! {
    klog::error!("DOUBLE FAULT (code {})", code);
    klog::error!("{:#?}", frame);
    khal::cpu::halt_forever()
}
