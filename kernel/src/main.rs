// =============================================================================
// Stratum — Kernel Entry Point
// =============================================================================
//
// The `stratum` binary is a thin shell around the `kernel` library:
//
//   - bare-metal x86_64 (`target_os = "none"`): Limine jumps to `kmain` in
//     `boot.rs`, which brings up logging, the PMM and the VMM, then installs
//     the page-fault vector from `trap.rs`.
//   - hosted builds: there is nothing to boot, so `main` just says so. The
//     library's unit tests are where the kernel runs on the host.
//
// i686 and AArch64 build the library (and its tests) but have no boot glue
// yet, so a bare-metal build for them stops here.
//
// =============================================================================

#![cfg_attr(target_os = "none", no_std, no_main)]
#![cfg_attr(all(target_os = "none", target_arch = "x86_64"), feature(abi_x86_interrupt))]

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod boot;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod trap;

#[cfg(all(target_os = "none", not(target_arch = "x86_64")))]
compile_error!("Stratum only has boot glue for x86_64 (Limine)");

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // Masked for good: the panicking context may hold any lock.
    let _ = khal::cpu::interrupts_disable();
    match info.location() {
        Some(loc) => klog::error!("KERNEL PANIC at {}:{}: {}", loc.file(), loc.line(), info.message()),
        None => klog::error!("KERNEL PANIC: {}", info.message()),
    }
    khal::cpu::halt_forever()
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!(
        "stratum {}: bare-metal kernel; build for x86_64-unknown-none and boot with Limine",
        env!("CARGO_PKG_VERSION")
    );
}
