// =============================================================================
// Stratum — Limine Boot Glue (x86_64)
// =============================================================================
//
// LIMINE PROTOCOL:
//   The kernel image carries static request structures in `.limine_requests`.
//   Limine finds them by their magic numbers, fills in a response pointer
//   for each, and jumps to `kmain`. Everything here only reads responses.
//
// WHAT WE ASK FOR:
//   - HHDM offset      → the `PhysWindow` through which PMM/VMM touch RAM
//   - memory map       → the PMM's region list
//   - executable addr  → physical extent of the kernel image (pinned)
//   - command line     → `KernelConfig` overrides
//
// BOOT ORDER:
//   serial → klog → config → PMM → VMM (adopts Limine's PML4 as master)
//   → optional kernel table preallocation → IDT → capability report → idle
//
// =============================================================================

use core::ops::Range;

use khal::arch::{Native, NativeMmu};
use khal::{HalCapabilities, Mmu, PageTableFormat, PhysAddr, PhysWindow, Platform, VirtAddr};
use limine::BaseRevision;
use limine::memory_map::EntryType;
use limine::request::{
    ExecutableAddressRequest, ExecutableCmdlineRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker,
    RequestsStartMarker,
};
use spin::Once;

use kernel::KernelConfig;
use kernel::memory::{FaultOutcome, MemoryRegion, RegionKind, Vmm, handle_page_fault, pmm};

#[used]
#[unsafe(link_section = ".limine_requests_start")]
static REQUESTS_START: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static CMDLINE_REQUEST: ExecutableCmdlineRequest = ExecutableCmdlineRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests_end")]
static REQUESTS_END: RequestsEndMarker = RequestsEndMarker::new();

unsafe extern "C" {
    static _kernel_start: u8;
    static _kernel_end: u8;
}

/// Regions beyond this many are ignored (logged).
const MAX_REGIONS: usize = 128;

static CONFIG: Once<KernelConfig> = Once::new();
static VMM: Once<Vmm<'static, Native, NativeMmu>> = Once::new();

fn region_kind(ty: EntryType) -> RegionKind {
    match ty {
        EntryType::USABLE => RegionKind::Usable,
        EntryType::ACPI_RECLAIMABLE | EntryType::BOOTLOADER_RECLAIMABLE => RegionKind::Reclaimable,
        EntryType::EXECUTABLE_AND_MODULES => RegionKind::KernelAndModules,
        EntryType::BAD_MEMORY => RegionKind::Bad,
        _ => RegionKind::Reserved,
    }
}

fn cmdline() -> &'static str {
    CMDLINE_REQUEST
        .get_response()
        .and_then(|r| r.cmdline().to_str().ok())
        .unwrap_or("")
}

/// Physical extent of the loaded kernel image.
fn kernel_image() -> Option<Range<PhysAddr>> {
    let response = EXECUTABLE_ADDRESS_REQUEST.get_response()?;
    // SAFETY: linker symbols; only their addresses are taken.
    let size = unsafe { (&raw const _kernel_end as u64) - (&raw const _kernel_start as u64) };
    let base = PhysAddr::new(response.physical_base());
    Some(base..base + size)
}

fn fatal(what: &str) -> ! {
    klog::error!("boot: {}", what);
    khal::cpu::halt_forever()
}

fn report(caps: &HalCapabilities) {
    klog::info!(
        "HAL[{}]: {}-level paging, {} bit phys, nx={}, huge={}, page sizes {:?}",
        Native::NAME,
        caps.page_table_levels,
        caps.phys_addr_bits,
        caps.has_nx_bit,
        caps.has_huge_pages,
        caps.page_sizes(),
    );
    klog::info!(
        "HAL[{}]: user space ends {:#x}, kernel base {:#x}, context {} bytes",
        Native::NAME,
        caps.user_space_end,
        caps.kernel_base,
        caps.context_size,
    );
}

/// Entry point Limine jumps to, interrupts disabled.
#[unsafe(no_mangle)]
extern "C" fn kmain() -> ! {
    khal::serial::init();
    klog::set_sink(khal::serial::write_fmt);
    klog::init_log_bridge();
    klog::info!("Stratum {} booting", env!("CARGO_PKG_VERSION"));

    if !BASE_REVISION.is_supported() {
        fatal("Limine base revision not supported");
    }

    let cfg = *CONFIG.call_once(|| KernelConfig::parse_cmdline(cmdline()));
    klog::set_level(cfg.log_level);
    klog::debug!("boot: {:?}", cfg);

    let Some(hhdm) = HHDM_REQUEST.get_response() else {
        fatal("no HHDM response");
    };
    let window = PhysWindow::new(hhdm.offset());

    let Some(map) = MEMORY_MAP_REQUEST.get_response() else {
        fatal("no memory map response");
    };
    let mut regions = [MemoryRegion::usable(0, 0); MAX_REGIONS];
    let entries = map.entries();
    if entries.len() > MAX_REGIONS {
        klog::warn!("boot: {} memory map entries, using the first {}", entries.len(), MAX_REGIONS);
    }
    let count = entries.len().min(MAX_REGIONS);
    for (slot, e) in regions.iter_mut().zip(entries) {
        *slot = MemoryRegion { base: e.base, length: e.length, kind: region_kind(e.entry_type) };
    }

    let Some(image) = kernel_image() else {
        fatal("no executable address response");
    };
    // SAFETY: Limine's HHDM maps all of RAM, and nothing else has claimed a
    // usable frame yet.
    if let Err(e) = unsafe { pmm::global().init(window, &regions[..count], image) } {
        fatal(e.as_str());
    }

    let mmu = NativeMmu;
    let master = mmu.active_root();
    // SAFETY: CR3 holds Limine's PML4, which maps the kernel and the HHDM,
    // and every frame the PMM hands out lies inside the HHDM.
    let vmm = VMM.call_once(|| unsafe { Vmm::new(pmm::global(), mmu, window, master) });
    klog::info!("VMM: adopted {:?} as master directory", master);

    if cfg.preallocate_kernel_tables {
        match vmm.preallocate_kernel_tables() {
            Ok(n) => klog::info!("VMM: preallocated {} kernel tables", n),
            Err(e) => klog::warn!("VMM: kernel table preallocation failed: {}", e.as_str()),
        }
    }

    crate::trap::init();
    report(&Native::capabilities());
    let stats = pmm::global().stats();
    klog::info!("boot complete: {} of {} frames free", stats.free_frames, stats.total_frames);

    khal::cpu::halt_forever()
}

/// Page-fault policy entry for `trap`: faulting address (CR2) and raw error
/// code in, decision out.
pub fn page_fault(addr: u64, raw_code: u64) -> FaultOutcome {
    match (VMM.get(), CONFIG.get()) {
        (Some(vmm), Some(cfg)) => handle_page_fault(vmm, VirtAddr::new(addr), raw_code, cfg),
        _ => FaultOutcome::Halt,
    }
}
