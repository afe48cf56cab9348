//! Physical and virtual memory management.
//!
//! `pmm` owns every physical frame (bitmap, refcounts, protection, zones);
//! `vmm` builds page directories on top of it for whichever
//! `PageTableFormat` the kernel was built for; `fault` turns a raw page
//! fault into a decision.

pub mod fault;
pub mod frame;
pub mod pmm;
pub mod vmm;

pub use fault::{CowOomPolicy, FaultOutcome, handle_page_fault};
pub use frame::Frame;
pub use pmm::{FrameAllocator, MemoryRegion, PmmStats, RegionKind, Zone};
pub use vmm::{CowError, MapError, Mapping, Vmm};
