//! Bitmap-based Physical Memory Manager (PMM) with per-frame reference counts.
//!
//! Tracks 4 KiB frames with three parallel arrays indexed by PFN:
//!
//! * the **used** bitmap: bit 1 = allocated or reserved, bit 0 = free,
//! * the **protected** bitmap: frames `free_frame` must never release
//!   (kernel image, the PMM's own metadata, the reserved heap range, boot
//!   reservations),
//! * a `u32` **refcount** per frame: 1 after allocation, raised by every
//!   copy-on-write share, the frame is released when it falls to 0.
//!
//! Frames below the highest usable address that are not RAM at all
//! (reserved or bad regions, holes in the map) carry the `NOT_RAM` refcount.
//! They stay used and protected for good: no free, reference or unprotect
//! can turn device memory into allocatable RAM.
//!
//! The metadata is carved out of usable RAM directly after the kernel image
//! and reached through the physical window.
//!
//! SINGLE-CORE: every operation runs under the interrupt-masking `SpinLock`,
//! which is what totally orders allocations against the fault path.

use core::ops::Range;

use khal::{HalError, HalResult, PAGE_SIZE, PhysAddr, PhysWindow};

use crate::sync::SpinLock;

const FRAME_SIZE: u64 = PAGE_SIZE;

/// Refcount of a tracked frame that is not RAM.
const NOT_RAM: u32 = u32::MAX;

/// Boot memory map region as handed over by the boot protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
	pub base: u64,
	pub length: u64,
	pub kind: RegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
	Usable,
	Reserved,
	/// Bootloader or ACPI data that may be reclaimed later. Treated as used.
	Reclaimable,
	KernelAndModules,
	Bad,
}

impl MemoryRegion {
	pub const fn usable(base: u64, length: u64) -> Self {
		Self { base, length, kind: RegionKind::Usable }
	}

	pub const fn end(&self) -> u64 {
		self.base.saturating_add(self.length)
	}
}

// ── Zones ───────────────────────────────────────────────────────

/// Coarse allocation-policy partition of physical memory.
///
/// Not an isolation boundary: `alloc_frame_in` prefers the zone and falls
/// back to any free frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
	/// Below 16 MiB: reachable by ISA DMA.
	Dma = 0,
	/// Below 896 MiB: permanently mapped on 32-bit kernels.
	Normal = 1,
	High = 2,
}

impl Zone {
	pub const COUNT: usize = 3;

	const DMA_END: u64 = 16 << 20;
	const NORMAL_END: u64 = 896 << 20;

	pub const fn of(paddr: PhysAddr) -> Zone {
		let a = paddr.as_u64();
		if a < Self::DMA_END {
			Zone::Dma
		} else if a < Self::NORMAL_END {
			Zone::Normal
		} else {
			Zone::High
		}
	}

	/// PFNs covered by the zone.
	const fn pfns(self) -> Range<usize> {
		let (start, end) = match self {
			Zone::Dma => (0, Self::DMA_END),
			Zone::Normal => (Self::DMA_END, Self::NORMAL_END),
			Zone::High => (Self::NORMAL_END, u64::MAX),
		};
		(start / FRAME_SIZE) as usize..(end / FRAME_SIZE) as usize
	}
}

/// Snapshot returned by [`FrameAllocator::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmmStats {
	pub total_frames: usize,
	pub free_frames: usize,
	pub protected_frames: usize,
	pub refcount_underflows: usize,
	pub zone_free: [usize; Zone::COUNT],
	/// First frame of the PMM metadata.
	pub metadata_base: u64,
	pub metadata_frames: usize,
}

// ── Allocator state ─────────────────────────────────────────────

struct PmmState {
	window: PhysWindow,
	used: *mut u8,
	protected: *mut u8,
	refcounts: *mut u32,
	total_frames: usize,
	free_frames: usize,
	protected_frames: usize,
	/// Byte index in `used` where the last allocation was found.
	search_hint: usize,
	underflows: usize,
	zone_free: [usize; Zone::COUNT],
	metadata: Range<u64>,
	heap_reserved: Option<Range<u64>>,
}

// SAFETY: the raw pointers address PMM metadata that is only touched under
// the allocator lock.
unsafe impl Send for PmmState {}

impl PmmState {
	#[inline]
	fn bitmap_bytes(&self) -> usize {
		self.total_frames.div_ceil(8)
	}

	#[inline]
	fn is_used(&self, pfn: usize) -> bool {
		// SAFETY: callers pass `pfn < total_frames`.
		unsafe { *self.used.add(pfn / 8) & (1 << (pfn % 8)) != 0 }
	}

	#[inline]
	fn set_used(&mut self, pfn: usize, used: bool) {
		// SAFETY: as above.
		unsafe {
			let byte = self.used.add(pfn / 8);
			if used {
				*byte |= 1 << (pfn % 8);
			} else {
				*byte &= !(1 << (pfn % 8));
			}
		}
	}

	#[inline]
	fn is_protected(&self, pfn: usize) -> bool {
		// SAFETY: as above.
		unsafe { *self.protected.add(pfn / 8) & (1 << (pfn % 8)) != 0 }
	}

	fn set_protected(&mut self, pfn: usize, protect: bool) {
		if self.is_protected(pfn) == protect {
			return;
		}
		// SAFETY: as above.
		unsafe {
			let byte = self.protected.add(pfn / 8);
			if protect {
				*byte |= 1 << (pfn % 8);
				self.protected_frames += 1;
			} else {
				*byte &= !(1 << (pfn % 8));
				self.protected_frames -= 1;
			}
		}
	}

	#[inline]
	fn refcount(&self, pfn: usize) -> u32 {
		// SAFETY: as above.
		unsafe { *self.refcounts.add(pfn) }
	}

	#[inline]
	fn set_refcount(&mut self, pfn: usize, count: u32) {
		// SAFETY: as above.
		unsafe { *self.refcounts.add(pfn) = count }
	}

	#[inline]
	fn is_ram(&self, pfn: usize) -> bool {
		self.refcount(pfn) != NOT_RAM
	}

	/// Valid, aligned and tracked, or `None`.
	fn pfn_of(&self, paddr: PhysAddr) -> Option<usize> {
		if !paddr.is_valid() || !paddr.is_page_aligned() {
			return None;
		}
		let pfn = paddr.pfn();
		(pfn < self.total_frames).then_some(pfn)
	}

	/// Marks a free frame allocated with one reference and zero-fills it.
	fn claim(&mut self, pfn: usize) -> PhysAddr {
		self.set_used(pfn, true);
		self.set_refcount(pfn, 1);
		self.free_frames -= 1;
		let frame = PhysAddr::from_pfn(pfn);
		self.zone_free[Zone::of(frame) as usize] -= 1;
		// SAFETY: the frame was free, so nothing else references it, and
		// every tracked frame is reachable through the window.
		unsafe { self.window.zero_frame(frame) };
		frame
	}

	fn release(&mut self, pfn: usize) {
		self.set_used(pfn, false);
		self.set_refcount(pfn, 0);
		self.free_frames += 1;
		self.zone_free[Zone::of(PhysAddr::from_pfn(pfn)) as usize] += 1;
		self.search_hint = self.search_hint.min(pfn / 8);
	}

	/// Marks `[start, end)` used and protected. Frames outside the tracked
	/// range are ignored.
	fn reserve(&mut self, start: u64, end: u64) {
		let first = (start / FRAME_SIZE) as usize;
		let last = (end.div_ceil(FRAME_SIZE) as usize).min(self.total_frames);
		for pfn in first..last {
			if !self.is_used(pfn) {
				self.set_used(pfn, true);
				self.free_frames -= 1;
				self.zone_free[Zone::of(PhysAddr::from_pfn(pfn)) as usize] -= 1;
			}
			self.set_protected(pfn, true);
		}
	}

	/// First-fit scan from the hint, wrapping once.
	fn find_free(&self) -> Option<usize> {
		let bytes = self.bitmap_bytes();
		for offset in 0..bytes {
			let byte_idx = (self.search_hint + offset) % bytes;
			// SAFETY: `byte_idx < bitmap_bytes`.
			let byte = unsafe { *self.used.add(byte_idx) };
			if byte == 0xFF {
				continue;
			}
			let pfn = byte_idx * 8 + byte.trailing_ones() as usize;
			if pfn < self.total_frames {
				return Some(pfn);
			}
		}
		None
	}

	fn find_free_in(&self, pfns: Range<usize>) -> Option<usize> {
		let end = pfns.end.min(self.total_frames);
		(pfns.start..end).find(|&pfn| !self.is_used(pfn))
	}

	fn find_run(&self, count: usize) -> Option<usize> {
		let mut run_start = 0;
		let mut run_len = 0;
		for pfn in 0..self.total_frames {
			if self.is_used(pfn) {
				run_start = pfn + 1;
				run_len = 0;
				continue;
			}
			run_len += 1;
			if run_len == count {
				return Some(run_start);
			}
		}
		None
	}

	fn stats(&self) -> PmmStats {
		PmmStats {
			total_frames: self.total_frames,
			free_frames: self.free_frames,
			protected_frames: self.protected_frames,
			refcount_underflows: self.underflows,
			zone_free: self.zone_free,
			metadata_base: self.metadata.start,
			metadata_frames: ((self.metadata.end - self.metadata.start) / FRAME_SIZE) as usize,
		}
	}
}

// ── FrameAllocator ──────────────────────────────────────────────

/// The physical frame allocator. One global instance lives in [`global`];
/// tests build their own over simulated RAM.
pub struct FrameAllocator {
	state: SpinLock<Option<PmmState>>,
}

static PMM: FrameAllocator = FrameAllocator::new();

/// The kernel's frame allocator.
pub fn global() -> &'static FrameAllocator {
	&PMM
}

impl FrameAllocator {
	pub const fn new() -> Self {
		Self { state: SpinLock::new(None) }
	}

	pub fn is_initialized(&self) -> bool {
		self.state.lock().is_some()
	}

	/// Builds the allocator from the boot memory map.
	///
	/// `kernel_image` is the physical extent of the loaded kernel; its
	/// frames are reserved and the metadata is placed right after it.
	///
	/// # Safety
	///
	/// `window` must map every usable region of `regions` read/write, and no
	/// other code may use the usable frames until they are allocated here.
	pub unsafe fn init(
		&self,
		window: PhysWindow,
		regions: &[MemoryRegion],
		kernel_image: Range<PhysAddr>,
	) -> HalResult<PmmStats> {
		let mut guard = self.state.lock();
		if guard.is_some() {
			return Err(HalError::AlreadyExists);
		}

		// ── 1. Highest usable address decides how many frames we track ──
		let max_usable = regions
			.iter()
			.filter(|r| r.kind == RegionKind::Usable && r.length > 0)
			.map(|r| r.end() & !(FRAME_SIZE - 1))
			.max()
			.ok_or(HalError::InvalidParam)?;
		let total_frames = (max_usable / FRAME_SIZE) as usize;
		if total_frames == 0 {
			return Err(HalError::InvalidParam);
		}

		// Both bitmaps padded to 8 bytes so the refcounts stay aligned.
		let bitmap_bytes = total_frames.div_ceil(8).next_multiple_of(8);
		let meta_bytes = 2 * bitmap_bytes + total_frames * core::mem::size_of::<u32>();
		let meta_size = (meta_bytes as u64).next_multiple_of(FRAME_SIZE);

		// ── 2. Place the metadata ──
		let kernel = kernel_image.start.as_u64()..kernel_image.end.page_align_up().as_u64();
		let meta_base = place_metadata(regions, &kernel, meta_size).ok_or(HalError::NoMemory)?;

		klog::debug!(
			"PMM: tracking {} frames up to {:#x}, metadata {} bytes at {:#x}",
			total_frames,
			max_usable,
			meta_bytes,
			meta_base,
		);

		let base_ptr = window.ptr::<u8>(PhysAddr::new(meta_base));
		// SAFETY: the metadata range lies in usable RAM covered by `window`
		// (caller contract) and nothing else uses it yet.
		let mut st = unsafe {
			core::ptr::write_bytes(base_ptr, 0xFF, bitmap_bytes);
			core::ptr::write_bytes(base_ptr.add(bitmap_bytes), 0, meta_bytes - bitmap_bytes);
			PmmState {
				window,
				used: base_ptr,
				protected: base_ptr.add(bitmap_bytes),
				refcounts: base_ptr.add(2 * bitmap_bytes) as *mut u32,
				total_frames,
				free_frames: 0,
				protected_frames: 0,
				search_hint: 0,
				underflows: 0,
				zone_free: [0; Zone::COUNT],
				metadata: meta_base..meta_base + meta_size,
				heap_reserved: None,
			}
		};

		// ── 3. Free every whole frame inside a usable region ──
		for region in regions.iter().filter(|r| r.kind == RegionKind::Usable) {
			let first = region.base.div_ceil(FRAME_SIZE) as usize;
			let last = ((region.end() / FRAME_SIZE) as usize).min(total_frames);
			for pfn in first..last {
				if st.is_used(pfn) {
					st.set_used(pfn, false);
					st.free_frames += 1;
					st.zone_free[Zone::of(PhysAddr::from_pfn(pfn)) as usize] += 1;
				}
			}
		}

		// ── 4. Pin boot-owned RAM: reclaimable data, kernel and modules ──
		for region in regions
			.iter()
			.filter(|r| matches!(r.kind, RegionKind::Reclaimable | RegionKind::KernelAndModules))
		{
			let first = (region.base / FRAME_SIZE) as usize;
			let last = (region.end().div_ceil(FRAME_SIZE) as usize).min(total_frames);
			for pfn in first..last {
				if st.is_used(pfn) {
					st.set_protected(pfn, true);
				}
			}
		}

		// ── 5. Pin the kernel image and our own metadata ──
		st.reserve(kernel.start, kernel.end);
		st.reserve(st.metadata.start, st.metadata.end);

		// ── 6. Whatever is still used and unpinned is not RAM ──
		for pfn in 0..total_frames {
			if st.is_used(pfn) && !st.is_protected(pfn) {
				st.set_refcount(pfn, NOT_RAM);
				st.set_protected(pfn, true);
			}
		}

		let stats = st.stats();
		klog::info!(
			"PMM initialised: {} frames tracked, {} free ({} MiB), {} protected",
			stats.total_frames,
			stats.free_frames,
			(stats.free_frames as u64 * FRAME_SIZE) >> 20,
			stats.protected_frames,
		);
		*guard = Some(st);
		Ok(stats)
	}

	// ── Allocation / Free ───────────────────────────────────────

	/// Allocates one zero-filled frame with refcount 1.
	pub fn alloc_frame(&self) -> Option<PhysAddr> {
		let mut guard = self.state.lock();
		let st = guard.as_mut()?;
		let pfn = st.find_free()?;
		st.search_hint = pfn / 8;
		Some(st.claim(pfn))
	}

	/// Like [`alloc_frame`](Self::alloc_frame) but prefers `zone`.
	pub fn alloc_frame_in(&self, zone: Zone) -> Option<PhysAddr> {
		{
			let mut guard = self.state.lock();
			let st = guard.as_mut()?;
			if let Some(pfn) = st.find_free_in(zone.pfns()) {
				return Some(st.claim(pfn));
			}
		}
		self.alloc_frame()
	}

	/// Allocates `count` physically contiguous frames, each zero-filled with
	/// refcount 1. Returns the first frame.
	pub fn alloc_frames(&self, count: usize) -> Option<PhysAddr> {
		if count == 0 {
			return None;
		}
		if count == 1 {
			return self.alloc_frame();
		}
		let mut guard = self.state.lock();
		let st = guard.as_mut()?;
		let start = st.find_run(count)?;
		for pfn in start..start + count {
			st.claim(pfn);
		}
		st.search_hint = (start + count) / 8;
		Some(PhysAddr::from_pfn(start))
	}

	/// Drops one reference on `paddr` and releases the frame once nothing
	/// references it and it is not protected.
	///
	/// Invalid addresses and frames that are already free are logged and
	/// ignored: a buggy caller must not bring the kernel down.
	pub fn free_frame(&self, paddr: PhysAddr) {
		let mut guard = self.state.lock();
		let Some(st) = guard.as_mut() else {
			return;
		};
		let Some(pfn) = st.pfn_of(paddr) else {
			klog::warn!("PMM: free of untracked frame {:?}", paddr);
			return;
		};
		if !st.is_used(pfn) {
			klog::warn!("PMM: double free of frame {:?}", paddr);
			return;
		}
		if !st.is_ram(pfn) {
			klog::warn!("PMM: free of reserved frame {:?}", paddr);
			return;
		}
		let count = st.refcount(pfn).saturating_sub(1);
		st.set_refcount(pfn, count);
		if count == 0 && !st.is_protected(pfn) {
			st.release(pfn);
		}
	}

	/// Frees `count` frames starting at `first`.
	pub fn free_frames(&self, first: PhysAddr, count: usize) {
		for i in 0..count as u64 {
			self.free_frame(first + i * FRAME_SIZE);
		}
	}

	// ── Reference counts ────────────────────────────────────────

	/// Adds a reference to an allocated frame. Returns the new count, 0 when
	/// the frame is not allocated or not RAM.
	pub fn ref_inc(&self, paddr: PhysAddr) -> u32 {
		let mut guard = self.state.lock();
		let Some(st) = guard.as_mut() else {
			return 0;
		};
		match st.pfn_of(paddr) {
			Some(pfn) if st.is_used(pfn) && st.is_ram(pfn) => {
				let count = (st.refcount(pfn) + 1).min(NOT_RAM - 1);
				st.set_refcount(pfn, count);
				count
			}
			_ => 0,
		}
	}

	/// Drops a reference without releasing the frame; [`free_frame`] is the
	/// releasing path. Clamped at 0: an underflow is counted and logged.
	///
	/// [`free_frame`]: Self::free_frame
	pub fn ref_dec(&self, paddr: PhysAddr) -> u32 {
		let mut guard = self.state.lock();
		let Some(st) = guard.as_mut() else {
			return 0;
		};
		let Some(pfn) = st.pfn_of(paddr) else {
			return 0;
		};
		match st.refcount(pfn) {
			NOT_RAM => 0,
			0 => {
				st.underflows += 1;
				klog::warn!("PMM: refcount underflow on frame {:?}", paddr);
				0
			}
			n => {
				st.set_refcount(pfn, n - 1);
				n - 1
			}
		}
	}

	pub fn refcount(&self, paddr: PhysAddr) -> u32 {
		let guard = self.state.lock();
		let Some(st) = guard.as_ref() else {
			return 0;
		};
		st.pfn_of(paddr).filter(|&pfn| st.is_ram(pfn)).map_or(0, |pfn| st.refcount(pfn))
	}

	pub fn is_allocated(&self, paddr: PhysAddr) -> bool {
		let guard = self.state.lock();
		let Some(st) = guard.as_ref() else {
			return false;
		};
		st.pfn_of(paddr).is_some_and(|pfn| st.is_used(pfn))
	}

	// ── Protection ──────────────────────────────────────────────

	pub fn protect_frame(&self, paddr: PhysAddr) -> HalResult<()> {
		self.with_tracked(paddr, |st, pfn| st.set_protected(pfn, true))
	}

	/// Fails with `Permission` for frames that are not RAM.
	pub fn unprotect_frame(&self, paddr: PhysAddr) -> HalResult<()> {
		let mut guard = self.state.lock();
		let st = guard.as_mut().ok_or(HalError::NotInitialized)?;
		let pfn = st.pfn_of(paddr).ok_or(HalError::InvalidParam)?;
		if !st.is_ram(pfn) {
			return Err(HalError::Permission);
		}
		st.set_protected(pfn, false);
		Ok(())
	}

	pub fn is_protected(&self, paddr: PhysAddr) -> bool {
		let guard = self.state.lock();
		let Some(st) = guard.as_ref() else {
			return false;
		};
		st.pfn_of(paddr).is_some_and(|pfn| st.is_protected(pfn))
	}

	/// Pins `[start, end)` for the kernel heap so no other allocation can
	/// alias frames the heap maps elsewhere.
	pub fn set_heap_reserved_range(&self, start: PhysAddr, end: PhysAddr) -> HalResult<()> {
		if !start.is_page_aligned() || end <= start {
			return Err(HalError::InvalidParam);
		}
		let mut guard = self.state.lock();
		let st = guard.as_mut().ok_or(HalError::NotInitialized)?;
		let range = start.as_u64()..end.page_align_up().as_u64();
		st.reserve(range.start, range.end);
		st.heap_reserved = Some(range);
		Ok(())
	}

	pub fn heap_reserved_range(&self) -> Option<Range<PhysAddr>> {
		let guard = self.state.lock();
		let range = guard.as_ref()?.heap_reserved.clone()?;
		Some(PhysAddr::new(range.start)..PhysAddr::new(range.end))
	}

	// ── Queries ─────────────────────────────────────────────────

	pub fn stats(&self) -> PmmStats {
		self.state.lock().as_ref().map(PmmState::stats).unwrap_or_default()
	}

	pub fn free_frame_count(&self) -> usize {
		self.state.lock().as_ref().map_or(0, |st| st.free_frames)
	}

	pub fn window(&self) -> Option<PhysWindow> {
		self.state.lock().as_ref().map(|st| st.window)
	}

	fn with_tracked(&self, paddr: PhysAddr, f: impl FnOnce(&mut PmmState, usize)) -> HalResult<()> {
		let mut guard = self.state.lock();
		let st = guard.as_mut().ok_or(HalError::NotInitialized)?;
		let pfn = st.pfn_of(paddr).ok_or(HalError::InvalidParam)?;
		f(st, pfn);
		Ok(())
	}
}

impl Default for FrameAllocator {
	fn default() -> Self {
		Self::new()
	}
}

/// Picks a spot for `size` bytes of metadata: right after the kernel image
/// when that lies in usable RAM, else the first usable region that fits
/// without overlapping the image.
fn place_metadata(regions: &[MemoryRegion], kernel: &Range<u64>, size: u64) -> Option<u64> {
	let usable = || regions.iter().filter(|r| r.kind == RegionKind::Usable);
	let fits = |r: &MemoryRegion, base: u64| base >= r.base && base + size <= r.end();

	let after_kernel = kernel.end;
	if usable().any(|r| fits(r, after_kernel)) {
		return Some(after_kernel);
	}
	usable().find_map(|r| {
		let mut base = r.base.next_multiple_of(FRAME_SIZE);
		if base < kernel.end && base + size > kernel.start {
			base = kernel.end;
		}
		fits(r, base).then_some(base)
	})
}
