//! Owned reference on a physical frame.
//!
//! A `Frame` stands for exactly one refcount unit. Dropping it gives the
//! unit back through `free_frame`, cloning takes another with `ref_inc`.
//! When a frame goes into a page-table entry the unit moves into the entry
//! (`into_raw`) and the VMM returns it when the mapping is torn down.

use core::fmt;
use core::mem::ManuallyDrop;

use khal::PhysAddr;

use super::pmm::FrameAllocator;

pub struct Frame<'a> {
	addr: PhysAddr,
	pmm: &'a FrameAllocator,
}

impl<'a> Frame<'a> {
	/// Adopts one reference the caller already holds.
	///
	/// # Safety
	///
	/// `addr` must be an allocated frame of `pmm` and the caller must own one
	/// of its references, which passes to the handle.
	pub unsafe fn from_raw(pmm: &'a FrameAllocator, addr: PhysAddr) -> Self {
		Self { addr, pmm }
	}

	#[inline]
	pub fn addr(&self) -> PhysAddr {
		self.addr
	}

	pub fn refcount(&self) -> u32 {
		self.pmm.refcount(self.addr)
	}

	/// Gives up the handle without dropping its reference.
	#[must_use = "the reference leaks unless it is stored somewhere"]
	pub fn into_raw(self) -> PhysAddr {
		ManuallyDrop::new(self).addr
	}
}

impl Clone for Frame<'_> {
	fn clone(&self) -> Self {
		self.pmm.ref_inc(self.addr);
		Self { addr: self.addr, pmm: self.pmm }
	}
}

impl Drop for Frame<'_> {
	fn drop(&mut self) {
		self.pmm.free_frame(self.addr);
	}
}

impl fmt::Debug for Frame<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Frame({:?})", self.addr)
	}
}

impl FrameAllocator {
	/// Allocates a zeroed frame wrapped in an owning handle.
	pub fn allocate(&self) -> Option<Frame<'_>> {
		let addr = self.alloc_frame()?;
		Some(Frame { addr, pmm: self })
	}
}
