//! Port-mapped I/O for x86 and x86_64.
//!
//! A [`Port<T>`] is a typed handle on one I/O port; `T` picks the access
//! width (`u8` → `in al`/`out al`, `u16` → `ax`, `u32` → `eax`). Only
//! meaningful where the capabilities report `has_port_io`.

use core::arch::asm;
use core::marker::PhantomData;

/// A value that fits one `in`/`out` access.
pub trait PortValue: Copy {
    /// # Safety
    /// The port must be safe to read at this width.
    unsafe fn read_from(port: u16) -> Self;

    /// # Safety
    /// The port must be safe to write at this width.
    unsafe fn write_to(port: u16, value: Self);
}

impl PortValue for u8 {
    #[inline]
    unsafe fn read_from(port: u16) -> u8 {
        let value: u8;
        unsafe { asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline]
    unsafe fn write_to(port: u16, value: u8) {
        unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
    }
}

impl PortValue for u16 {
    #[inline]
    unsafe fn read_from(port: u16) -> u16 {
        let value: u16;
        unsafe { asm!("in ax, dx", in("dx") port, out("ax") value, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline]
    unsafe fn write_to(port: u16, value: u16) {
        unsafe { asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags)) };
    }
}

impl PortValue for u32 {
    #[inline]
    unsafe fn read_from(port: u16) -> u32 {
        let value: u32;
        unsafe { asm!("in eax, dx", in("dx") port, out("eax") value, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline]
    unsafe fn write_to(port: u16, value: u32) {
        unsafe { asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags)) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port<T> {
    number: u16,
    _width: PhantomData<T>,
}

impl<T: PortValue> Port<T> {
    pub const fn new(number: u16) -> Self {
        Self { number, _width: PhantomData }
    }

    pub const fn number(&self) -> u16 {
        self.number
    }

    /// # Safety
    /// Reading a device register can have side effects (e.g. popping a FIFO).
    #[inline]
    pub unsafe fn read(&self) -> T {
        unsafe { T::read_from(self.number) }
    }

    /// # Safety
    /// Writing an arbitrary port can reprogram hardware.
    #[inline]
    pub unsafe fn write(&self, value: T) {
        unsafe { T::write_to(self.number, value) }
    }
}
