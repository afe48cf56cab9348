//! 16550 UART debug console (COM1), polled.
//!
//! This is the log sink on x86 bare metal. Output is serialized by a spin
//! mutex taken with interrupts masked, so an interrupt handler that logs
//! cannot deadlock against the code it interrupted.

use core::fmt;
use spin::Mutex;

use crate::cpu;
use crate::port::Port;

/// COM1 base port address
pub const COM1_PORT: u16 = 0x3F8;

/// Line status register: transmit holding register empty.
const LSR_THR_EMPTY: u8 = 0x20;

/// 16550 register block at `base..base + 6`. With DLAB set, `data` and
/// `int_enable` hold the baud divisor instead.
pub struct Serial {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
    initialized: bool,
}

impl Serial {
    pub const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
            initialized: false,
        }
    }

    /// Initialize the port (115200 baud, 8N1, FIFO on, interrupts off).
    ///
    /// Returns false if the loopback self-test fails; output is then still
    /// attempted, since emulators often fail loopback but transmit fine.
    pub fn init(&mut self) -> bool {
        // SAFETY: standard 16550 programming sequence on a PC COM port.
        let loopback_ok = unsafe {
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x80); // DLAB
            self.data.write(0x01); // divisor 1 = 115200
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x03); // 8N1
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x1E); // loopback
            self.data.write(0xAE);
            let ok = self.data.read() == 0xAE;
            self.modem_ctrl.write(0x0F);
            ok
        };
        self.initialized = true;
        loopback_ok
    }

    fn is_transmit_empty(&self) -> bool {
        // SAFETY: reading LSR has no side effects.
        unsafe { self.line_status.read() & LSR_THR_EMPTY != 0 }
    }

    pub fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        // SAFETY: THR is empty, the byte goes straight to the wire.
        unsafe { self.data.write(byte) };
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static COM1: Mutex<Serial> = Mutex::new(Serial::new(COM1_PORT));

/// Initialize COM1.
pub fn init() -> bool {
    cpu::without_interrupts(|| COM1.lock().init())
}

pub fn write_str(s: &str) {
    use fmt::Write;
    cpu::without_interrupts(|| {
        let _ = COM1.lock().write_str(s);
    });
}

/// Formatted output; matches the `klog` sink signature.
pub fn write_fmt(args: fmt::Arguments<'_>) {
    use fmt::Write;
    cpu::without_interrupts(|| {
        let _ = COM1.lock().write_fmt(args);
    });
}
