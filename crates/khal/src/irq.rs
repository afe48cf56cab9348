//! Logical interrupt sources and their per-architecture line numbers.
//!
//! Drivers ask for "the timer" or "the primary disk", never for IRQ 14.
//! A line number of `-1` means the platform has no such source; callers
//! treat that as an absent feature, not as an error.

/// Logical interrupt sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum IrqType {
    Timer = 0,
    Keyboard = 1,
    Serial1 = 2,
    Serial2 = 3,
    Rtc = 4,
    Mouse = 5,
    DiskPrimary = 6,
    DiskSecondary = 7,
    Network = 8,
    Usb = 9,
}

impl IrqType {
    pub const COUNT: usize = 10;

    pub const ALL: [IrqType; Self::COUNT] = [
        IrqType::Timer,
        IrqType::Keyboard,
        IrqType::Serial1,
        IrqType::Serial2,
        IrqType::Rtc,
        IrqType::Mouse,
        IrqType::DiskPrimary,
        IrqType::DiskSecondary,
        IrqType::Network,
        IrqType::Usb,
    ];
}

/// Marker for "no physical line".
pub const IRQ_NONE: i32 = -1;

/// Legacy 8259 PIC wiring shared by i686 and x86_64 PCs.
pub const PC_PIC_IRQS: [i32; IrqType::COUNT] = [
    0,        // Timer (PIT)
    1,        // Keyboard
    4,        // COM1
    3,        // COM2
    8,        // CMOS RTC
    12,       // PS/2 mouse
    14,       // Primary ATA
    15,       // Secondary ATA
    11,       // Network (typical PCI routing)
    IRQ_NONE, // USB: behind PCI, no fixed line
];

/// GIC interrupt IDs on the QEMU `virt` board.
pub const QEMU_VIRT_GIC_IRQS: [i32; IrqType::COUNT] = [
    30,       // Timer (EL1 physical timer PPI)
    IRQ_NONE, // Keyboard
    33,       // PL011 UART
    IRQ_NONE, // Serial2
    34,       // PL031 RTC
    IRQ_NONE, // Mouse
    48,       // virtio-blk
    IRQ_NONE, // DiskSecondary
    49,       // virtio-net
    IRQ_NONE, // USB
];

/// Looks up the physical line for `irq` in a platform table.
#[inline]
pub const fn lookup(table: &[i32; IrqType::COUNT], irq: IrqType) -> i32 {
    table[irq as usize]
}

/// Interrupt controller operations the kernel routes through.
pub trait IrqController {
    fn enable(&self, line: u32);
    fn disable(&self, line: u32);
    fn end_of_interrupt(&self, line: u32);
}
