//! Logical IRQ routing.
//!
//! Drivers register against an [`IrqType`]; the router translates it to the
//! platform's physical line through `Platform::IRQ_TABLE` and programs the
//! interrupt controller. The trap stub calls [`IrqRouter::dispatch`] with the
//! physical line it received.

use core::marker::PhantomData;

use khal::irq::IrqController;
use khal::{HalError, HalResult, IrqType, Platform};

use crate::sync::SpinLock;

pub type IrqHandler = fn(IrqType);

pub struct IrqRouter<P: Platform, C: IrqController> {
    controller: C,
    handlers: SpinLock<[Option<IrqHandler>; IrqType::COUNT]>,
    _platform: PhantomData<fn() -> P>,
}

impl<P: Platform, C: IrqController> IrqRouter<P, C> {
    pub const fn new(controller: C) -> Self {
        Self {
            controller,
            handlers: SpinLock::new([None; IrqType::COUNT]),
            _platform: PhantomData,
        }
    }

    fn line(irq: IrqType) -> HalResult<u32> {
        u32::try_from(P::irq_number(irq)).map_err(|_| HalError::NotSupported)
    }

    /// Installs `handler` for `irq` and unmasks its line. Returns the line.
    pub fn register_logical(&self, irq: IrqType, handler: IrqHandler) -> HalResult<u32> {
        let line = Self::line(irq)?;
        let mut handlers = self.handlers.lock();
        let slot = &mut handlers[irq as usize];
        if slot.is_some() {
            return Err(HalError::AlreadyExists);
        }
        *slot = Some(handler);
        self.controller.enable(line);
        klog::debug!("irq: {:?} -> line {}", irq, line);
        Ok(line)
    }

    /// Masks the line and removes the handler.
    pub fn unregister_logical(&self, irq: IrqType) -> HalResult<()> {
        let line = Self::line(irq)?;
        let mut handlers = self.handlers.lock();
        if handlers[irq as usize].take().is_none() {
            return Err(HalError::NotFound);
        }
        self.controller.disable(line);
        Ok(())
    }

    pub fn enable_logical(&self, irq: IrqType) -> HalResult<()> {
        let line = self.registered_line(irq)?;
        self.controller.enable(line);
        Ok(())
    }

    pub fn disable_logical(&self, irq: IrqType) -> HalResult<()> {
        let line = self.registered_line(irq)?;
        self.controller.disable(line);
        Ok(())
    }

    fn registered_line(&self, irq: IrqType) -> HalResult<u32> {
        let line = Self::line(irq)?;
        if self.handlers.lock()[irq as usize].is_none() {
            return Err(HalError::NotFound);
        }
        Ok(line)
    }

    /// Runs the handler for physical `line` and signals end-of-interrupt.
    ///
    /// The EOI is sent even for unclaimed lines so a stray source cannot
    /// wedge the controller. Returns whether a handler ran.
    pub fn dispatch(&self, line: u32) -> bool {
        let claimed = IrqType::ALL
            .into_iter()
            .find(|&irq| Self::line(irq) == Ok(line))
            .and_then(|irq| self.handlers.lock()[irq as usize].map(|h| (irq, h)));
        // The handler runs without the table lock so it may re-register.
        if let Some((irq, handler)) = claimed {
            handler(irq);
        } else {
            klog::trace!("irq: spurious line {}", line);
        }
        self.controller.end_of_interrupt(line);
        claimed.is_some()
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }
}
