//! Interrupt-time completion and error routing.

use log::{debug, warn};
use spin::Mutex;

use crate::err::{ErrorCode, MmcError};

use super::{
    Context, MmcCard, TransferBuffer,
    clock::Clock,
    cmd::data_errors,
    constant::MMC_BLOCK_SIZE,
    regs::{DmaEngine, HostController, IntFlags},
};

/// Notifications raised when an interrupt or DMA transfer retires.
pub trait Completion {
    fn write_complete(&mut self) {}
    fn read_complete(&mut self) {}
    fn error(&mut self, _code: ErrorCode) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompletion;

impl Completion for NoCompletion {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TransferComplete,
    WriteReady,
    ReadReady,
    DataError(ErrorCode),
    Spurious,
}

impl Event {
    /// Decide what a controller interrupt means for the transfer in flight.
    ///
    /// Completion wins over buffer readiness so a final FIFO edge raised together with
    /// transfer-complete cannot keep the transfer open.
    pub fn classify(status: IntFlags, enabled: IntFlags, context: Context) -> Self {
        if status.contains(IntFlags::TRANSFER_COMPLETE) && context.intersects(Context::ASYNC) {
            return Event::TransferComplete;
        }

        let armed = status & enabled;
        if armed.contains(IntFlags::BUFFER_WRITE_READY) {
            return Event::WriteReady;
        }
        if armed.contains(IntFlags::BUFFER_READ_READY) {
            return Event::ReadReady;
        }

        if status.intersects(IntFlags::DATA_ERRORS) {
            return Event::DataError(data_errors(status));
        }
        Event::Spurious
    }
}

impl<H, T, D, N> MmcCard<H, T, D, N>
where
    H: HostController,
    T: Clock,
    D: DmaEngine,
    N: Completion,
{
    /// Interrupt service entry: classify the controller status and act on it.
    pub fn on_interrupt(&mut self) -> Event {
        let status = self.host.int_status();
        let enabled = self.host.int_enabled();
        let event = Event::classify(status, enabled, self.context);
        self.on_event(event);
        event
    }

    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::TransferComplete => self.finish_transfer(),
            Event::WriteReady => self.feed_word(),
            Event::ReadReady => self.drain_word(),
            Event::DataError(code) => self.fail_transfer(code),
            Event::Spurious => debug!("Spurious interrupt in context {:?}", self.context),
        }
    }

    /// Stop the transfer in flight and bring the card back to Transfer state.
    ///
    /// `error_code` is left as is; with nothing in flight this does nothing.
    pub fn abort(&mut self) -> Result<(), MmcError> {
        if self.is_idle() {
            return Ok(());
        }

        let context = self.context;
        debug!("Abort {:?}", context);
        self.host.disable_interrupts(IntFlags::TRANSFER);
        self.host.clear_int_status(IntFlags::STATIC);
        self.release_dma(context);
        self.context = Context::empty();
        self.remaining = 0;

        if self.get_card_state()?.in_transfer() {
            self.stop_transmission()?;
        }
        Ok(())
    }

    fn finish_transfer(&mut self) {
        let context = self.context;
        self.host.disable_interrupts(IntFlags::TRANSFER);

        let stopped = if context.intersects(Context::MULTI) {
            self.stop_transmission()
        } else {
            Ok(())
        };

        self.host.clear_int_status(IntFlags::STATIC);
        self.release_dma(context);
        self.context = Context::empty();
        self.remaining = 0;

        match stopped {
            Err(err) => {
                warn!("Stop transmission after {:?} failed: {}", context, err);
                self.notify.error(self.error_code);
            }
            Ok(()) if context.intersects(Context::WRITE) => self.notify.write_complete(),
            Ok(()) => self.notify.read_complete(),
        }
    }

    fn feed_word(&mut self) {
        if let Some(TransferBuffer::Write { buf, pos }) = self.transfer.as_mut() {
            if self.remaining >= 4 {
                let word = u32::from_le_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
                self.host.write_data(word);
                *pos += 4;
                self.remaining -= 4;
                // Buffer-ready is write-1-to-clear; the next block raises it again
                if *pos % MMC_BLOCK_SIZE == 0 {
                    self.host.clear_int_status(IntFlags::BUFFER_WRITE_READY);
                }
            }
        }
        if self.remaining == 0 {
            self.host.disable_interrupts(IntFlags::BUFFER_WRITE_READY);
        }
    }

    fn drain_word(&mut self) {
        if let Some(TransferBuffer::Read { buf, pos }) = self.transfer.as_mut() {
            if self.remaining >= 4 {
                let word = self.host.read_data();
                buf[*pos..*pos + 4].copy_from_slice(&word.to_le_bytes());
                *pos += 4;
                self.remaining -= 4;
                if *pos % MMC_BLOCK_SIZE == 0 {
                    self.host.clear_int_status(IntFlags::BUFFER_READ_READY);
                }
            }
        }
        if self.remaining == 0 {
            self.host.disable_interrupts(IntFlags::BUFFER_READ_READY);
        }
    }

    fn fail_transfer(&mut self, code: ErrorCode) {
        let context = self.context;
        debug!("Data error {} in context {:?}", code, context);

        self.error_code |= code;
        self.host.clear_int_status(IntFlags::STATIC);
        self.host.disable_interrupts(IntFlags::TRANSFER);
        self.release_dma(context);
        self.remaining = 0;

        if !context.is_empty() {
            match self.get_card_state() {
                Ok(state) if state.in_transfer() => {
                    if let Err(err) = self.stop_transmission() {
                        warn!("Stop transmission during recovery failed: {}", err);
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("Card state unavailable during recovery: {}", err),
            }
        }

        self.context = Context::empty();
        self.notify.error(self.error_code);
    }
}

/// Interrupt controller plumbing needed to hook the card interrupt.
pub trait InterruptController {
    fn register(&mut self, irq: u32, handler: fn());
    fn set_priority(&mut self, irq: u32, priority: u8);
    fn clear_pending(&mut self, irq: u32);
    fn enable(&mut self, irq: u32);
}

/// One-time setup connecting `handler` to the controller line `irq`.
pub fn route_interrupt<I: InterruptController>(ic: &mut I, irq: u32, priority: u8, handler: fn()) {
    ic.set_priority(irq, priority);
    ic.clear_pending(irq);
    ic.register(irq, handler);
    ic.enable(irq);
}

/// Card handle shared between thread mode and its interrupt handler.
pub struct SharedCard<C> {
    inner: Mutex<Option<C>>,
}

impl<C> SharedCard<C> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Park `card` in the cell, returning whatever was there before.
    pub fn install(&self, card: C) -> Option<C> {
        self.inner.lock().replace(card)
    }

    pub fn take(&self) -> Option<C> {
        self.inner.lock().take()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        let mut guard = self.inner.lock();
        match &mut *guard {
            Some(card) => Some(f(card)),
            None => None,
        }
    }

    /// Like [`Self::with`] but never spins: `None` when the cell is empty or already held.
    ///
    /// This is the only safe entry from interrupt context, which may have preempted a
    /// thread-mode holder on the same core.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        let mut guard = self.inner.try_lock()?;
        match &mut *guard {
            Some(card) => Some(f(card)),
            None => None,
        }
    }
}

impl<C> Default for SharedCard<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, T, D, N> SharedCard<MmcCard<H, T, D, N>>
where
    H: HostController,
    T: Clock,
    D: DmaEngine,
    N: Completion,
{
    /// Body of the card ISR.
    ///
    /// Returns `None` without touching the card when thread mode holds the cell. The
    /// controller status stays latched, so the event is handled on the next entry.
    pub fn service(&self) -> Option<Event> {
        let event = self.try_with(|card| card.on_interrupt());
        if event.is_none() {
            debug!("Card cell busy, interrupt deferred");
        }
        event
    }
}
