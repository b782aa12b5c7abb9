//! SD/MMC Host Transaction Engine
//!
//! This module drives an SD/MMC host controller one command at a time.
//! A caller hands a [`Command`] to [`SdmmcHost::execute`]; the engine arms
//! the internal DMA over the command's buffer, starts the command and then
//! blocks on events produced by [`SdmmcHost::handle_interrupt`] until the
//! controller reports completion or an error.
//!
//! Each slot has its own serializer, descriptor ring and event queue.
//! Because the slots share one command/data path in the controller, the
//! controller is additionally held for the duration of each transaction,
//! which also tells the interrupt handler where to route events.

pub mod command;
pub mod dma;
pub mod dw_mmc;
pub mod engine;
pub mod event;
pub mod host;
pub mod regs;
pub mod transaction;

#[cfg(test)]
mod testing;

use core::fmt;
use spin::relax::{RelaxStrategy, Spin};

use crate::time::Clock;

pub use command::{Command, CommandFlags, HwCommand};
pub use dma::{DMA_RING_LEN, DescriptorRing, DmaDescriptor};
pub use engine::{EngineConfig, EventCallbacks, SlotEngine};
pub use event::{Event, EventSource};
pub use host::HostAdapter;

use engine::Controller;
use event::capture_interrupt;
use regs::IntStatus;

/// Default number of slots per controller
pub const SDMMC_SLOTS: usize = 2;

/// SD/MMC error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdmmcError {
    /// Response, data or engine wait timeout
    Timeout,
    /// Response or data CRC mismatch
    InvalidCrc,
    /// Controller flagged the response as malformed
    InvalidResponse,
    /// Data length or block length not usable
    InvalidSize,
    /// Bad buffer, slot or configuration
    InvalidArgument,
    /// Other data phase failure
    Fail,
    /// No card in the slot
    NotFound,
    /// Write to a write-protected card
    InvalidState,
}

impl fmt::Display for SdmmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Timeout => "timeout",
            Self::InvalidCrc => "CRC error",
            Self::InvalidResponse => "invalid response",
            Self::InvalidSize => "invalid size",
            Self::InvalidArgument => "invalid argument",
            Self::Fail => "generic failure",
            Self::NotFound => "no card present",
            Self::InvalidState => "card is write protected",
        };
        f.write_str(msg)
    }
}

/// SD/MMC host controller with `SLOTS` slots and `N` descriptors per slot
///
/// Callers waiting for a slot or for the controller relax with `R`. The
/// default spins; an RTOS port passes a strategy that yields.
pub struct SdmmcHost<
    H,
    C,
    const SLOTS: usize = SDMMC_SLOTS,
    const N: usize = DMA_RING_LEN,
    R = Spin,
> {
    ctrl: Controller<H, C, R>,
    slots: [SlotEngine<N, R>; SLOTS],
}

impl<H, C, const SLOTS: usize, const N: usize, R> SdmmcHost<H, C, SLOTS, N, R>
where
    H: HostAdapter,
    C: Clock,
    R: RelaxStrategy,
{
    /// Set up the engine and unmask the controller interrupts it consumes
    ///
    /// The platform must route the controller's interrupt to
    /// [`handle_interrupt`](Self::handle_interrupt).
    pub fn new(host: H, clock: C, config: EngineConfig) -> Result<Self, SdmmcError> {
        config.validate()?;

        let slots = core::array::from_fn(|_| SlotEngine::new(config.max_chunk_len));
        host.enable_interrupts(IntStatus::EVENT_MASK.bits());

        log::info!(
            "SDMMC: engine ready, {} slots, {} descriptors x {} bytes",
            SLOTS,
            N,
            config.max_chunk_len
        );

        Ok(Self {
            ctrl: Controller::new(host, clock, config),
            slots,
        })
    }

    /// Execute one command on `slot`, blocking until it finishes
    ///
    /// The outcome is also stored in `cmd.error`; on success `cmd.response`
    /// holds the decoded response.
    pub fn execute(&self, slot: usize, cmd: &mut Command<'_>) -> Result<(), SdmmcError> {
        match self.slots.get(slot) {
            Some(engine) => engine.execute(&self.ctrl, slot, cmd),
            None => {
                cmd.error = Some(SdmmcError::InvalidArgument);
                Err(SdmmcError::InvalidArgument)
            }
        }
    }

    /// Controller interrupt handler
    ///
    /// Returns true if a waiting task was signalled and the platform should
    /// request a context switch on interrupt exit.
    pub fn handle_interrupt(&self) -> bool {
        let capture = capture_interrupt(&self.ctrl.host);
        let mut need_yield = false;

        if let Some(event) = capture.event {
            let slot = self.ctrl.active_slot();
            if let Some(engine) = self.slots.get(slot) {
                need_yield |= engine.on_event(slot, event);
            }
        }

        for (slot, engine) in self.slots.iter().enumerate() {
            if capture.sdio.intersects(IntStatus::io_slot(slot)) {
                // Stays masked until the next io_int_wait re-arms it
                self.ctrl.host.set_sdio_interrupt(slot, false);
                need_yield |= engine.on_io_interrupt(slot);
            }
        }

        need_yield
    }

    /// Install interrupt-context callbacks for `slot`
    pub fn register_callbacks(
        &self,
        slot: usize,
        callbacks: EventCallbacks,
    ) -> Result<(), SdmmcError> {
        self.engine(slot)?.set_callbacks(callbacks);
        Ok(())
    }

    /// Enable the SDIO interrupt of `slot`
    pub fn io_int_enable(&self, slot: usize) -> Result<(), SdmmcError> {
        self.engine(slot)?.io_int_enable(&self.ctrl, slot);
        Ok(())
    }

    /// Block until the card in `slot` signals an SDIO interrupt
    pub fn io_int_wait(&self, slot: usize, timeout_ms: u32) -> Result<(), SdmmcError> {
        self.engine(slot)?.io_int_wait(&self.ctrl, slot, timeout_ms)
    }

    pub fn slot(&self, slot: usize) -> Option<&SlotEngine<N, R>> {
        self.slots.get(slot)
    }

    /// Register adapter
    pub fn adapter(&self) -> &H {
        &self.ctrl.host
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctrl.config
    }

    fn engine(&self, slot: usize) -> Result<&SlotEngine<N, R>, SdmmcError> {
        self.slots.get(slot).ok_or(SdmmcError::InvalidArgument)
    }
}
