//! Per-slot transaction serializer
//!
//! A [`SlotEngine`] owns everything one slot needs to run transactions: the
//! FIFO lock that admits one caller at a time, the descriptor ring, the
//! event queue fed by the interrupt handler, and the SDIO interrupt flag.
//!
//! The controller-wide pieces (adapter, clock, configuration, the bus lock
//! and the active-slot marker used for interrupt routing) live in
//! [`Controller`] and are shared by all slots.
//!
//! Both locks are ticket locks. A caller queued behind another transaction
//! waits with the lock's [`RelaxStrategy`] `R`; the default [`Spin`] suits
//! bare-metal ports, RTOS ports supply a strategy that yields to the
//! scheduler so the transaction holding the lock can finish.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::RwLock;
use spin::mutex::TicketMutex;
use spin::relax::{RelaxStrategy, Spin};

use super::SdmmcError;
use super::command::{
    Command, CommandFlags, HwCommand, MMC_ALL_SEND_CID, MMC_SELECT_CARD, MMC_STOP_TRANSMISSION,
    decode_response,
};
use super::dma::{DMA_BUFFER_SIZE_MAX, DMA_MAX_CHUNK_LEN, DMA_RING_LEN, DescriptorRing};
use super::event::{Event, EventSource};
use super::host::HostAdapter;
use super::regs::IntStatus;
use super::transaction::{Actions, Transaction};
use crate::time::{Clock, Timeout};

/// Default per-event wait when the command does not specify one
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Upper bound applied to any per-event wait
pub const MAX_TIMEOUT_MS: u32 = 10_000;

/// Minimum buffer alignment of the internal DMA
pub const DMA_ALIGNMENT: usize = 4;

/// Opcodes whose response timeout is only final once command done arrives
pub const DEFAULT_BUSY_TOLERANT_OPCODES: [u8; 3] =
    [MMC_ALL_SEND_CID, MMC_SELECT_CARD, MMC_STOP_TRANSMISSION];

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Per-event wait when the command leaves `timeout_ms` unset
    pub default_timeout_ms: u32,
    /// Ceiling for any per-event wait
    pub max_timeout_ms: u32,
    /// Maximum bytes per DMA descriptor
    pub max_chunk_len: usize,
    /// Required data buffer alignment
    pub dma_alignment: usize,
    /// Opcodes for which a response timeout waits for command done
    pub busy_tolerant_opcodes: heapless::Vec<u8, 8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            max_chunk_len: DMA_MAX_CHUNK_LEN,
            dma_alignment: DMA_ALIGNMENT,
            busy_tolerant_opcodes: heapless::Vec::from_slice(&DEFAULT_BUSY_TOLERANT_OPCODES)
                .unwrap_or_default(),
        }
    }
}

impl EngineConfig {
    /// Reject values the hardware or the engine cannot work with
    pub fn validate(&self) -> Result<(), SdmmcError> {
        if self.max_chunk_len == 0
            || self.max_chunk_len % 4 != 0
            || self.max_chunk_len > DMA_BUFFER_SIZE_MAX
        {
            log::error!("SDMMC: invalid DMA chunk length {}", self.max_chunk_len);
            return Err(SdmmcError::InvalidArgument);
        }
        if !self.dma_alignment.is_power_of_two() {
            log::error!("SDMMC: invalid DMA alignment {}", self.dma_alignment);
            return Err(SdmmcError::InvalidArgument);
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            log::error!(
                "SDMMC: default timeout {} ms exceeds ceiling {} ms",
                self.default_timeout_ms,
                self.max_timeout_ms
            );
            return Err(SdmmcError::InvalidArgument);
        }
        Ok(())
    }

    /// Effective per-event wait for a command
    ///
    /// A requested timeout of zero selects the default.
    pub fn wait_timeout_ms(&self, requested: Option<u32>) -> u64 {
        let ms = match requested {
            Some(0) | None => self.default_timeout_ms,
            Some(ms) => ms,
        };
        u64::from(ms.min(self.max_timeout_ms))
    }

    pub fn is_busy_tolerant(&self, opcode: u8) -> bool {
        self.busy_tolerant_opcodes.contains(&opcode)
    }
}

/// Callbacks invoked from interrupt context
///
/// Each receives the slot number and returns whether a context switch
/// should be requested on interrupt exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventCallbacks {
    /// A transaction event was queued for the slot
    pub on_trans_done: Option<fn(usize) -> bool>,
    /// The slot's SDIO interrupt fired
    pub on_io_interrupt: Option<fn(usize) -> bool>,
}

/// Controller-wide state shared by all slots
pub struct Controller<H, C, R = Spin> {
    pub(crate) host: H,
    pub(crate) clock: C,
    pub(crate) config: EngineConfig,
    /// Held while a transaction drives the shared command/data path
    bus: TicketMutex<(), R>,
    /// Slot whose transaction events the interrupt handler routes
    active_slot: AtomicUsize,
}

impl<H: HostAdapter, C: Clock, R: RelaxStrategy> Controller<H, C, R> {
    pub(crate) fn new(host: H, clock: C, config: EngineConfig) -> Self {
        Self {
            host,
            clock,
            config,
            bus: TicketMutex::new(()),
            active_slot: AtomicUsize::new(0),
        }
    }

    pub(crate) fn active_slot(&self) -> usize {
        self.active_slot.load(Ordering::Acquire)
    }
}

/// Transaction serializer and event sink of one slot
pub struct SlotEngine<const N: usize = DMA_RING_LEN, R = Spin> {
    ring: TicketMutex<DescriptorRing<N>, R>,
    events: EventSource,
    io_pending: AtomicBool,
    callbacks: RwLock<EventCallbacks>,
}

impl<const N: usize, R: RelaxStrategy> SlotEngine<N, R> {
    pub fn new(max_chunk_len: usize) -> Self {
        Self {
            ring: TicketMutex::new(DescriptorRing::new(max_chunk_len)),
            events: EventSource::new(),
            io_pending: AtomicBool::new(false),
            callbacks: RwLock::new(EventCallbacks::default()),
        }
    }

    /// Event queue of this slot
    pub fn events(&self) -> &EventSource {
        &self.events
    }

    pub fn set_callbacks(&self, callbacks: EventCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    /// Run one command to completion
    ///
    /// Callers queue on the slot lock in arrival order, relaxing with `R`
    /// while they wait. The lock is not bounded: a transaction that never
    /// returns is a fatal condition the caller must see, not something to
    /// time out of.
    pub fn execute<H: HostAdapter, C: Clock>(
        &self,
        ctrl: &Controller<H, C, R>,
        slot: usize,
        cmd: &mut Command<'_>,
    ) -> Result<(), SdmmcError> {
        let mut ring = self.ring.lock();
        let _bus = ctrl.bus.lock();
        ctrl.active_slot.store(slot, Ordering::Release);

        self.drain_idle_events(slot);

        cmd.response = [0; 4];
        let result = self.run(ctrl, slot, &mut ring, cmd);
        cmd.error = result.err();

        if let Err(e) = result {
            log::debug!("SDMMC: slot {} CMD{} failed: {}", slot, cmd.opcode, e);
        }
        result
    }

    fn run<H: HostAdapter, C: Clock>(
        &self,
        ctrl: &Controller<H, C, R>,
        slot: usize,
        ring: &mut DescriptorRing<N>,
        cmd: &mut Command<'_>,
    ) -> Result<(), SdmmcError> {
        cmd.validate(ctrl.config.dma_alignment)?;
        if let Some(data) = cmd.data.as_deref() {
            if !ctrl.host.is_dma_capable(data.as_ptr() as usize, data.len()) {
                log::debug!("SDMMC: buffer {:p} not reachable by DMA", data.as_ptr());
                return Err(SdmmcError::InvalidArgument);
            }
        }

        let hw = HwCommand::encode(cmd);
        let has_data = cmd.has_data();
        if let Some(data) = cmd.data.as_deref_mut() {
            let (addr, len) = (data.as_mut_ptr() as usize, data.len());
            ring.prepare(addr, cmd.block_len, len);
            ctrl.host.dma_prepare(ring.head(), cmd.block_len, len);
        }

        log::trace!(
            "SDMMC: slot {} CMD{} arg={:#010x} {:?}",
            slot,
            cmd.opcode,
            cmd.arg,
            hw
        );

        if let Err(e) = ctrl.host.start_command(slot, hw, cmd.arg) {
            if has_data {
                ctrl.host.dma_stop();
                ring.finish();
            }
            return Err(e);
        }

        let mut txn = Transaction::begin(cmd, ctrl.config.is_busy_tolerant(cmd.opcode));
        let wait_ms = ctrl.config.wait_timeout_ms(cmd.timeout_ms);

        while !txn.is_idle() {
            let timeout = Timeout::from_ms(&ctrl.clock, wait_ms);
            let Some(event) = self.events.recv(&timeout) else {
                log::warn!(
                    "SDMMC: slot {} CMD{} no event for {} ms in {:?}",
                    slot,
                    cmd.opcode,
                    wait_ms,
                    txn.state()
                );
                if has_data {
                    ctrl.host.dma_stop();
                }
                txn.abort(SdmmcError::Timeout);
                break;
            };

            let actions = txn.step(event, ring);
            if actions.contains(Actions::CAPTURE_RESPONSE) {
                cmd.response = decode_response(cmd.flags, ctrl.host.read_response());
            }
            if actions.contains(Actions::RESUME_DMA) {
                ctrl.host.dma_resume();
            }
            if actions.contains(Actions::STOP_DMA) {
                ctrl.host.dma_stop();
            }
        }

        if has_data {
            ring.finish();
        }
        txn.result()?;

        if cmd.flags.contains(CommandFlags::WAIT_BUSY) {
            self.wait_busy_cleared(ctrl, slot, wait_ms)?;
        }
        Ok(())
    }

    /// Discard events left over from earlier transactions
    ///
    /// Card-detect events are expected noise; anything else is reported but
    /// does not affect the next transaction. Returns the number discarded.
    fn drain_idle_events(&self, slot: usize) -> usize {
        let dropped = self.events.take_dropped();
        if dropped > 0 {
            log::warn!(
                "SDMMC: slot {} event queue overflowed, {} events lost",
                slot,
                dropped
            );
        }

        let mut discarded = 0;
        while let Some(mut event) = self.events.try_recv() {
            discarded += 1;
            if event.host.take(IntStatus::CD) {
                log::debug!("SDMMC: slot {} card detect", slot);
            }
            if !event.is_empty() {
                log::warn!("SDMMC: slot {} unhandled idle event {:?}", slot, event);
            }
        }
        discarded
    }

    fn wait_busy_cleared<H: HostAdapter, C: Clock>(
        &self,
        ctrl: &Controller<H, C, R>,
        slot: usize,
        wait_ms: u64,
    ) -> Result<(), SdmmcError> {
        let timeout = Timeout::from_ms(&ctrl.clock, wait_ms);
        while ctrl.host.is_card_busy(slot) {
            if timeout.is_expired() {
                log::warn!("SDMMC: slot {} card still busy after {} ms", slot, wait_ms);
                return Err(SdmmcError::Timeout);
            }
            ctrl.clock.relax();
        }
        Ok(())
    }

    /// Unmask the slot's SDIO interrupt
    pub fn io_int_enable<H: HostAdapter, C: Clock>(
        &self,
        ctrl: &Controller<H, C, R>,
        slot: usize,
    ) {
        self.io_pending.store(false, Ordering::Release);
        ctrl.host.clear_sdio_interrupt(slot);
        ctrl.host.set_sdio_interrupt(slot, true);
    }

    /// Wait for the card to assert its SDIO interrupt
    pub fn io_int_wait<H: HostAdapter, C: Clock>(
        &self,
        ctrl: &Controller<H, C, R>,
        slot: usize,
        timeout_ms: u32,
    ) -> Result<(), SdmmcError> {
        ctrl.host.set_sdio_interrupt(slot, false);
        ctrl.host.clear_sdio_interrupt(slot);
        self.io_pending.store(false, Ordering::Release);

        if ctrl.host.is_d1_low(slot) {
            return Ok(());
        }

        ctrl.host.set_sdio_interrupt(slot, true);
        let timeout = Timeout::from_ms(&ctrl.clock, u64::from(timeout_ms));
        loop {
            if self.io_pending.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            if timeout.is_expired() {
                return Err(SdmmcError::Timeout);
            }
            ctrl.clock.relax();
        }
    }

    /// Interrupt context: deliver a transaction event
    pub(crate) fn on_event(&self, slot: usize, event: Event) -> bool {
        let mut need_yield = self.events.push(event);
        if let Some(cb) = self.callbacks.try_read().and_then(|c| c.on_trans_done) {
            need_yield |= cb(slot);
        }
        need_yield
    }

    /// Interrupt context: the slot's SDIO interrupt fired
    ///
    /// Always requests a yield since the flag releases the SDIO waiter.
    pub(crate) fn on_io_interrupt(&self, slot: usize) -> bool {
        self.io_pending.store(true, Ordering::Release);
        if let Some(cb) = self.callbacks.try_read().and_then(|c| c.on_io_interrupt) {
            cb(slot);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sdmmc::SdmmcHost;
    use crate::drivers::sdmmc::command::MMC_SEND_STATUS;
    use crate::drivers::sdmmc::testing::{Irq, MockHost, MockSdmmc, run_with_irqs};
    use crate::time::StdClock;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert!(config.is_busy_tolerant(MMC_SELECT_CARD));
        assert!(config.is_busy_tolerant(MMC_STOP_TRANSMISSION));
        assert!(config.is_busy_tolerant(MMC_ALL_SEND_CID));
        assert!(!config.is_busy_tolerant(25));
    }

    #[test]
    fn rejects_unusable_config() {
        let bad_chunk = EngineConfig {
            max_chunk_len: 8192,
            ..EngineConfig::default()
        };
        assert_eq!(bad_chunk.validate(), Err(SdmmcError::InvalidArgument));

        let odd_chunk = EngineConfig {
            max_chunk_len: 510,
            ..EngineConfig::default()
        };
        assert_eq!(odd_chunk.validate(), Err(SdmmcError::InvalidArgument));

        let bad_align = EngineConfig {
            dma_alignment: 6,
            ..EngineConfig::default()
        };
        assert_eq!(bad_align.validate(), Err(SdmmcError::InvalidArgument));

        let bad_timeout = EngineConfig {
            default_timeout_ms: 20_000,
            ..EngineConfig::default()
        };
        assert_eq!(bad_timeout.validate(), Err(SdmmcError::InvalidArgument));
    }

    #[test]
    fn wait_timeout_is_capped() {
        let config = EngineConfig::default();
        assert_eq!(config.wait_timeout_ms(None), 1000);
        assert_eq!(config.wait_timeout_ms(Some(0)), 1000);
        assert_eq!(config.wait_timeout_ms(Some(50)), 50);
        assert_eq!(config.wait_timeout_ms(Some(60_000)), 10_000);
    }

    #[test]
    fn command_without_data_leaves_ring_alone() {
        let mock = MockHost::new(4);
        let sdmmc: MockSdmmc<'_> =
            SdmmcHost::new(&mock, StdClock::new(), EngineConfig::default()).unwrap();
        let engine = sdmmc.slot(0).unwrap();
        assert_eq!(engine.ring.lock().prepare(0x1000, 512, 8192), 2);

        let mut cmd = Command::new(MMC_SEND_STATUS, 0, CommandFlags::RSP_R1);
        let result = run_with_irqs(&sdmmc, &mock, 0, &mut cmd, &[Irq::host(IntStatus::CMD_DONE)]);
        assert_eq!(result, Ok(()));

        let ring = engine.ring.lock();
        assert_eq!(ring.owned_count(), 2);
        assert_eq!(ring.pending(), 2);
    }

    #[test]
    fn allow_list_is_configurable() {
        let mut config = EngineConfig::default();
        config.busy_tolerant_opcodes.clear();
        assert!(!config.is_busy_tolerant(MMC_SELECT_CARD));
        assert!(config.busy_tolerant_opcodes.push(6).is_ok());
        assert!(config.is_busy_tolerant(6));
    }
}
