//! DesignWare SD/MMC host adapter
//!
//! Implements [`HostAdapter`] on top of the memory-mapped registers of the
//! DesignWare-derived SD/MMC controller. Pin routing, clock dividers and
//! bus width are configured by the platform before the engine is created.

use core::mem::size_of;
use core::sync::atomic::{Ordering, fence};
use tock_registers::LocalRegisterCopy;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use super::SdmmcError;
use super::command::HwCommand;
use super::dma::DmaDescriptor;
use super::host::HostAdapter;
use super::regs::*;

/// Polls of the start bit before giving up on a command
const START_CMD_POLL_LIMIT: u32 = 1_000_000;

/// End of the address range the internal DMA can reach
const DMA_ADDR_LIMIT: u64 = 1 << 32;

/// Register adapter for one controller instance
pub struct DwMmcHost {
    regs: &'static DwMmcRegisters,
}

// Safety: the controller registers are only accessed through volatile
// single-word reads and writes; transaction-level exclusion is provided by
// the engine's locks
unsafe impl Send for DwMmcHost {}
unsafe impl Sync for DwMmcHost {}

impl DwMmcHost {
    /// Create an adapter for the controller mapped at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the address of the controller's register block,
    /// mapped for the lifetime of the program, and not driven by anyone
    /// else.
    pub unsafe fn new(base: usize) -> Self {
        Self {
            regs: &*(base as *const DwMmcRegisters),
        }
    }

    pub fn registers(&self) -> &DwMmcRegisters {
        self.regs
    }

    /// Card detect is active low
    pub fn is_card_present(&self, slot: usize) -> bool {
        self.regs.cdetect.read(CDETECT::CARD_DETECT_N) & (1 << slot) == 0
    }

    pub fn is_write_protected(&self, slot: usize) -> bool {
        self.regs.wrtprt.read(WRTPRT::WRITE_PROTECT) & (1 << slot) != 0
    }

    fn dma_enable(&self) {
        self.regs
            .ctrl
            .modify(CTRL::DMA_ENABLE::SET + CTRL::USE_INTERNAL_DMA::SET);
        self.regs.bmod.modify(BMOD::SW_RESET::SET);
        self.regs.bmod.modify(BMOD::FB::SET + BMOD::DE::SET);
        self.regs
            .idinten
            .modify(IDINTEN::NI::SET + IDINTEN::RI::SET + IDINTEN::TI::SET);
    }
}

impl HostAdapter for DwMmcHost {
    fn start_command(&self, slot: usize, cmd: HwCommand, arg: u32) -> Result<(), SdmmcError> {
        let clock_update = cmd.register().is_set(CMD::UPDATE_CLK_REGS_ONLY);
        if !clock_update && !self.is_card_present(slot) {
            log::debug!("SDMMC: slot {} no card for CMD{}", slot, cmd.opcode());
            return Err(SdmmcError::NotFound);
        }
        if cmd.expects_data() && cmd.is_write() && self.is_write_protected(slot) {
            log::debug!("SDMMC: slot {} card is write protected", slot);
            return Err(SdmmcError::InvalidState);
        }

        let mut reg: LocalRegisterCopy<u32, CMD::Register> = cmd.for_slot(slot).register();
        reg.modify(CMD::START_COMMAND::SET);

        self.regs.cmdarg.set(arg);
        fence(Ordering::SeqCst);
        self.regs.cmd.set(reg.get());

        for _ in 0..START_CMD_POLL_LIMIT {
            if !self.regs.cmd.is_set(CMD::START_COMMAND) {
                return Ok(());
            }
            core::hint::spin_loop();
        }

        log::error!("SDMMC: controller did not accept CMD{}", cmd.opcode());
        Err(SdmmcError::Timeout)
    }

    fn dma_prepare(&self, ring_head: *const DmaDescriptor, block_len: usize, total_len: usize) {
        debug_assert!(
            self.is_dma_capable(ring_head as usize, size_of::<DmaDescriptor>()),
            "SDMMC: descriptor ring out of DMA reach"
        );
        self.regs.blksiz.set(block_len as u32);
        self.regs.bytcnt.set(total_len as u32);
        self.regs.dbaddr.set(ring_head as usize as u32);

        self.dma_enable();
        self.dma_resume();
    }

    fn dma_stop(&self) {
        self.regs.ctrl.modify(
            CTRL::USE_INTERNAL_DMA::CLEAR + CTRL::DMA_RESET::SET + CTRL::FIFO_RESET::SET,
        );
        self.regs.bmod.modify(BMOD::FB::CLEAR + BMOD::DE::CLEAR);
    }

    fn dma_resume(&self) {
        self.regs.pldmnd.set(1);
    }

    fn read_response(&self) -> [u32; 4] {
        [
            self.regs.resp[0].get(),
            self.regs.resp[1].get(),
            self.regs.resp[2].get(),
            self.regs.resp[3].get(),
        ]
    }

    fn read_interrupt_status(&self) -> (u32, u32) {
        (self.regs.mintsts.get(), self.regs.idsts.get())
    }

    fn clear_interrupt_status(&self, host: u32, dma: u32) {
        self.regs.rintsts.set(host);
        self.regs.idsts.set(dma);
    }

    fn enable_interrupts(&self, mask: u32) {
        self.regs.rintsts.set(u32::MAX);
        self.regs.intmask.modify(INTMASK::INT_MASK.val(mask & 0xFFFF));
        self.regs.ctrl.modify(CTRL::INT_ENABLE::SET);
    }

    fn set_sdio_interrupt(&self, slot: usize, enabled: bool) {
        let bit = IntStatus::io_slot(slot).bits() >> 16;
        let current = self.regs.intmask.read(INTMASK::SDIO_INT_MASK);
        let mask = if enabled { current | bit } else { current & !bit };
        self.regs.intmask.modify(INTMASK::SDIO_INT_MASK.val(mask));
    }

    fn clear_sdio_interrupt(&self, slot: usize) {
        self.regs.rintsts.set(IntStatus::io_slot(slot).bits());
    }

    fn is_card_busy(&self, _slot: usize) -> bool {
        self.regs.status.is_set(STATUS::DATA_BUSY)
    }

    fn is_dma_capable(&self, addr: usize, len: usize) -> bool {
        (addr as u64).saturating_add(len as u64) <= DMA_ADDR_LIMIT
    }
}
