//! SD/MMC Host Register Definitions
//!
//! This module defines the registers of the DesignWare-derived SD/MMC host
//! controller (as integrated in ESP32-class chips) using tock-registers, and
//! the interrupt status bits the transaction engine consumes.

use bitflags::bitflags;
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

// ============================================================================
// Interrupt Status Bits
// ============================================================================

bitflags! {
    /// Host interrupt status (RINTSTS / MINTSTS / INTMASK layout)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntStatus: u32 {
        /// Card detect
        const CD = 1 << 0;
        /// Response error
        const RESP_ERR = 1 << 1;
        /// Command done
        const CMD_DONE = 1 << 2;
        /// Data transfer over
        const DATA_OVER = 1 << 3;
        /// Transmit FIFO data request
        const TXDR = 1 << 4;
        /// Receive FIFO data request
        const RXDR = 1 << 5;
        /// Response CRC error
        const RCRC = 1 << 6;
        /// Data CRC error
        const DCRC = 1 << 7;
        /// Response timeout
        const RTO = 1 << 8;
        /// Data read timeout
        const DTO = 1 << 9;
        /// Data starvation by host timeout
        const HTO = 1 << 10;
        /// FIFO underrun/overrun
        const FRUN = 1 << 11;
        /// Hardware locked write error
        const HLE = 1 << 12;
        /// Start bit error
        const SBE = 1 << 13;
        /// Auto command done
        const ACD = 1 << 14;
        /// End bit error (read) / write no CRC (write)
        const EBE = 1 << 15;
        /// SDIO interrupt from slot 0
        const IO_SLOT0 = 1 << 16;
        /// SDIO interrupt from slot 1
        const IO_SLOT1 = 1 << 17;

        /// Command phase errors
        const CMD_ERR = Self::RTO.bits() | Self::RCRC.bits() | Self::RESP_ERR.bits();
        /// Data phase errors
        const DATA_ERR = Self::DTO.bits()
            | Self::DCRC.bits()
            | Self::HTO.bits()
            | Self::SBE.bits()
            | Self::EBE.bits();
        /// Bits the engine unmasks and turns into events
        const EVENT_MASK = Self::CD.bits()
            | Self::RESP_ERR.bits()
            | Self::CMD_DONE.bits()
            | Self::DATA_OVER.bits()
            | Self::RCRC.bits()
            | Self::DCRC.bits()
            | Self::RTO.bits()
            | Self::DTO.bits()
            | Self::HTO.bits()
            | Self::HLE.bits()
            | Self::SBE.bits()
            | Self::EBE.bits();
        /// SDIO interrupts of all slots
        const IO_SLOTS = Self::IO_SLOT0.bits() | Self::IO_SLOT1.bits();
    }
}

impl IntStatus {
    /// SDIO interrupt bit for a slot
    pub fn io_slot(slot: usize) -> Self {
        match slot {
            0 => Self::IO_SLOT0,
            1 => Self::IO_SLOT1,
            _ => Self::empty(),
        }
    }

    /// Test for any of `mask` and clear those bits
    pub fn take(&mut self, mask: Self) -> bool {
        let hit = self.intersects(mask);
        self.remove(mask);
        hit
    }
}

bitflags! {
    /// Internal DMA controller status (IDSTS / IDINTEN layout)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaStatus: u32 {
        /// Transmit interrupt
        const TI = 1 << 0;
        /// Receive interrupt
        const RI = 1 << 1;
        /// Fatal bus error
        const FBE = 1 << 2;
        /// Descriptor unavailable
        const DU = 1 << 4;
        /// Card error summary
        const CES = 1 << 5;
        /// Normal interrupt summary
        const NI = 1 << 8;
        /// Abnormal interrupt summary
        const AI = 1 << 9;

        /// Descriptor completion in either direction
        const DONE = Self::TI.bits() | Self::RI.bits() | Self::NI.bits();
        /// Bits the engine turns into events
        const EVENT_MASK = Self::DONE.bits();
    }
}

impl DmaStatus {
    /// Test for any of `mask` and clear those bits
    pub fn take(&mut self, mask: Self) -> bool {
        let hit = self.intersects(mask);
        self.remove(mask);
        hit
    }
}

// ============================================================================
// Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Control (CTRL) Register
    pub CTRL [
        /// Controller reset
        CONTROLLER_RESET OFFSET(0) NUMBITS(1) [],
        /// FIFO reset
        FIFO_RESET OFFSET(1) NUMBITS(1) [],
        /// DMA interface reset
        DMA_RESET OFFSET(2) NUMBITS(1) [],
        /// Global interrupt enable
        INT_ENABLE OFFSET(4) NUMBITS(1) [],
        /// DMA handshake enable
        DMA_ENABLE OFFSET(5) NUMBITS(1) [],
        /// Use the internal DMA controller
        USE_INTERNAL_DMA OFFSET(25) NUMBITS(1) []
    ],

    /// Command (CMD) Register
    pub CMD [
        /// Command index
        INDEX OFFSET(0) NUMBITS(6) [],
        /// Response expected
        RESPONSE_EXPECT OFFSET(6) NUMBITS(1) [],
        /// 136-bit response
        RESPONSE_LONG OFFSET(7) NUMBITS(1) [],
        /// Check response CRC
        CHECK_RESPONSE_CRC OFFSET(8) NUMBITS(1) [],
        /// Data transfer expected
        DATA_EXPECTED OFFSET(9) NUMBITS(1) [],
        /// Direction: 0 = read, 1 = write
        RW OFFSET(10) NUMBITS(1) [
            Read = 0,
            Write = 1
        ],
        /// Stream transfer instead of block
        TRANSFER_MODE OFFSET(11) NUMBITS(1) [],
        /// Send STOP_TRANSMISSION after the data transfer
        SEND_AUTO_STOP OFFSET(12) NUMBITS(1) [],
        /// Wait for previous data transfer to complete
        WAIT_COMPLETE OFFSET(13) NUMBITS(1) [],
        /// Stop or abort command
        STOP_ABORT_CMD OFFSET(14) NUMBITS(1) [],
        /// Send initialization sequence before command
        SEND_INIT OFFSET(15) NUMBITS(1) [],
        /// Target card (slot) number
        CARD_NUM OFFSET(16) NUMBITS(5) [],
        /// Update clock registers only
        UPDATE_CLK_REGS_ONLY OFFSET(21) NUMBITS(1) [],
        /// Voltage switch command
        VOLT_SWITCH OFFSET(28) NUMBITS(1) [],
        /// Use hold register
        USE_HOLD_REG OFFSET(29) NUMBITS(1) [],
        /// Start command; cleared by hardware when the command is taken
        START_COMMAND OFFSET(31) NUMBITS(1) []
    ],

    /// Interrupt Mask (INTMASK) Register
    pub INTMASK [
        /// Host interrupt enables (IntStatus layout)
        INT_MASK OFFSET(0) NUMBITS(16) [],
        /// SDIO interrupt enables, one bit per slot
        SDIO_INT_MASK OFFSET(16) NUMBITS(2) []
    ],

    /// Status (STATUS) Register
    pub STATUS [
        /// FIFO is empty
        FIFO_EMPTY OFFSET(2) NUMBITS(1) [],
        /// FIFO is full
        FIFO_FULL OFFSET(3) NUMBITS(1) [],
        /// Raw DAT3 level (card present)
        DATA_3_STATUS OFFSET(8) NUMBITS(1) [],
        /// Card is busy (DAT0 held low)
        DATA_BUSY OFFSET(9) NUMBITS(1) [],
        /// Data transmit or receive state machine busy
        DATA_STATE_MC_BUSY OFFSET(10) NUMBITS(1) []
    ],

    /// Card Detect (CDETECT) Register
    pub CDETECT [
        /// Card detect, active low, one bit per slot
        CARD_DETECT_N OFFSET(0) NUMBITS(2) []
    ],

    /// Write Protect (WRTPRT) Register
    pub WRTPRT [
        /// Write protect, active high, one bit per slot
        WRITE_PROTECT OFFSET(0) NUMBITS(2) []
    ],

    /// Bus Mode (BMOD) Register
    pub BMOD [
        /// Internal DMA software reset
        SW_RESET OFFSET(0) NUMBITS(1) [],
        /// Fixed burst
        FB OFFSET(1) NUMBITS(1) [],
        /// Internal DMA enable
        DE OFFSET(7) NUMBITS(1) []
    ],

    /// Internal DMA Interrupt Enable (IDINTEN) Register
    pub IDINTEN [
        /// Transmit interrupt enable
        TI OFFSET(0) NUMBITS(1) [],
        /// Receive interrupt enable
        RI OFFSET(1) NUMBITS(1) [],
        /// Fatal bus error enable
        FBE OFFSET(2) NUMBITS(1) [],
        /// Descriptor unavailable enable
        DU OFFSET(4) NUMBITS(1) [],
        /// Card error summary enable
        CES OFFSET(5) NUMBITS(1) [],
        /// Normal interrupt summary enable
        NI OFFSET(8) NUMBITS(1) [],
        /// Abnormal interrupt summary enable
        AI OFFSET(9) NUMBITS(1) []
    ]
];

// ============================================================================
// Register Block
// ============================================================================

/// SD/MMC host controller registers
#[repr(C)]
pub struct DwMmcRegisters {
    /// Control (0x00)
    pub ctrl: ReadWrite<u32, CTRL::Register>,
    /// Power enable (0x04)
    pub pwren: ReadWrite<u32>,
    /// Clock divider (0x08)
    pub clkdiv: ReadWrite<u32>,
    /// Clock source (0x0C)
    pub clksrc: ReadWrite<u32>,
    /// Clock enable (0x10)
    pub clkena: ReadWrite<u32>,
    /// Timeout (0x14)
    pub tmout: ReadWrite<u32>,
    /// Card type / bus width (0x18)
    pub ctype: ReadWrite<u32>,
    /// Block size (0x1C)
    pub blksiz: ReadWrite<u32>,
    /// Byte count (0x20)
    pub bytcnt: ReadWrite<u32>,
    /// Interrupt mask (0x24)
    pub intmask: ReadWrite<u32, INTMASK::Register>,
    /// Command argument (0x28)
    pub cmdarg: ReadWrite<u32>,
    /// Command (0x2C)
    pub cmd: ReadWrite<u32, CMD::Register>,
    /// Response words 0-3 (0x30 - 0x3C)
    pub resp: [ReadOnly<u32>; 4],
    /// Masked interrupt status (0x40)
    pub mintsts: ReadOnly<u32>,
    /// Raw interrupt status, write 1 to clear (0x44)
    pub rintsts: ReadWrite<u32>,
    /// Status (0x48)
    pub status: ReadOnly<u32, STATUS::Register>,
    /// FIFO threshold (0x4C)
    pub fifoth: ReadWrite<u32>,
    /// Card detect (0x50)
    pub cdetect: ReadOnly<u32, CDETECT::Register>,
    /// Write protect (0x54)
    pub wrtprt: ReadOnly<u32, WRTPRT::Register>,
    /// Reserved (0x58)
    _reserved0: u32,
    /// Transferred CIU byte count (0x5C)
    pub tcbcnt: ReadOnly<u32>,
    /// Transferred host byte count (0x60)
    pub tbbcnt: ReadOnly<u32>,
    /// Debounce count (0x64)
    pub debnce: ReadWrite<u32>,
    /// User ID (0x68)
    pub usrid: ReadWrite<u32>,
    /// Version ID (0x6C)
    pub verid: ReadOnly<u32>,
    /// Hardware configuration (0x70)
    pub hcon: ReadOnly<u32>,
    /// UHS-1 register (0x74)
    pub uhs: ReadWrite<u32>,
    /// Card reset (0x78)
    pub rst_n: ReadWrite<u32>,
    /// Reserved (0x7C)
    _reserved1: u32,
    /// Bus mode (0x80)
    pub bmod: ReadWrite<u32, BMOD::Register>,
    /// Poll demand, any write resumes a suspended DMA (0x84)
    pub pldmnd: WriteOnly<u32>,
    /// Descriptor list base address (0x88)
    pub dbaddr: ReadWrite<u32>,
    /// Internal DMA status, write 1 to clear (0x8C)
    pub idsts: ReadWrite<u32>,
    /// Internal DMA interrupt enable (0x90)
    pub idinten: ReadWrite<u32, IDINTEN::Register>,
    /// Current host descriptor address (0x94)
    pub dscaddr: ReadOnly<u32>,
    /// Current buffer address (0x98)
    pub bufaddr: ReadOnly<u32>,
}
