//! SD/MMC command descriptor
//!
//! A [`Command`] is owned by the caller and lent to the engine for exactly
//! one transaction. The engine reads the request half (opcode, argument,
//! flags, data buffer, timeout) and fills in `response` and `error`.

use bitflags::bitflags;
use core::fmt;
use tock_registers::LocalRegisterCopy;

use super::SdmmcError;
use super::regs::CMD;

// ============================================================================
// Command Opcodes
// ============================================================================

/// Reset the card to idle state
pub const MMC_GO_IDLE_STATE: u8 = 0;

/// Ask all cards for their CID
pub const MMC_ALL_SEND_CID: u8 = 2;

/// Ask the card to publish a relative address
pub const SD_SEND_RELATIVE_ADDR: u8 = 3;

/// Select/deselect a card by RCA
pub const MMC_SELECT_CARD: u8 = 7;

/// Send interface condition
pub const SD_SEND_IF_COND: u8 = 8;

/// Read the card-specific data register
pub const MMC_SEND_CSD: u8 = 9;

/// Stop a multi-block transfer
pub const MMC_STOP_TRANSMISSION: u8 = 12;

/// Read the card status register
pub const MMC_SEND_STATUS: u8 = 13;

/// Set the block length for standard capacity cards
pub const MMC_SET_BLOCKLEN: u8 = 16;

/// Read a single block
pub const MMC_READ_BLOCK_SINGLE: u8 = 17;

/// Read multiple blocks
pub const MMC_READ_BLOCK_MULTIPLE: u8 = 18;

/// Write a single block
pub const MMC_WRITE_BLOCK_SINGLE: u8 = 24;

/// Write multiple blocks
pub const MMC_WRITE_BLOCK_MULTIPLE: u8 = 25;

/// SDIO single register read/write
pub const SD_IO_RW_DIRECT: u8 = 52;

/// SDIO multi-byte/block read/write
pub const SD_IO_RW_EXTENDED: u8 = 53;

/// Next command is application specific
pub const MMC_APP_CMD: u8 = 55;

// ============================================================================
// Command Flags
// ============================================================================

bitflags! {
    /// Command flags: response type, command class, direction, busy wait
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u32 {
        /// Transaction finished (informational)
        const ITSDONE = 0x0001;

        /// Addressed data transfer command
        const CMD_ADTC = 0x0010;
        /// Broadcast command without response
        const CMD_BC = 0x0020;
        /// Broadcast command with response
        const CMD_BCR = 0x0030;

        /// Data direction is card to host
        const CMD_READ = 0x0040;

        /// Response carries a busy signal on DAT0
        const RSP_BSY = 0x0100;
        /// 136-bit response
        const RSP_136 = 0x0200;
        /// Response carries a CRC
        const RSP_CRC = 0x0400;
        /// Response echoes the command index
        const RSP_IDX = 0x0800;
        /// Response expected
        const RSP_PRESENT = 0x1000;

        const RSP_R1 = Self::RSP_PRESENT.bits() | Self::RSP_CRC.bits() | Self::RSP_IDX.bits();
        const RSP_R1B = Self::RSP_R1.bits() | Self::RSP_BSY.bits();
        const RSP_R2 = Self::RSP_PRESENT.bits() | Self::RSP_CRC.bits() | Self::RSP_136.bits();
        const RSP_R3 = Self::RSP_PRESENT.bits();
        const RSP_R4 = Self::RSP_PRESENT.bits();
        const RSP_R5 = Self::RSP_R1.bits();
        const RSP_R5B = Self::RSP_R1B.bits();
        const RSP_R6 = Self::RSP_R1.bits();
        const RSP_R7 = Self::RSP_R1.bits();

        /// Poll DAT0 busy after the command completes
        const WAIT_BUSY = 0x2000;
    }
}

/// Command class encoded in the flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Addressed, no data
    Ac,
    /// Addressed, with data
    Adtc,
    /// Broadcast
    Bc,
    /// Broadcast with response
    Bcr,
}

impl CommandFlags {
    /// Command class field
    pub fn class(self) -> CommandClass {
        match self.bits() & Self::CMD_BCR.bits() {
            0x10 => CommandClass::Adtc,
            0x20 => CommandClass::Bc,
            0x30 => CommandClass::Bcr,
            _ => CommandClass::Ac,
        }
    }
}

// ============================================================================
// Command Descriptor
// ============================================================================

/// One SD/MMC command, optionally with a data phase
pub struct Command<'a> {
    /// Command index
    pub opcode: u8,
    /// Command argument
    pub arg: u32,
    /// Response type, class, direction and busy-wait flags
    pub flags: CommandFlags,
    /// Data buffer; its length is the transfer length
    pub data: Option<&'a mut [u8]>,
    /// Block length in bytes
    pub block_len: usize,
    /// Per-event wait bound; `None` uses the engine default
    pub timeout_ms: Option<u32>,
    /// Response words, filled on completion
    pub response: [u32; 4],
    /// Result of the last execution
    pub error: Option<SdmmcError>,
}

impl<'a> Command<'a> {
    /// Create a command without data
    pub fn new(opcode: u8, arg: u32, flags: CommandFlags) -> Self {
        Self {
            opcode,
            arg,
            flags,
            data: None,
            block_len: 0,
            timeout_ms: None,
            response: [0; 4],
            error: None,
        }
    }

    /// Attach a data buffer transferred in `block_len` sized blocks
    pub fn with_data(mut self, data: &'a mut [u8], block_len: usize) -> Self {
        self.data = Some(data);
        self.block_len = block_len;
        self
    }

    /// Override the engine's default event timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Transfer length in bytes (zero without data)
    pub fn data_len(&self) -> usize {
        self.data.as_deref().map_or(0, <[u8]>::len)
    }

    /// Whether the command has a data phase
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Whether data flows from card to host
    pub fn is_read(&self) -> bool {
        self.flags.contains(CommandFlags::CMD_READ)
    }

    /// Number of blocks in the transfer
    pub fn block_count(&self) -> usize {
        if self.block_len == 0 {
            0
        } else {
            self.data_len() / self.block_len
        }
    }

    /// Check the data buffer against DMA requirements
    ///
    /// Length violations are `InvalidSize`; a buffer that is not aligned to
    /// `dma_alignment` is `InvalidArgument`. Commands without data always
    /// pass.
    pub fn validate(&self, dma_alignment: usize) -> Result<(), SdmmcError> {
        let Some(data) = self.data.as_deref() else {
            return Ok(());
        };

        if self.block_len == 0 || self.block_len % 4 != 0 {
            return Err(SdmmcError::InvalidSize);
        }
        if data.is_empty() || data.len() % self.block_len != 0 {
            return Err(SdmmcError::InvalidSize);
        }
        if dma_alignment > 1 && (data.as_ptr() as usize) % dma_alignment != 0 {
            return Err(SdmmcError::InvalidArgument);
        }
        Ok(())
    }
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("opcode", &self.opcode)
            .field("arg", &format_args!("{:#010x}", self.arg))
            .field("flags", &self.flags)
            .field("data_len", &self.data_len())
            .field("block_len", &self.block_len)
            .field("timeout_ms", &self.timeout_ms)
            .field("error", &self.error)
            .finish()
    }
}

// ============================================================================
// Hardware Command Word
// ============================================================================

/// Encoded CMD register value, minus the slot number and start bit
#[derive(Clone, Copy)]
pub struct HwCommand(LocalRegisterCopy<u32, CMD::Register>);

impl HwCommand {
    /// Encode a command for the controller
    pub fn encode(cmd: &Command<'_>) -> Self {
        let mut reg = LocalRegisterCopy::<u32, CMD::Register>::new(0);
        reg.modify(CMD::INDEX.val(u32::from(cmd.opcode)) + CMD::USE_HOLD_REG::SET);

        match cmd.opcode {
            MMC_STOP_TRANSMISSION => reg.modify(CMD::STOP_ABORT_CMD::SET),
            MMC_GO_IDLE_STATE => reg.modify(CMD::SEND_INIT::SET),
            _ => reg.modify(CMD::WAIT_COMPLETE::SET),
        }

        if cmd.flags.contains(CommandFlags::RSP_PRESENT) {
            reg.modify(CMD::RESPONSE_EXPECT::SET);
            if cmd.flags.contains(CommandFlags::RSP_136) {
                reg.modify(CMD::RESPONSE_LONG::SET);
            }
        }
        if cmd.flags.contains(CommandFlags::RSP_CRC) {
            reg.modify(CMD::CHECK_RESPONSE_CRC::SET);
        }

        if cmd.has_data() {
            reg.modify(CMD::DATA_EXPECTED::SET);
            if !cmd.is_read() {
                reg.modify(CMD::RW::Write);
            }
            if cmd.block_count() > 1 {
                reg.modify(CMD::SEND_AUTO_STOP::SET);
            }
        }

        Self(reg)
    }

    /// Copy with the target slot filled in
    pub fn for_slot(mut self, slot: usize) -> Self {
        self.0.modify(CMD::CARD_NUM.val(slot as u32));
        self
    }

    /// Raw register value
    pub fn bits(&self) -> u32 {
        self.0.get()
    }

    /// Register copy for field access
    pub fn register(&self) -> LocalRegisterCopy<u32, CMD::Register> {
        self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0.read(CMD::INDEX) as u8
    }

    pub fn expects_data(&self) -> bool {
        self.0.is_set(CMD::DATA_EXPECTED)
    }

    pub fn is_write(&self) -> bool {
        self.0.is_set(CMD::RW)
    }

    /// Whether the controller will issue STOP_TRANSMISSION after the data
    pub fn auto_stop(&self) -> bool {
        self.0.is_set(CMD::SEND_AUTO_STOP)
    }
}

impl fmt::Debug for HwCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwCommand({:#010x})", self.bits())
    }
}

/// Arrange raw response registers into the caller's response words
///
/// Long responses are stored most-significant register first, short ones
/// occupy word 0 only.
pub fn decode_response(flags: CommandFlags, raw: [u32; 4]) -> [u32; 4] {
    if !flags.contains(CommandFlags::RSP_PRESENT) {
        [0; 4]
    } else if flags.contains(CommandFlags::RSP_136) {
        [raw[3], raw[2], raw[1], raw[0]]
    } else {
        [raw[0], 0, 0, 0]
    }
}
