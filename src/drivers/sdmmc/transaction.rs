//! Transaction state machine
//!
//! One [`Transaction`] tracks one command from the moment it is started
//! until the controller has reported everything it will report about it:
//!
//! ```text
//!   Idle -> SendingCmd -> SendingData -> Busy -> Idle
//!               |              |
//!               +--> Idle      +--> Idle (start-bit error / data over)
//! ```
//!
//! [`Transaction::step`] consumes one [`Event`] and returns the hardware
//! [`Actions`] the caller must perform. The only side effect it performs
//! itself is bookkeeping on the descriptor ring (completions and refills),
//! which the waiting task owns for the duration of the transaction.

use bitflags::bitflags;

use super::SdmmcError;
use super::command::{Command, CommandFlags};
use super::dma::DescriptorRing;
use super::event::Event;
use super::regs::{DmaStatus, IntStatus};

/// Request state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No transaction in progress (initial and terminal)
    Idle,
    /// Command started, waiting for command done
    SendingCmd,
    /// Data phase, waiting for DMA completions
    SendingData,
    /// All descriptors done, waiting for data transfer over
    Busy,
}

bitflags! {
    /// Hardware operations requested by a state machine step
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Actions: u8 {
        /// Read the response registers into the command
        const CAPTURE_RESPONSE = 1 << 0;
        /// Stop the internal DMA controller
        const STOP_DMA = 1 << 1;
        /// New descriptors were handed out; resume the DMA controller
        const RESUME_DMA = 1 << 2;
    }
}

/// Decode command-phase error bits
fn command_error(status: IntStatus, flags: CommandFlags) -> Option<SdmmcError> {
    if status.contains(IntStatus::RTO) {
        Some(SdmmcError::Timeout)
    } else if status.contains(IntStatus::RCRC) && flags.contains(CommandFlags::RSP_CRC) {
        Some(SdmmcError::InvalidCrc)
    } else if status.contains(IntStatus::RESP_ERR) {
        Some(SdmmcError::InvalidResponse)
    } else {
        None
    }
}

/// Decode data-phase error bits
fn data_error(status: IntStatus, flags: CommandFlags) -> Option<SdmmcError> {
    if !status.intersects(IntStatus::DATA_ERR) {
        return None;
    }
    if status.contains(IntStatus::DTO) {
        Some(SdmmcError::Timeout)
    } else if status.contains(IntStatus::DCRC) {
        Some(SdmmcError::InvalidCrc)
    } else if status.contains(IntStatus::EBE) && !flags.contains(CommandFlags::CMD_READ) {
        // On writes EBE means the card never returned the CRC status token
        Some(SdmmcError::Timeout)
    } else {
        Some(SdmmcError::Fail)
    }
}

/// State of one in-flight command
#[derive(Debug)]
pub struct Transaction {
    state: RequestState,
    opcode: u8,
    flags: CommandFlags,
    has_data: bool,
    busy_tolerant: bool,
    error: Option<SdmmcError>,
    unhandled: Event,
}

impl Transaction {
    /// Track a command that has just been started
    pub fn begin(cmd: &Command<'_>, busy_tolerant: bool) -> Self {
        Self {
            state: RequestState::SendingCmd,
            opcode: cmd.opcode,
            flags: cmd.flags,
            has_data: cmd.has_data(),
            busy_tolerant,
            error: None,
            unhandled: Event::empty(),
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == RequestState::Idle
    }

    /// Final result; only meaningful once idle
    pub fn result(&self) -> Result<(), SdmmcError> {
        self.error.map_or(Ok(()), Err)
    }

    /// Terminate without waiting for further events
    pub fn abort(&mut self, error: SdmmcError) {
        self.error = Some(error);
        self.state = RequestState::Idle;
        self.unhandled = Event::empty();
    }

    fn record(&mut self, error: Option<SdmmcError>) {
        if self.error.is_none() {
            self.error = error;
        }
    }

    /// Advance the state machine by one event
    ///
    /// Bits that the current state does not consume are kept and offered
    /// again with the next event.
    pub fn step<const N: usize>(&mut self, event: Event, ring: &mut DescriptorRing<N>) -> Actions {
        let orig = event.merge(self.unhandled);
        let mut evt = orig;
        let mut actions = Actions::empty();
        let mut next = self.state;

        loop {
            let state = next;
            match state {
                RequestState::Idle => {}

                RequestState::SendingCmd => {
                    if evt.host.take(IntStatus::CMD_ERR) {
                        let error = command_error(orig.host, self.flags);
                        self.record(error);
                        if error.is_some() && self.has_data {
                            actions |= Actions::STOP_DMA;
                        }
                        if error == Some(SdmmcError::Timeout) && !self.busy_tolerant {
                            log::debug!("SDMMC: CMD{} response timeout", self.opcode);
                            actions |= Actions::CAPTURE_RESPONSE;
                            next = RequestState::Idle;
                        }
                    }
                    if next == RequestState::SendingCmd && evt.host.take(IntStatus::CMD_DONE) {
                        self.record(command_error(orig.host, self.flags));
                        actions |= Actions::CAPTURE_RESPONSE;
                        next = if self.error.is_some() || !self.has_data {
                            RequestState::Idle
                        } else {
                            RequestState::SendingData
                        };
                    }
                }

                RequestState::SendingData => {
                    if evt.host.take(IntStatus::DATA_ERR) {
                        let error = data_error(orig.host, self.flags);
                        log::debug!("SDMMC: CMD{} data error {:?}", self.opcode, error);
                        self.record(error);
                        actions |= Actions::STOP_DMA;
                    }
                    if evt.dma.take(DmaStatus::DONE) {
                        let pending = ring.complete_one();
                        if self.error.is_none() && ring.bytes_remaining() > 0 {
                            let free = ring.free_count();
                            if ring.fill(free) > 0 {
                                actions |= Actions::RESUME_DMA;
                            }
                        }
                        if pending == 0 {
                            next = RequestState::Busy;
                        }
                    }
                    if orig.host.intersects(IntStatus::SBE | IntStatus::DATA_OVER) {
                        // No further DMA completion follows these
                        next = RequestState::Idle;
                    }
                }

                RequestState::Busy => {
                    if evt.host.take(IntStatus::DATA_OVER) {
                        let error = data_error(orig.host, self.flags);
                        if error.is_some() {
                            actions |= Actions::STOP_DMA;
                        }
                        self.record(error);
                        next = RequestState::Idle;
                    }
                }
            }

            if next == state {
                break;
            }
            log::trace!("SDMMC: CMD{} {:?} -> {:?}", self.opcode, state, next);
        }

        self.state = next;
        self.unhandled = if next == RequestState::Idle {
            Event::empty()
        } else {
            evt
        };

        // Response capture is meaningless if the command had none
        if !self.flags.contains(CommandFlags::RSP_PRESENT) {
            actions.remove(Actions::CAPTURE_RESPONSE);
        }
        actions
    }
}
