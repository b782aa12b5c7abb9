//! Host Register Adapter
//!
//! The engine never touches controller registers itself. Everything it needs
//! from the hardware goes through this trait, which keeps the transaction
//! logic independent of the register layout and lets it run against a
//! simulated controller.
//!
//! All operations are register accesses only: none of them may block or
//! wait for the card. The single exception is the bounded poll for the
//! controller to accept a command in [`HostAdapter::start_command`].

use super::SdmmcError;
use super::command::HwCommand;
use super::dma::DmaDescriptor;

/// Register-level operations of an SD/MMC host controller
pub trait HostAdapter {
    /// Write the argument and command word and start the command on `slot`
    ///
    /// Fails without starting anything when the slot cannot run the
    /// command (no card, write-protected card, controller did not accept
    /// the command).
    fn start_command(&self, slot: usize, cmd: HwCommand, arg: u32) -> Result<(), SdmmcError>;

    /// Program block size, byte count and descriptor base, then enable the
    /// internal DMA controller
    fn dma_prepare(&self, ring_head: *const DmaDescriptor, block_len: usize, total_len: usize);

    /// Disable the internal DMA controller and reset its state
    fn dma_stop(&self);

    /// Tell a suspended DMA controller that new descriptors are available
    fn dma_resume(&self);

    /// Raw response registers RESP0..RESP3
    fn read_response(&self) -> [u32; 4];

    /// Raw (host, DMA) interrupt status
    fn read_interrupt_status(&self) -> (u32, u32);

    /// Acknowledge (write-1-to-clear) host and DMA interrupt bits
    fn clear_interrupt_status(&self, host: u32, dma: u32);

    /// Unmask the given host interrupts and enable the controller's interrupt
    /// output
    fn enable_interrupts(&self, mask: u32);

    /// Mask or unmask the SDIO interrupt of `slot`
    fn set_sdio_interrupt(&self, slot: usize, enabled: bool);

    /// Acknowledge a latched SDIO interrupt of `slot`
    fn clear_sdio_interrupt(&self, slot: usize);

    /// Whether the card in `slot` holds DAT0 low
    fn is_card_busy(&self, _slot: usize) -> bool {
        false
    }

    /// Whether DAT1 of `slot` is currently low (SDIO interrupt asserted)
    fn is_d1_low(&self, _slot: usize) -> bool {
        false
    }

    /// Whether the DMA engine can reach `len` bytes at `addr`
    ///
    /// Descriptors carry 32-bit buffer addresses, so adapters for the
    /// internal DMA must refuse anything ending above 4 GiB. The engine's
    /// descriptor ring has the same limit and has to live in reachable
    /// memory.
    fn is_dma_capable(&self, _addr: usize, _len: usize) -> bool {
        true
    }
}

impl<T: HostAdapter + ?Sized> HostAdapter for &T {
    fn start_command(&self, slot: usize, cmd: HwCommand, arg: u32) -> Result<(), SdmmcError> {
        (**self).start_command(slot, cmd, arg)
    }

    fn dma_prepare(&self, ring_head: *const DmaDescriptor, block_len: usize, total_len: usize) {
        (**self).dma_prepare(ring_head, block_len, total_len)
    }

    fn dma_stop(&self) {
        (**self).dma_stop()
    }

    fn dma_resume(&self) {
        (**self).dma_resume()
    }

    fn read_response(&self) -> [u32; 4] {
        (**self).read_response()
    }

    fn read_interrupt_status(&self) -> (u32, u32) {
        (**self).read_interrupt_status()
    }

    fn clear_interrupt_status(&self, host: u32, dma: u32) {
        (**self).clear_interrupt_status(host, dma)
    }

    fn enable_interrupts(&self, mask: u32) {
        (**self).enable_interrupts(mask)
    }

    fn set_sdio_interrupt(&self, slot: usize, enabled: bool) {
        (**self).set_sdio_interrupt(slot, enabled)
    }

    fn clear_sdio_interrupt(&self, slot: usize) {
        (**self).clear_sdio_interrupt(slot)
    }

    fn is_card_busy(&self, slot: usize) -> bool {
        (**self).is_card_busy(slot)
    }

    fn is_d1_low(&self, slot: usize) -> bool {
        (**self).is_d1_low(slot)
    }

    fn is_dma_capable(&self, addr: usize, len: usize) -> bool {
        (**self).is_dma_capable(addr, len)
    }
}
