//! Internal DMA descriptor ring
//!
//! The controller's internal DMA walks a chain of descriptors, each pointing
//! at one contiguous chunk of the caller's buffer. A transfer larger than
//! the ring is streamed: the engine hands the first `N` chunks to hardware
//! and refills descriptors as the DMA controller returns them.
//!
//! A descriptor whose OWNED bit is set belongs to the DMA controller and is
//! never written by software; the ring asserts this before every refill.
//!
//! Descriptor words hold 32-bit addresses. Buffers are screened with
//! [`HostAdapter::is_dma_capable`](super::HostAdapter::is_dma_capable)
//! before they reach the ring.

use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{Ordering, fence};
use zerocopy::{FromZeros, KnownLayout};

/// Default maximum bytes per descriptor
pub const DMA_MAX_CHUNK_LEN: usize = 4096;

/// Largest value the 13-bit buffer size field can hold
pub const DMA_BUFFER_SIZE_MAX: usize = 0x1FFF;

/// Default number of descriptors in the ring
pub const DMA_RING_LEN: usize = 4;

bitflags! {
    /// DES0 control and status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u32 {
        /// Do not raise RI/TI when this descriptor completes
        const DISABLE_INT_ON_COMPLETION = 1 << 1;
        /// Last descriptor of the transfer
        const LAST = 1 << 2;
        /// First descriptor of the transfer
        const FIRST = 1 << 3;
        /// DES3 holds the next descriptor address
        const CHAINED = 1 << 4;
        /// Descriptor list wraps to the base address after this one
        const END_OF_RING = 1 << 5;
        /// Card error summary, written back by hardware
        const CARD_ERROR = 1 << 30;
        /// Owned by the DMA controller
        const OWNED = 1 << 31;
    }
}

/// Internal DMA descriptor (chained mode)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeros, KnownLayout)]
pub struct DmaDescriptor {
    /// DES0: control and status ([`DescFlags`])
    pub des0: u32,
    /// DES1: buffer 1 size in bits 12:0
    pub des1: u32,
    /// DES2: buffer 1 address
    pub buffer: u32,
    /// DES3: next descriptor address, zero after the last one
    pub next: u32,
}

impl DmaDescriptor {
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.des0)
    }

    /// Buffer 1 size in bytes
    pub fn size(&self) -> usize {
        (self.des1 as usize) & DMA_BUFFER_SIZE_MAX
    }
}

/// Progress of the transfer the ring is currently feeding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    /// Address of the next byte not yet handed to a descriptor
    pub cursor: usize,
    /// Bytes not yet handed to a descriptor
    pub bytes_remaining: usize,
    /// Ring slot the next fill writes
    pub next_index: usize,
    /// Descriptors not yet reported complete by the DMA controller
    pub pending: usize,
}

/// Fixed ring of `N` chained DMA descriptors
pub struct DescriptorRing<const N: usize = DMA_RING_LEN> {
    descriptors: [UnsafeCell<DmaDescriptor>; N],
    max_chunk_len: usize,
    transfer: TransferState,
    filled: usize,
}

impl<const N: usize> DescriptorRing<N> {
    /// Create an empty ring carving buffers into `max_chunk_len` pieces
    pub fn new(max_chunk_len: usize) -> Self {
        assert!(N > 0, "descriptor ring needs at least one slot");
        Self {
            descriptors: core::array::from_fn(|_| UnsafeCell::new(DmaDescriptor::new_zeroed())),
            max_chunk_len,
            transfer: TransferState::default(),
            filled: 0,
        }
    }

    /// Start feeding a new transfer of `total_len` bytes at `buffer_addr`
    ///
    /// Every descriptor is reset to software ownership before the first
    /// `N` chunks are handed to hardware. Returns the number filled.
    pub fn prepare(&mut self, buffer_addr: usize, block_len: usize, total_len: usize) -> usize {
        debug_assert!(block_len != 0 && total_len % block_len == 0);

        self.clear_descriptors();
        self.filled = 0;
        self.transfer = TransferState {
            cursor: buffer_addr,
            bytes_remaining: total_len,
            next_index: 0,
            pending: total_len.div_ceil(self.max_chunk_len),
        };

        log::trace!(
            "SDMMC: DMA prepare {:#x} len={} blk={} pending={}",
            buffer_addr,
            total_len,
            block_len,
            self.transfer.pending
        );

        self.fill(N)
    }

    /// Hand up to `n` more chunks to hardware
    ///
    /// # Panics
    ///
    /// Panics if the slot to be filled is still owned by the DMA controller.
    pub fn fill(&mut self, n: usize) -> usize {
        let mut count = 0;

        while count < n && self.transfer.bytes_remaining > 0 {
            let index = self.transfer.next_index;
            assert!(
                !self.read(index).flags().contains(DescFlags::OWNED),
                "SDMMC: refilling descriptor {} still owned by DMA",
                index
            );

            let chunk = self.transfer.bytes_remaining.min(self.max_chunk_len);
            let last = chunk == self.transfer.bytes_remaining;
            let next_index = (index + 1) % N;

            let mut flags = DescFlags::CHAINED | DescFlags::OWNED;
            if self.filled == 0 {
                flags |= DescFlags::FIRST;
            }
            if last {
                flags |= DescFlags::LAST;
            }

            self.publish(
                index,
                DmaDescriptor {
                    des0: flags.bits(),
                    des1: (((chunk + 3) & !3) & DMA_BUFFER_SIZE_MAX) as u32,
                    buffer: self.transfer.cursor as u32,
                    next: if last { 0 } else { self.addr(next_index) as u32 },
                },
            );

            self.transfer.cursor += chunk;
            self.transfer.bytes_remaining -= chunk;
            self.transfer.next_index = next_index;
            self.filled += 1;
            count += 1;
        }

        count
    }

    /// Number of consecutive software-owned slots starting at the fill index
    pub fn free_count(&self) -> usize {
        (0..N)
            .map(|i| (self.transfer.next_index + i) % N)
            .take_while(|&i| !self.read(i).flags().contains(DescFlags::OWNED))
            .count()
    }

    /// Account for one DMA completion, returning descriptors still pending
    pub fn complete_one(&mut self) -> usize {
        debug_assert!(self.transfer.pending > 0, "DMA completion without pending descriptor");
        self.transfer.pending = self.transfer.pending.saturating_sub(1);
        self.transfer.pending
    }

    /// Drop the transfer: zero the state and every descriptor
    pub fn finish(&mut self) {
        self.clear_descriptors();
        self.transfer = TransferState::default();
        self.filled = 0;
    }

    /// Address of the first descriptor, as programmed into the controller
    pub fn head(&self) -> *const DmaDescriptor {
        self.descriptors[0].get()
    }

    /// Snapshot of one descriptor
    pub fn descriptor(&self, index: usize) -> DmaDescriptor {
        self.read(index)
    }

    /// Number of descriptors currently owned by hardware
    pub fn owned_count(&self) -> usize {
        (0..N)
            .filter(|&i| self.read(i).flags().contains(DescFlags::OWNED))
            .count()
    }

    pub fn transfer(&self) -> &TransferState {
        &self.transfer
    }

    pub fn bytes_remaining(&self) -> usize {
        self.transfer.bytes_remaining
    }

    pub fn pending(&self) -> usize {
        self.transfer.pending
    }

    pub fn max_chunk_len(&self) -> usize {
        self.max_chunk_len
    }

    fn addr(&self, index: usize) -> usize {
        self.descriptors[index].get() as usize
    }

    fn read(&self, index: usize) -> DmaDescriptor {
        // SAFETY: the cell is valid for reads; hardware may update DES0
        // concurrently, hence the volatile access
        unsafe { ptr::read_volatile(self.descriptors[index].get()) }
    }

    /// Write a descriptor, handing it to hardware last
    fn publish(&self, index: usize, desc: DmaDescriptor) {
        let p = self.descriptors[index].get();
        // SAFETY: the slot is software-owned (checked by the caller), so
        // hardware does not access it until DES0 is written
        unsafe {
            ptr::write_volatile(&raw mut (*p).des1, desc.des1);
            ptr::write_volatile(&raw mut (*p).buffer, desc.buffer);
            ptr::write_volatile(&raw mut (*p).next, desc.next);
            fence(Ordering::SeqCst);
            ptr::write_volatile(&raw mut (*p).des0, desc.des0);
        }
    }

    fn clear_descriptors(&mut self) {
        for cell in &self.descriptors {
            // SAFETY: exclusive access through &mut self
            unsafe { ptr::write_volatile(cell.get(), DmaDescriptor::new_zeroed()) };
        }
        fence(Ordering::SeqCst);
    }
}

impl<const N: usize> Default for DescriptorRing<N> {
    fn default() -> Self {
        Self::new(DMA_MAX_CHUNK_LEN)
    }
}
