//! Simulated controller for engine tests
//!
//! [`MockHost`] records every adapter call, latches raised interrupt bits
//! the way RINTSTS/IDSTS do, and plays the DMA controller by handing
//! descriptors back in ring order.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use spin::relax::{RelaxStrategy, Spin};

use super::command::HwCommand;
use super::dma::{DescFlags, DmaDescriptor};
use super::host::HostAdapter;
use super::regs::{DmaStatus, IntStatus};
use super::{Command, SdmmcError, SdmmcHost};
use crate::time::StdClock;

/// Bound on how long a test waits for the engine to make progress
const STALL_LIMIT: Duration = Duration::from_secs(5);

/// One recorded adapter call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    StartCommand { slot: usize, opcode: u8, bits: u32, arg: u32 },
    DmaPrepare { block_len: usize, total_len: usize },
    DmaStop,
    DmaResume,
    ReadResponse,
    EnableInterrupts(u32),
    SdioInterrupt { slot: usize, enabled: bool },
    ClearSdio(usize),
}

impl Op {
    pub fn is_dma(&self) -> bool {
        matches!(self, Op::DmaPrepare { .. } | Op::DmaStop | Op::DmaResume)
    }
}

pub struct MockHost {
    ring_len: usize,
    ops: Mutex<Vec<Op>>,
    pending_host: AtomicU32,
    pending_dma: AtomicU32,
    ring_head: AtomicUsize,
    hw_index: AtomicUsize,
    retired: Mutex<Vec<u32>>,
    response: Mutex<[u32; 4]>,
    started: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    card_present: AtomicBool,
    write_protected: AtomicBool,
    dma_capable: AtomicBool,
    busy_polls: AtomicUsize,
    busy_checks: AtomicUsize,
    d1_low: AtomicBool,
}

impl MockHost {
    /// Mock for an engine whose rings have `ring_len` descriptors
    pub fn new(ring_len: usize) -> Self {
        Self {
            ring_len,
            ops: Mutex::new(Vec::new()),
            pending_host: AtomicU32::new(0),
            pending_dma: AtomicU32::new(0),
            ring_head: AtomicUsize::new(0),
            hw_index: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
            response: Mutex::new([0; 4]),
            started: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
            card_present: AtomicBool::new(true),
            write_protected: AtomicBool::new(false),
            dma_capable: AtomicBool::new(true),
            busy_polls: AtomicUsize::new(0),
            busy_checks: AtomicUsize::new(0),
            d1_low: AtomicBool::new(false),
        }
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.lock().unwrap().iter().filter(|op| pred(op)).count()
    }

    /// Latch interrupt bits as hardware would
    pub fn raise(&self, host: u32, dma: u32) {
        self.pending_host.fetch_or(host, Ordering::SeqCst);
        self.pending_dma.fetch_or(dma, Ordering::SeqCst);
    }

    pub fn pending_status(&self) -> (u32, u32) {
        (
            self.pending_host.load(Ordering::SeqCst),
            self.pending_dma.load(Ordering::SeqCst),
        )
    }

    pub fn set_response(&self, words: [u32; 4]) {
        *self.response.lock().unwrap() = words;
    }

    pub fn set_card_present(&self, present: bool) {
        self.card_present.store(present, Ordering::SeqCst);
    }

    pub fn set_write_protected(&self, protected: bool) {
        self.write_protected.store(protected, Ordering::SeqCst);
    }

    pub fn set_dma_capable(&self, capable: bool) {
        self.dma_capable.store(capable, Ordering::SeqCst);
    }

    /// Report DAT0 busy for the next `polls` checks
    pub fn set_busy_polls(&self, polls: usize) {
        self.busy_polls.store(polls, Ordering::SeqCst);
    }

    pub fn busy_checks(&self) -> usize {
        self.busy_checks.load(Ordering::SeqCst)
    }

    pub fn set_d1_low(&self, low: bool) {
        self.d1_low.store(low, Ordering::SeqCst);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Most commands ever started without being answered
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    /// The test is about to answer the oldest started command
    pub fn answer(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// Buffer addresses of the descriptors retired so far, in order
    pub fn retired(&self) -> Vec<u32> {
        self.retired.lock().unwrap().clone()
    }

    /// Spin until at least `count` commands have been started
    pub fn wait_started(&self, count: usize) {
        let deadline = Instant::now() + STALL_LIMIT;
        while self.started() < count {
            assert!(Instant::now() < deadline, "engine never started command #{count}");
            std::thread::yield_now();
        }
    }

    /// Play the DMA controller finishing the next descriptor in ring order
    ///
    /// Waits for the engine to hand the descriptor over first, since
    /// refills happen asynchronously on the engine thread.
    pub fn retire_descriptor(&self) {
        let head = self.ring_head.load(Ordering::SeqCst) as *mut DmaDescriptor;
        assert!(!head.is_null(), "no DMA transfer prepared");

        let index = self.hw_index.fetch_add(1, Ordering::SeqCst) % self.ring_len;
        let deadline = Instant::now() + STALL_LIMIT;
        // SAFETY: head points at the engine's live descriptor ring
        unsafe {
            let des0 = &raw mut (*head.add(index)).des0;
            loop {
                let value = ptr::read_volatile(des0);
                if value & DescFlags::OWNED.bits() != 0 {
                    let buffer = ptr::read_volatile(&raw const (*head.add(index)).buffer);
                    self.retired.lock().unwrap().push(buffer);
                    ptr::write_volatile(des0, value & !DescFlags::OWNED.bits());
                    return;
                }
                assert!(Instant::now() < deadline, "descriptor {index} never handed to DMA");
                std::thread::yield_now();
            }
        }
    }
}

impl HostAdapter for MockHost {
    fn start_command(&self, slot: usize, cmd: HwCommand, arg: u32) -> Result<(), SdmmcError> {
        if !self.card_present.load(Ordering::SeqCst) {
            return Err(SdmmcError::NotFound);
        }
        if cmd.expects_data() && cmd.is_write() && self.write_protected.load(Ordering::SeqCst) {
            return Err(SdmmcError::InvalidState);
        }

        // Record the word as the controller would see it
        self.record(Op::StartCommand {
            slot,
            opcode: cmd.opcode(),
            bits: cmd.for_slot(slot).bits(),
            arg,
        });
        let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dma_prepare(&self, ring_head: *const DmaDescriptor, block_len: usize, total_len: usize) {
        self.ring_head.store(ring_head as usize, Ordering::SeqCst);
        self.hw_index.store(0, Ordering::SeqCst);
        self.record(Op::DmaPrepare {
            block_len,
            total_len,
        });
    }

    fn dma_stop(&self) {
        self.record(Op::DmaStop);
    }

    fn dma_resume(&self) {
        self.record(Op::DmaResume);
    }

    fn read_response(&self) -> [u32; 4] {
        self.record(Op::ReadResponse);
        *self.response.lock().unwrap()
    }

    fn read_interrupt_status(&self) -> (u32, u32) {
        self.pending_status()
    }

    fn clear_interrupt_status(&self, host: u32, dma: u32) {
        self.pending_host.fetch_and(!host, Ordering::SeqCst);
        self.pending_dma.fetch_and(!dma, Ordering::SeqCst);
    }

    fn enable_interrupts(&self, mask: u32) {
        self.record(Op::EnableInterrupts(mask));
    }

    fn set_sdio_interrupt(&self, slot: usize, enabled: bool) {
        self.record(Op::SdioInterrupt { slot, enabled });
    }

    fn clear_sdio_interrupt(&self, slot: usize) {
        self.pending_host
            .fetch_and(!IntStatus::io_slot(slot).bits(), Ordering::SeqCst);
        self.record(Op::ClearSdio(slot));
    }

    fn is_card_busy(&self, _slot: usize) -> bool {
        self.busy_checks.fetch_add(1, Ordering::SeqCst);
        self.busy_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn is_d1_low(&self, _slot: usize) -> bool {
        self.d1_low.load(Ordering::SeqCst)
    }

    fn is_dma_capable(&self, _addr: usize, _len: usize) -> bool {
        self.dma_capable.load(Ordering::SeqCst)
    }
}

/// One simulated interrupt
#[derive(Debug, Clone, Copy)]
pub struct Irq {
    pub host: IntStatus,
    pub dma: DmaStatus,
    /// Descriptors the DMA controller finishes before raising it
    pub retire: usize,
}

impl Irq {
    pub fn host(bits: IntStatus) -> Self {
        Self {
            host: bits,
            dma: DmaStatus::empty(),
            retire: 0,
        }
    }

    /// Completion of one descriptor in the given direction
    pub fn dma_done(read: bool) -> Self {
        Self {
            host: IntStatus::empty(),
            dma: (if read { DmaStatus::RI } else { DmaStatus::TI }) | DmaStatus::NI,
            retire: 1,
        }
    }
}

pub type MockSdmmc<'a, const SLOTS: usize = 2, const N: usize = 4, R = Spin> =
    SdmmcHost<&'a MockHost, StdClock, SLOTS, N, R>;

/// Run `execute` on a worker thread while this thread plays `irqs`
///
/// The interrupts start once the command has reached the controller.
pub fn run_with_irqs<const SLOTS: usize, const N: usize, R: RelaxStrategy>(
    sdmmc: &MockSdmmc<'_, SLOTS, N, R>,
    mock: &MockHost,
    slot: usize,
    cmd: &mut Command<'_>,
    irqs: &[Irq],
) -> Result<(), SdmmcError> {
    let before = mock.started();
    std::thread::scope(|s| {
        let worker = s.spawn(move || sdmmc.execute(slot, cmd));
        if !irqs.is_empty() {
            mock.wait_started(before + 1);
            mock.answer();
        }
        for irq in irqs {
            for _ in 0..irq.retire {
                mock.retire_descriptor();
            }
            mock.raise(irq.host.bits(), irq.dma.bits());
            sdmmc.handle_interrupt();
        }
        worker.join().expect("execute panicked")
    })
}
