//! Interrupt-to-task event delivery
//!
//! The interrupt handler captures the controller's status into an [`Event`]
//! and pushes it onto a bounded lock-free queue. The task that currently owns
//! the slot pops events while it waits for its transaction to finish.
//!
//! The queue never blocks the interrupt handler. When it is full the newest
//! event is dropped and counted; with 32 entries and a handful of events per
//! transaction this only happens if the waiting task stops draining, which
//! is a known limitation rather than a guarantee.

use core::sync::atomic::{AtomicU32, Ordering};
use heapless::mpmc::MpMcQueue;

use super::host::HostAdapter;
use super::regs::{DmaStatus, IntStatus};
use crate::time::{Clock, Timeout};

/// Event queue capacity (must be a power of two)
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Masked host and DMA status captured by one interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Host controller interrupt bits
    pub host: IntStatus,
    /// Internal DMA interrupt bits
    pub dma: DmaStatus,
}

impl Event {
    pub const fn empty() -> Self {
        Self {
            host: IntStatus::empty(),
            dma: DmaStatus::empty(),
        }
    }

    /// Build an event from raw register values, keeping only engine bits
    pub fn from_raw(host: u32, dma: u32) -> Self {
        Self {
            host: IntStatus::from_bits_truncate(host) & IntStatus::EVENT_MASK,
            dma: DmaStatus::from_bits_truncate(dma) & DmaStatus::EVENT_MASK,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.dma.is_empty()
    }

    /// Union of two events
    pub fn merge(self, other: Self) -> Self {
        Self {
            host: self.host | other.host,
            dma: self.dma | other.dma,
        }
    }
}

/// What one pass of the interrupt handler found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    /// Transaction event, if any engine bit was pending
    pub event: Option<Event>,
    /// SDIO interrupt bits that fired
    pub sdio: IntStatus,
}

/// Read, mask and clear the controller's interrupt status
///
/// Runs in interrupt context. Only the captured engine bits and the raw DMA
/// status are acknowledged; SDIO bits stay latched until the SDIO waiter
/// clears them.
pub fn capture_interrupt<H: HostAdapter + ?Sized>(host: &H) -> Capture {
    let (raw_host, raw_dma) = host.read_interrupt_status();
    let event = Event::from_raw(raw_host, raw_dma);
    host.clear_interrupt_status(event.host.bits(), raw_dma);

    Capture {
        event: (!event.is_empty()).then_some(event),
        sdio: IntStatus::from_bits_truncate(raw_host) & IntStatus::IO_SLOTS,
    }
}

/// Bounded event queue between the interrupt handler and a waiting task
pub struct EventSource<const Q: usize = EVENT_QUEUE_DEPTH> {
    queue: MpMcQueue<Event, Q>,
    dropped: AtomicU32,
}

impl<const Q: usize> EventSource<Q> {
    pub const fn new() -> Self {
        Self {
            queue: MpMcQueue::new(),
            dropped: AtomicU32::new(0),
        }
    }

    /// Enqueue from interrupt context
    ///
    /// Returns false if the queue was full and the event was dropped.
    pub fn push(&self, event: Event) -> bool {
        match self.queue.enqueue(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Dequeue without waiting
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.dequeue()
    }

    /// Wait for the next event until `timeout` expires
    pub fn recv<C: Clock + ?Sized>(&self, timeout: &Timeout<'_, C>) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.dequeue() {
                return Some(event);
            }
            if timeout.is_expired() {
                // An event may have landed between the last poll and expiry
                return self.queue.dequeue();
            }
            timeout.clock().relax();
        }
    }

    /// Number of events dropped since the last call
    pub fn take_dropped(&self) -> u32 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

impl<const Q: usize> Default for EventSource<Q> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sdmmc::testing::MockHost;
    use crate::time::StdClock;

    #[test]
    fn from_raw_masks_uninteresting_bits() {
        let raw_host =
            (IntStatus::CMD_DONE | IntStatus::TXDR | IntStatus::IO_SLOT1 | IntStatus::ACD).bits();
        let raw_dma = (DmaStatus::RI | DmaStatus::DU | DmaStatus::AI).bits();
        let event = Event::from_raw(raw_host, raw_dma);
        assert_eq!(event.host, IntStatus::CMD_DONE);
        assert_eq!(event.dma, DmaStatus::RI);
    }

    #[test]
    fn capture_clears_what_it_reports() {
        let host = MockHost::new(4);
        host.raise(
            (IntStatus::DATA_OVER | IntStatus::RXDR | IntStatus::IO_SLOT0).bits(),
            (DmaStatus::RI | DmaStatus::NI).bits(),
        );

        let capture = capture_interrupt(&host);
        assert_eq!(
            capture.event,
            Some(Event {
                host: IntStatus::DATA_OVER,
                dma: DmaStatus::RI | DmaStatus::NI,
            })
        );
        assert_eq!(capture.sdio, IntStatus::IO_SLOT0);

        // RXDR is not ours to acknowledge; SDIO stays latched for its waiter
        let (left_host, left_dma) = host.pending_status();
        assert_eq!(left_host, (IntStatus::RXDR | IntStatus::IO_SLOT0).bits());
        assert_eq!(left_dma, 0);
    }

    #[test]
    fn capture_without_engine_bits_yields_no_event() {
        let host = MockHost::new(4);
        host.raise(IntStatus::IO_SLOT1.bits(), 0);
        let capture = capture_interrupt(&host);
        assert_eq!(capture.event, None);
        assert_eq!(capture.sdio, IntStatus::IO_SLOT1);
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let source: EventSource<4> = EventSource::new();
        let ev = Event::from_raw(IntStatus::CMD_DONE.bits(), 0);
        for i in 0..6 {
            assert_eq!(source.push(ev), i < 4);
        }
        assert_eq!(source.take_dropped(), 2);
        assert_eq!(source.take_dropped(), 0);

        let mut delivered = 0;
        while source.try_recv().is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 4);
    }

    #[test]
    fn recv_times_out_on_empty_queue() {
        let clock = StdClock::new();
        let source: EventSource = EventSource::new();
        let timeout = Timeout::from_ms(&clock, 5);
        assert_eq!(source.recv(&timeout), None);
        assert!(timeout.is_expired());
    }

    #[test]
    fn recv_preserves_order() {
        let clock = StdClock::new();
        let source: EventSource = EventSource::new();
        let first = Event::from_raw(IntStatus::CMD_DONE.bits(), 0);
        let second = Event::from_raw(0, DmaStatus::TI.bits());
        source.push(first);
        source.push(second);

        let timeout = Timeout::from_ms(&clock, 10);
        assert_eq!(source.recv(&timeout), Some(first));
        assert_eq!(source.recv(&timeout), Some(second));
    }
}
