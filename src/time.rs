//! Time source and deadlines
//!
//! The engine never reads a hardware timer directly. Platforms implement
//! [`Clock`] on top of whatever monotonic counter they have, and the engine
//! builds [`Timeout`] deadlines from it for every bounded wait.

/// Monotonic time source used for all engine waits
pub trait Clock {
    /// Current monotonic time in microseconds
    fn now_us(&self) -> u64;

    /// Give up the CPU briefly while polling
    ///
    /// Bare-metal ports keep the default spin hint; RTOS glue yields to the
    /// scheduler so the interrupt handler and other tasks can run.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn relax(&self) {
        (**self).relax()
    }
}

/// A deadline measured against a [`Clock`]
pub struct Timeout<'a, C: Clock + ?Sized> {
    clock: &'a C,
    deadline_us: u64,
}

impl<'a, C: Clock + ?Sized> Timeout<'a, C> {
    /// Create a timeout that expires `ms` milliseconds from now
    pub fn from_ms(clock: &'a C, ms: u64) -> Self {
        Self::from_us(clock, ms.saturating_mul(1000))
    }

    /// Create a timeout that expires `us` microseconds from now
    pub fn from_us(clock: &'a C, us: u64) -> Self {
        Self {
            clock,
            deadline_us: clock.now_us().saturating_add(us),
        }
    }

    /// Check whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.clock.now_us() >= self.deadline_us
    }

    /// Microseconds left before expiry (zero once expired)
    pub fn remaining_us(&self) -> u64 {
        self.deadline_us.saturating_sub(self.clock.now_us())
    }

    /// Clock this deadline is measured against
    pub fn clock(&self) -> &'a C {
        self.clock
    }
}

/// Clock backed by `std::time::Instant`
#[cfg(any(test, feature = "std"))]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(any(test, feature = "std"))]
impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "std"))]
impl Clock for StdClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}
