//! # BackOff
//!
//! Exponential backoff used by the harness whenever it has to poll something
//! that another execution unit will eventually change, most notably while
//! waiting for a unit to finish inside [`UnitHandle::join_timeout`].
//!
//! Each call to [`BackOff::wait`] first spins with [`core::hint::spin_loop`],
//! doubling the spin count every time. Past a yield threshold it yields the
//! thread, and once the spin count saturates it parks the caller in short
//! sleeps so that a bounded wait of several seconds does not pin a core.
//!
//! ```rust
//! use visibility_harness::BackOff;
//!
//! let backoff = BackOff::new();
//! let mut attempts = 0;
//! while attempts < 4 {
//!     attempts += 1;
//!     backoff.wait();
//! }
//! assert!(backoff.current() > 32);
//! ```
//!
//! [`UnitHandle::join_timeout`]: crate::UnitHandle::join_timeout

use core::{cell::Cell, hint::spin_loop};
use std::time::Duration;

/// Spin count at which the backoff stops growing and starts sleeping.
const MAX_SPIN: u32 = 1 << 12;

/// Default starting spin count.
const START_VALUE: u32 = 1 << 5;

/// Above this spin count each wait also yields the thread.
const YIELD_THRESHOLD: u32 = 1 << 8;

/// Sleep used once spinning is saturated.
const PARK_INTERVAL: Duration = Duration::from_millis(1);

/// A per-waiter exponential backoff.
///
/// Not `Sync`: every polling loop owns its own instance.
pub struct BackOff {
    spin: Cell<u32>,
}

impl BackOff {
    /// Creates a backoff starting at the default spin count.
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            spin: Cell::new(START_VALUE),
        }
    }

    /// Waits once, growing the next wait.
    ///
    /// Spins while the count is small, yields past the threshold and sleeps
    /// for [`PARK_INTERVAL`] once the count has reached [`MAX_SPIN`].
    #[inline]
    pub fn wait(&self) {
        if self.is_parking() {
            std::thread::sleep(PARK_INTERVAL);
            return;
        }

        let end = self.current();
        for _ in 0..end {
            spin_loop();
        }
        if end > YIELD_THRESHOLD {
            std::thread::yield_now();
        }

        self.spin.set((end << 1).min(MAX_SPIN));
    }

    /// Returns `true` once the backoff has escalated to sleeping.
    #[inline(always)]
    pub fn is_parking(&self) -> bool {
        self.spin.get() >= MAX_SPIN
    }

    /// Returns the current spin iteration value.
    #[inline(always)]
    pub fn current(&self) -> u32 {
        self.spin.get()
    }
}

impl Default for BackOff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_growth_saturates_at_max_spin() {
        let b = BackOff::new();

        let mut prev = b.current();
        for _ in 0..16 {
            b.wait();
            let curr = b.current();
            assert!(curr >= prev, "Backoff spin did not grow");
            prev = curr;
        }

        assert_eq!(b.current(), MAX_SPIN);
        assert!(b.is_parking());
    }

    #[test]
    fn test_parking_wait_sleeps() {
        let b = BackOff::new();
        while !b.is_parking() {
            b.wait();
        }

        let start = Instant::now();
        b.wait();
        assert!(start.elapsed() >= PARK_INTERVAL);
    }
}
