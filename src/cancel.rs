//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is handed to every unit of work. The controller
//! calls [`cancel`](CancellationToken::cancel); the work polls
//! [`is_cancelled`](CancellationToken::is_cancelled) at the same points it
//! polls its own stop condition, or blocks in
//! [`sleep`](CancellationToken::sleep), which wakes early on cancellation.
//!
//! Work that stops early because of cancellation calls
//! [`acknowledge`](CancellationToken::acknowledge). That re-asserts the
//! condition on a side channel the joiner reads through
//! [`UnitHandle::cancellation_observed`](crate::UnitHandle::cancellation_observed),
//! so a cancellation is never silently swallowed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Cancelled;

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    observed: AtomicBool,
    // Only used to pair with `wake`; the state lives in `requested`.
    sleepers: Mutex<()>,
    wake: Condvar,
}

/// Shared cancellation state for one execution unit.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes any sleeper. Idempotent.
    pub fn cancel(&self) {
        let _sleepers = self.inner.sleepers.lock();
        self.inner.requested.store(true, Ordering::Release);
        self.inner.wake.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Fails with [`Cancelled`] if cancellation has been requested.
    #[inline]
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Records that the work stopped because it was cancelled.
    pub fn acknowledge(&self) {
        self.inner.observed.store(true, Ordering::Release);
    }

    /// Whether the work acknowledged a cancellation.
    pub fn was_observed(&self) -> bool {
        self.inner.observed.load(Ordering::Acquire)
    }

    /// Blocks for `duration`, returning early with [`Cancelled`] if
    /// cancellation is requested before or during the wait.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        let mut sleepers = self.inner.sleepers.lock();
        while !self.is_cancelled() {
            if self.inner.wake.wait_until(&mut sleepers, deadline).timed_out() {
                return self.check();
            }
        }
        Err(Cancelled)
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("requested", &self.is_cancelled())
            .field("observed", &self.was_observed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_is_idempotent_and_shared_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        assert_eq!(clone.check(), Ok(()));

        token.cancel();
        token.cancel();

        assert!(clone.is_cancelled());
        assert_eq!(clone.check(), Err(Cancelled));
    }

    #[test]
    fn sleep_runs_to_completion_without_cancel() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert_eq!(token.sleep(Duration::from_millis(20)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn sleep_wakes_early_on_cancel() {
        let token = CancellationToken::new();
        let sleeper = token.clone();

        let mut handle =
            crate::unit::spawn("sleeper", move |_| sleeper.sleep(Duration::from_secs(10))).unwrap();
        thread::sleep(Duration::from_millis(50));
        token.cancel();

        assert_eq!(
            handle.join_timeout(Duration::from_secs(2)).unwrap(),
            crate::Joined::Finished(Err(Cancelled))
        );
    }

    #[test]
    fn acknowledge_is_visible_to_other_clones() {
        let token = CancellationToken::new();
        let worker = token.clone();
        thread::spawn(move || {
            worker.cancel();
            worker.acknowledge();
        })
        .join()
        .unwrap();

        assert!(token.was_observed());
    }
}
