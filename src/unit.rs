//! Execution units: named OS threads with a bounded join and a cancellation
//! token.
//!
//! Every experiment runs its readers, writers and workers through [`spawn`].
//! The handle never blocks without a bound unless the caller explicitly asks
//! for [`UnitHandle::join`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Cancelled, HarnessError, Result};
use crate::{BackOff, CancellationToken, VisibilityFlag};

/// Outcome of a bounded join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Joined<T> {
    /// The unit finished and produced this value.
    Finished(T),
    /// The timeout elapsed first; the unit is still running.
    TimedOut,
}

/// Handle to a spawned execution unit.
///
/// Dropping the handle detaches the thread.
pub struct UnitHandle<T> {
    name: String,
    thread: Option<JoinHandle<T>>,
    token: CancellationToken,
}

/// Runs `work` on a new thread named `name`.
///
/// The work receives the unit's [`CancellationToken`]; the handle keeps a
/// clone for [`UnitHandle::request_cancellation`].
pub fn spawn<T, F>(name: impl Into<String>, work: F) -> Result<UnitHandle<T>>
where
    F: FnOnce(CancellationToken) -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    let token = CancellationToken::new();
    let worker_token = token.clone();

    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || work(worker_token))
        .map_err(|source| HarnessError::Spawn {
            unit: name.clone(),
            source,
        })?;

    debug!(unit = %name, "execution unit spawned");
    Ok(UnitHandle {
        name,
        thread: Some(thread),
        token,
    })
}

/// Spawns `count` units named `{prefix}-{i}`, the work of unit `i` built by
/// `make(i)`.
///
/// If a spawn fails, the units already started are sent a cancellation
/// before the error is returned.
pub fn spawn_group<T, F, M>(prefix: &str, count: usize, mut make: M) -> Result<Vec<UnitHandle<T>>>
where
    M: FnMut(usize) -> F,
    F: FnOnce(CancellationToken) -> T + Send + 'static,
    T: Send + 'static,
{
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        match spawn(format!("{prefix}-{i}"), make(i)) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                warn!(%err, started = handles.len(), "spawn failed, cancelling the group");
                cancel_all(&handles);
                return Err(err);
            }
        }
    }
    Ok(handles)
}

/// Requests cancellation of every unit in `handles`.
pub fn cancel_all<T>(handles: &[UnitHandle<T>]) {
    for handle in handles {
        handle.request_cancellation();
    }
}

/// Joins every unit within one shared `timeout`.
///
/// A unit still running at the deadline fails the whole group with
/// [`HarnessError::UnitTimedOut`]; the units not yet joined are cancelled.
pub fn join_group<T>(
    experiment: &str,
    handles: &mut [UnitHandle<T>],
    timeout: Duration,
) -> Result<Vec<T>> {
    let deadline = Instant::now() + timeout;
    let mut results = Vec::with_capacity(handles.len());
    let mut failure = None;

    for handle in handles.iter_mut() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match handle.join_timeout(remaining) {
            Ok(Joined::Finished(value)) => results.push(value),
            Ok(Joined::TimedOut) => {
                warn!(experiment, unit = handle.name(), ?timeout, "unit missed the group deadline");
                failure = Some(HarnessError::UnitTimedOut {
                    experiment: experiment.to_owned(),
                    unit: handle.name().to_owned(),
                    timeout,
                });
                break;
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    match failure {
        Some(err) => {
            cancel_all(handles);
            Err(err)
        }
        None => Ok(results),
    }
}

/// Holds a group of units at a common start line until it is opened, so
/// that they begin their work together.
///
/// Unlike a fixed-size barrier, a waiter also leaves when its own unit is
/// cancelled, so a group whose spawning failed halfway never hangs.
#[derive(Clone)]
pub struct StartGate {
    open: Arc<VisibilityFlag>,
}

impl StartGate {
    /// A closed gate.
    pub fn new() -> Self {
        Self {
            open: Arc::new(VisibilityFlag::guarded(false)),
        }
    }

    /// Releases every waiter, present and future.
    pub fn open(&self) {
        self.open.raise();
    }

    /// Waits for the gate to open, or fails with [`Cancelled`].
    pub fn wait(&self, token: &CancellationToken) -> Result<(), Cancelled> {
        // Yield instead of backing off: waiters must leave as close together
        // as possible.
        while !self.open.read() {
            token.check()?;
            thread::yield_now();
        }
        Ok(())
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Name of the calling thread, for log fields.
pub fn current_unit() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_owned()
}

impl<T> UnitHandle<T> {
    /// The thread name given at spawn.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` while the thread has not returned. A joined unit is not alive.
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Asks the unit to stop. Best effort: the work must poll its token.
    pub fn request_cancellation(&self) {
        debug!(unit = %self.name, "cancellation requested");
        self.token.cancel();
    }

    /// Whether the work acknowledged a cancellation before returning.
    pub fn cancellation_observed(&self) -> bool {
        self.token.was_observed()
    }

    /// Blocks until the unit finishes, however long that takes.
    pub fn join(&mut self) -> Result<T> {
        let thread = self.thread.take().ok_or_else(|| HarnessError::AlreadyJoined {
            unit: self.name.clone(),
        })?;
        thread.join().map_err(|_| {
            warn!(unit = %self.name, "execution unit panicked");
            HarnessError::UnitPanicked {
                unit: self.name.clone(),
            }
        })
    }

    /// Waits at most `timeout` for the unit to finish.
    ///
    /// On [`Joined::TimedOut`] the handle stays joinable.
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<Joined<T>> {
        let thread = self.thread.as_ref().ok_or_else(|| HarnessError::AlreadyJoined {
            unit: self.name.clone(),
        })?;

        let deadline = Instant::now() + timeout;
        let backoff = BackOff::new();
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                debug!(unit = %self.name, ?timeout, "join timed out, unit still running");
                return Ok(Joined::TimedOut);
            }
            backoff.wait();
        }

        self.join().map(Joined::Finished)
    }
}

impl<T> std::fmt::Debug for UnitHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .field("joined", &self.thread.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_returns_work_result_and_thread_name() {
        let mut unit = spawn("unit-test-worker", |_| current_unit()).unwrap();
        assert_eq!(unit.join().unwrap(), "unit-test-worker");
        assert!(!unit.is_alive());
    }

    #[test]
    fn second_join_is_an_error() {
        let mut handle = spawn("joined-twice", |_| ()).unwrap();
        handle.join().unwrap();
        assert!(matches!(
            handle.join(),
            Err(HarnessError::AlreadyJoined { unit }) if unit == "joined-twice"
        ));
    }

    #[test]
    fn join_timeout_reports_still_running_then_finishes_after_cancel() {
        let mut unit = spawn("sleepy", |token: CancellationToken| {
            if token.sleep(Duration::from_secs(30)).is_err() {
                token.acknowledge();
            }
            7
        })
        .unwrap();

        assert_eq!(
            unit.join_timeout(Duration::from_millis(50)).unwrap(),
            Joined::TimedOut
        );
        assert!(unit.is_alive());

        unit.request_cancellation();
        assert_eq!(
            unit.join_timeout(Duration::from_secs(5)).unwrap(),
            Joined::Finished(7)
        );
        assert!(unit.cancellation_observed());
    }

    #[test]
    fn group_join_fails_on_deadline_and_cancels_the_rest() {
        let mut group = spawn_group("straggler", 3, |i| {
            move |token: CancellationToken| {
                if i == 1 && token.sleep(Duration::from_secs(30)).is_err() {
                    token.acknowledge();
                }
                i
            }
        })
        .unwrap();

        let err = join_group("group-test", &mut group, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::UnitTimedOut { ref unit, .. } if unit == "straggler-1"
        ));

        assert_eq!(
            group[1].join_timeout(Duration::from_secs(5)).unwrap(),
            Joined::Finished(1)
        );
        assert!(group[1].cancellation_observed());
    }

    #[test]
    fn group_join_collects_in_spawn_order() {
        let mut group = spawn_group("ordered", 4, |i| move |_: CancellationToken| i * 10).unwrap();
        let values = join_group("group-test", &mut group, Duration::from_secs(5)).unwrap();
        assert_eq!(values, vec![0, 10, 20, 30]);
    }

    #[test]
    fn gate_releases_waiters_once_opened() {
        let gate = StartGate::new();
        let mut group = spawn_group("gated", 3, |_| {
            let gate = gate.clone();
            move |token: CancellationToken| gate.wait(&token).is_ok()
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(group.iter().all(|unit| unit.is_alive()));

        gate.open();
        let released = join_group("gate-test", &mut group, Duration::from_secs(5)).unwrap();
        assert_eq!(released, vec![true; 3]);
    }

    #[test]
    fn cancelled_waiter_leaves_a_closed_gate() {
        let gate = StartGate::new();
        let waiter_gate = gate.clone();
        let mut unit = spawn("abandoned-waiter", move |token: CancellationToken| {
            waiter_gate.wait(&token)
        })
        .unwrap();

        unit.request_cancellation();
        assert_eq!(
            unit.join_timeout(Duration::from_secs(5)).unwrap(),
            Joined::Finished(Err(Cancelled))
        );
    }

    #[test]
    fn panicking_unit_is_reported() {
        let mut unit: UnitHandle<()> = spawn("doomed", |_| panic!("boom")).unwrap();
        assert!(matches!(
            unit.join_timeout(Duration::from_secs(5)),
            Err(HarnessError::UnitPanicked { .. })
        ));
    }
}
