//! # Graceful shutdown
//!
//! [`ShutdownCoordinator`] owns a worker unit and a guarded
//! [`VisibilityFlag`]. The worker checks the flag before every unit of work
//! and stops once it sees it set; the controller raises the flag once and
//! waits, with a bound, for the worker to finish.
//!
//! The worker also stops when its [`CancellationToken`] fires, whether it
//! notices between iterations or while blocked inside the work. In that case
//! it acknowledges the cancellation before returning, so the controller can
//! tell a cancelled worker from one that saw the shutdown flag.
//!
//! Dropping a coordinator whose worker was never joined requests shutdown
//! and cancels the worker, so an early return or a panic in the controller
//! does not leave the worker looping forever.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Cancelled, HarnessError, Result};
use crate::flag::VisibilityFlag;
use crate::unit::{self, current_unit, Joined, UnitHandle};
use crate::CancellationToken;

/// Why the worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Saw the shutdown flag before starting another unit of work.
    ShutdownObserved,
    /// Its cancellation token fired, between or during units of work.
    Cancelled,
}

/// What the worker loop did. Only available once the worker has been joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub iterations: u64,
    pub exit: ExitReason,
}

/// Lifecycle of a coordinated worker, as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    /// Shutdown requested, worker not finished yet.
    Stopping,
    Terminated,
}

/// Parameters of [`ShutdownCoordinator::run`].
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Length of one unit of simulated work.
    pub work_interval: Duration,
    /// How long [`ShutdownCoordinator::run`] lets the worker run.
    pub run_for: Duration,
    /// Bound on the wait after the shutdown request.
    pub termination_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            work_interval: Duration::from_millis(100),
            run_for: Duration::from_millis(1000),
            termination_timeout: Duration::from_secs(2),
        }
    }
}

impl ShutdownConfig {
    /// Short intervals for tests.
    pub fn quick() -> Self {
        Self {
            work_interval: Duration::from_millis(20),
            run_for: Duration::from_millis(200),
            termination_timeout: Duration::from_secs(2),
        }
    }
}

/// Controller side of a worker loop stopped by a guarded flag.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use visibility_harness::{ExitReason, ShutdownCoordinator};
///
/// let mut coordinator = ShutdownCoordinator::start("demo", "ticker", |token| {
///     token.sleep(Duration::from_millis(5))
/// })?;
/// let report = coordinator.shutdown(Duration::from_secs(2))?;
/// assert_eq!(report.exit, ExitReason::ShutdownObserved);
/// # Ok::<(), visibility_harness::HarnessError>(())
/// ```
#[derive(Debug)]
pub struct ShutdownCoordinator {
    experiment: String,
    requested: Arc<VisibilityFlag>,
    worker: UnitHandle<WorkerReport>,
    report: Option<WorkerReport>,
}

impl ShutdownCoordinator {
    /// Spawns a worker named `name` that calls `work` once per iteration
    /// until shutdown is requested or the worker is cancelled. Both sides log
    /// under `experiment`.
    pub fn start<W>(experiment: impl Into<String>, name: impl Into<String>, mut work: W) -> Result<Self>
    where
        W: FnMut(&CancellationToken) -> Result<(), Cancelled> + Send + 'static,
    {
        let experiment = experiment.into();
        let requested = Arc::new(VisibilityFlag::guarded(false));
        let flag = Arc::clone(&requested);
        let worker_experiment = experiment.clone();
        let worker = unit::spawn(name, move |token: CancellationToken| {
            worker_loop(&worker_experiment, &flag, &token, &mut work)
        })?;

        Ok(Self {
            experiment,
            requested,
            worker,
            report: None,
        })
    }

    /// A worker whose unit of work is a cancellable sleep of `interval`.
    pub fn start_sleeping(interval: Duration) -> Result<Self> {
        Self::start("shutdown/graceful", "worker", move |token| token.sleep(interval))
    }

    /// Starts a sleeping worker, lets it run for `config.run_for`, then shuts
    /// it down. Fails with [`HarnessError::ShutdownTimedOut`] if the worker
    /// does not stop within `config.termination_timeout`.
    pub fn run(config: &ShutdownConfig) -> Result<WorkerReport> {
        let mut coordinator = Self::start_sleeping(config.work_interval)?;
        thread::sleep(config.run_for);
        coordinator.shutdown(config.termination_timeout)
    }

    /// Raises the shutdown flag. Calling it again changes nothing.
    pub fn request_shutdown(&self) {
        if self.requested.raise() {
            info!(
                experiment = %self.experiment,
                unit = %current_unit(),
                worker = self.worker.name(),
                "shutdown requested"
            );
        } else {
            debug!(
                experiment = %self.experiment,
                unit = %current_unit(),
                worker = self.worker.name(),
                "shutdown already requested"
            );
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.requested.read()
    }

    /// Sends the worker a cancellation instead of a shutdown request.
    pub fn cancel_worker(&self) {
        self.worker.request_cancellation();
    }

    /// Waits up to `timeout` for the worker to finish. `true` means it has
    /// terminated; `false` means it was still running when time ran out,
    /// which is reported rather than hidden.
    pub fn wait_for_termination(&mut self, timeout: Duration) -> Result<bool> {
        if self.report.is_some() {
            return Ok(true);
        }

        match self.worker.join_timeout(timeout)? {
            Joined::Finished(report) => {
                debug!(experiment = %self.experiment, worker = self.worker.name(), ?report, "worker joined");
                self.report = Some(report);
                Ok(true)
            }
            Joined::TimedOut => {
                warn!(
                    experiment = %self.experiment,
                    worker = self.worker.name(),
                    ?timeout,
                    requested = self.shutdown_requested(),
                    "worker still running after the wait"
                );
                Ok(false)
            }
        }
    }

    /// Requests shutdown and waits for it, failing on timeout.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<WorkerReport> {
        self.request_shutdown();
        if !self.wait_for_termination(timeout)? {
            return Err(HarnessError::ShutdownTimedOut {
                unit: self.worker.name().to_owned(),
                timeout,
            });
        }
        self.report.ok_or_else(|| HarnessError::AlreadyJoined {
            unit: self.worker.name().to_owned(),
        })
    }

    /// The worker's report, once it has been joined.
    pub fn report(&self) -> Option<WorkerReport> {
        self.report
    }

    /// Iterations completed by the worker, once it has been joined.
    pub fn iteration_count(&self) -> Option<u64> {
        self.report.map(|r| r.iterations)
    }

    pub fn cancellation_observed(&self) -> bool {
        self.worker.cancellation_observed()
    }

    /// Derived from the join state, the flag and whether the thread is alive.
    pub fn state(&self) -> ShutdownState {
        if self.report.is_some() || !self.worker.is_alive() {
            ShutdownState::Terminated
        } else if self.shutdown_requested() {
            ShutdownState::Stopping
        } else {
            ShutdownState::Running
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        if self.report.is_none() && self.worker.is_alive() {
            warn!(
                experiment = %self.experiment,
                worker = self.worker.name(),
                "coordinator dropped before the worker was joined, stopping it"
            );
            self.request_shutdown();
            self.cancel_worker();
        }
    }
}

fn worker_loop<W>(
    experiment: &str,
    requested: &VisibilityFlag,
    token: &CancellationToken,
    work: &mut W,
) -> WorkerReport
where
    W: FnMut(&CancellationToken) -> Result<(), Cancelled>,
{
    info!(experiment, unit = %current_unit(), "worker started");

    let mut iterations: u64 = 0;
    let exit = loop {
        if requested.read() {
            break ExitReason::ShutdownObserved;
        }
        if token.is_cancelled() || work(token).is_err() {
            break ExitReason::Cancelled;
        }
        iterations += 1;
    };

    match exit {
        ExitReason::ShutdownObserved => {
            info!(experiment, unit = %current_unit(), iterations, "shutdown observed, worker stopping");
        }
        ExitReason::Cancelled => {
            token.acknowledge();
            warn!(experiment, unit = %current_unit(), iterations, "worker cancelled, stopping early");
        }
    }
    WorkerReport { iterations, exit }
}
