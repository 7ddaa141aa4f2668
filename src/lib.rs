//! # visibility-harness
//!
//! Reproducible experiments on shared-memory concurrency: whether a write by
//! one thread becomes visible to another, what a non-atomic increment loses,
//! how double-checked locking publishes a lazily built value, and how a
//! worker loop is shut down cooperatively.
//!
//! The crate provides:
//!
//! - [`VisibilityFlag`] and [`VisibilityExperiment`]: a flag with or without
//!   a happens-before [`Guarantee`], and readers racing writers on it.
//! - [`RaceCounter`] and [`RaceExperiment`]: the lost-update race.
//! - [`LazySingleton`] and [`SingletonExperiment`]: double-checked locking.
//! - [`ShutdownCoordinator`]: a worker loop stopped by a guarded flag or by
//!   cancellation.
//!
//! All of them run on execution units from [`unit::spawn`]: named threads
//! carrying a [`CancellationToken`], joined with an explicit bound. A unit
//! still running when its bound expires is reported as data, so the
//! experiments that are *expected* not to converge can never hang the caller.
//! Groups of units are started together behind a [`StartGate`] and joined
//! against one shared deadline with [`unit::join_group`].
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use visibility_harness::{
//!     Guarantee, LazySingleton, RaceConfig, RaceExperiment, Verdict, VisibilityConfig,
//!     VisibilityExperiment,
//! };
//!
//! let report = VisibilityExperiment::new(VisibilityConfig::quick(Guarantee::Visible)).run()?;
//! assert_eq!(report.verdict()?, Verdict::Held);
//!
//! let race = RaceExperiment::new(RaceConfig::default()).run()?;
//! assert!(race.in_bounds());
//!
//! let settings = LazySingleton::new();
//! assert_eq!(*settings.get_or_init(|| 42), 42);
//! # Ok::<(), visibility_harness::HarnessError>(())
//! ```
//!
//! ## Logging
//!
//! Every state transition is logged through [`tracing`] with the experiment
//! name and the thread (`unit`) that made it. Install any subscriber to see
//! them; the bundled binary uses `tracing_subscriber::fmt` with `RUST_LOG`.
//!
//! ## Modules
//!
//! - [`backoff`]: exponential backoff for polling loops.
//! - [`spinlock`]: the lock behind [`LazySingleton`].
//! - [`cancel`]: cooperative cancellation.
//! - [`unit`]: execution units with bounded joins.
//! - [`flag`], [`counter`], [`singleton`], [`shutdown`]: the experiments.
//! - [`error`]: [`HarnessError`] and [`Cancelled`].

pub mod backoff;
pub mod cancel;
pub mod counter;
pub mod error;
pub mod flag;
pub mod shutdown;
pub mod singleton;
pub mod spinlock;
pub mod unit;

pub use backoff::BackOff;
pub use cancel::CancellationToken;
pub use counter::{RaceConfig, RaceCounter, RaceExperiment, RaceReport};
pub use error::{Cancelled, HarnessError, Result};
pub use flag::{
    Guarantee, ReaderOutcome, ReaderReport, Verdict, VisibilityConfig, VisibilityExperiment,
    VisibilityFlag, VisibilityReport, PUBLISHED_PAYLOAD,
};
pub use shutdown::{ExitReason, ShutdownConfig, ShutdownCoordinator, ShutdownState, WorkerReport};
pub use singleton::{
    ExpensiveResource, InitState, LazySingleton, SingletonConfig, SingletonExperiment,
    SingletonReport,
};
pub use spinlock::SpinLock;
pub use unit::{Joined, StartGate, UnitHandle};

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
