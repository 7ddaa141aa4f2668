//! # Visibility flags
//!
//! A [`VisibilityFlag`] is a boolean shared between execution units, built
//! with one of two [`Guarantee`] levels:
//!
//! - [`Guarantee::Visible`] writes with `Release` and reads with `Acquire`.
//!   A reader that observes a write also observes everything the writer did
//!   before it, so the write/read pair is a happens-before edge.
//! - [`Guarantee::None`] uses `Relaxed` for both. The flag itself is still
//!   free of data races, but no edge is created: a reader may keep seeing the
//!   old value for an unspecified time, and even after it sees the new one it
//!   may see stale versions of the writer's other stores.
//!
//! [`VisibilityExperiment`] drives readers spinning on a flag against writers
//! that flip it after a delay, bounding every wait so the unguarded variant
//! can never hang the caller.
//!
//! ```rust,no_run
//! use visibility_harness::{Guarantee, Verdict, VisibilityConfig, VisibilityExperiment};
//!
//! let config = VisibilityConfig::quick(Guarantee::Visible);
//! let report = VisibilityExperiment::new(config).run()?;
//! assert_eq!(report.verdict()?, Verdict::Held);
//! # Ok::<(), visibility_harness::HarnessError>(())
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{HarnessError, Result};
use crate::unit::{self, current_unit, Joined, UnitHandle};
use crate::CancellationToken;

/// Value the writer publishes alongside the flag.
pub const PUBLISHED_PAYLOAD: u64 = 42;

/// Readers check their cancellation token once per this many spins.
const CANCEL_POLL_INTERVAL: u64 = 1 << 16;

/// How long a timed-out unit gets to honour its cancellation before it is
/// detached.
const CLEANUP_GRACE: Duration = Duration::from_millis(500);

/// Cross-thread visibility promised by a [`VisibilityFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Guarantee {
    /// No happens-before edge between a write and a later read.
    None,
    /// Every write happens-before any read that observes it.
    Visible,
}

impl Guarantee {
    #[inline(always)]
    fn store_ordering(self) -> Ordering {
        match self {
            Guarantee::None => Ordering::Relaxed,
            Guarantee::Visible => Ordering::Release,
        }
    }

    #[inline(always)]
    fn load_ordering(self) -> Ordering {
        match self {
            Guarantee::None => Ordering::Relaxed,
            Guarantee::Visible => Ordering::Acquire,
        }
    }

    #[inline(always)]
    fn swap_ordering(self) -> Ordering {
        match self {
            Guarantee::None => Ordering::Relaxed,
            Guarantee::Visible => Ordering::AcqRel,
        }
    }

    /// Short name used in experiment names and log fields.
    pub fn label(self) -> &'static str {
        match self {
            Guarantee::None => "unguarded",
            Guarantee::Visible => "guarded",
        }
    }
}

/// A boolean cell whose cross-thread visibility depends on its [`Guarantee`].
#[derive(Debug)]
pub struct VisibilityFlag {
    value: AtomicBool,
    guarantee: Guarantee,
}

impl VisibilityFlag {
    /// Creates a flag holding `initial` with the given guarantee.
    pub const fn new(initial: bool, guarantee: Guarantee) -> Self {
        Self {
            value: AtomicBool::new(initial),
            guarantee,
        }
    }

    /// Creates a [`Guarantee::Visible`] flag.
    ///
    /// # Example
    /// ```
    /// use visibility_harness::VisibilityFlag;
    ///
    /// let flag = VisibilityFlag::guarded(false);
    /// flag.write(true);
    /// assert!(flag.read());
    /// ```
    pub const fn guarded(initial: bool) -> Self {
        Self::new(initial, Guarantee::Visible)
    }

    /// Creates a [`Guarantee::None`] flag. Writes may stay invisible to
    /// other units for an unspecified time.
    pub const fn unguarded(initial: bool) -> Self {
        Self::new(initial, Guarantee::None)
    }

    /// The guarantee this flag was built with.
    pub fn guarantee(&self) -> Guarantee {
        self.guarantee
    }

    #[inline]
    pub fn write(&self, value: bool) {
        self.value.store(value, self.guarantee.store_ordering());
    }

    #[inline]
    pub fn read(&self) -> bool {
        self.value.load(self.guarantee.load_ordering())
    }

    /// Sets the flag to `true`, returning `true` only for the call that
    /// actually changed it.
    #[inline]
    pub fn raise(&self) -> bool {
        !self.value.swap(true, self.guarantee.swap_ordering())
    }
}

/// Parameters of one visibility run.
///
/// [`Default`] reproduces the classic demonstration: one reader, one writer
/// flipping the flag after a second, three seconds for the reader to notice.
#[derive(Debug, Clone)]
pub struct VisibilityConfig {
    /// Units spinning on the flag. Must be at least one.
    pub readers: usize,
    pub writers: usize,
    /// Time the writers wait before flipping the flag.
    pub writer_delay: Duration,
    /// Bound on the wait for readers once the writers are done.
    pub reader_timeout: Duration,
    pub guarantee: Guarantee,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            readers: 1,
            writers: 1,
            writer_delay: Duration::from_millis(1000),
            reader_timeout: Duration::from_millis(3000),
            guarantee: Guarantee::Visible,
        }
    }
}

impl VisibilityConfig {
    /// Short delays for unit tests.
    pub fn quick(guarantee: Guarantee) -> Self {
        Self {
            readers: 2,
            writers: 1,
            writer_delay: Duration::from_millis(100),
            reader_timeout: Duration::from_millis(2000),
            guarantee,
        }
    }

    pub fn with_guarantee(mut self, guarantee: Guarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    pub fn with_readers(mut self, readers: usize) -> Self {
        self.readers = readers;
        self
    }

    pub fn with_writers(mut self, writers: usize) -> Self {
        self.writers = writers;
        self
    }

    pub fn with_writer_delay(mut self, delay: Duration) -> Self {
        self.writer_delay = delay;
        self
    }

    pub fn with_reader_timeout(mut self, timeout: Duration) -> Self {
        self.reader_timeout = timeout;
        self
    }
}

/// What one reader had done when its bounded join returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderOutcome {
    /// Left its polling loop after `loop_count` spins and then read the
    /// payload.
    Terminated { loop_count: u64, payload_seen: u64 },
    /// Had not observed the write when the timeout elapsed.
    StillRunning,
}

/// Outcome of one reader, keyed by its unit name.
#[derive(Debug, Clone)]
pub struct ReaderReport {
    pub unit: String,
    pub outcome: ReaderOutcome,
}

/// Classification of a finished visibility run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Guarded flag: every reader saw the write and the payload.
    Held,
    /// Unguarded flag: some reader never saw the write. Expected, not an error.
    ExpectedNonConvergence,
    /// Unguarded flag: every reader happened to see the write anyway.
    ConvergedWithoutGuarantee,
}

/// Raw result of [`VisibilityExperiment::run`]; call
/// [`verdict`](VisibilityReport::verdict) to classify it.
#[derive(Debug, Clone)]
pub struct VisibilityReport {
    pub experiment: String,
    pub guarantee: Guarantee,
    pub reader_timeout: Duration,
    pub readers: Vec<ReaderReport>,
}

impl VisibilityReport {
    pub fn all_terminated(&self) -> bool {
        self.readers
            .iter()
            .all(|r| matches!(r.outcome, ReaderOutcome::Terminated { .. }))
    }

    /// Turns the raw outcomes into a [`Verdict`].
    ///
    /// On a guarded flag a reader still running is a liveness violation, and a
    /// reader that saw the flag but not the payload breaks happens-before.
    ///
    /// A report without readers, or a guarded one where a reader never spun
    /// before the write landed, demonstrates nothing and is
    /// [`HarnessError::Inconclusive`].
    pub fn verdict(&self) -> Result<Verdict> {
        if self.readers.is_empty() {
            return Err(HarnessError::Inconclusive {
                experiment: self.experiment.clone(),
                reason: "no reader took part".to_owned(),
            });
        }

        let stalled = self
            .readers
            .iter()
            .find(|r| r.outcome == ReaderOutcome::StillRunning);

        match (self.guarantee, stalled) {
            (Guarantee::Visible, Some(reader)) => Err(HarnessError::LivenessViolation {
                experiment: self.experiment.clone(),
                unit: reader.unit.clone(),
                timeout: self.reader_timeout,
            }),
            (Guarantee::Visible, None) => {
                for reader in &self.readers {
                    if let ReaderOutcome::Terminated {
                        loop_count,
                        payload_seen,
                    } = reader.outcome
                    {
                        if loop_count == 0 {
                            return Err(HarnessError::Inconclusive {
                                experiment: self.experiment.clone(),
                                reason: format!("`{}` never spun before the write", reader.unit),
                            });
                        }
                        if payload_seen != PUBLISHED_PAYLOAD {
                            return Err(HarnessError::HappensBeforeViolation {
                                experiment: self.experiment.clone(),
                                unit: reader.unit.clone(),
                                seen: payload_seen,
                            });
                        }
                    }
                }
                Ok(Verdict::Held)
            }
            (Guarantee::None, Some(_)) => Ok(Verdict::ExpectedNonConvergence),
            (Guarantee::None, None) => Ok(Verdict::ConvergedWithoutGuarantee),
        }
    }
}

struct Shared {
    flag: VisibilityFlag,
    payload: AtomicU64,
}

/// Readers spinning on a flag that writers flip after a delay.
#[derive(Debug)]
pub struct VisibilityExperiment {
    config: VisibilityConfig,
}

impl VisibilityExperiment {
    pub fn new(config: VisibilityConfig) -> Self {
        Self { config }
    }

    /// `visibility/guarded` or `visibility/unguarded`.
    pub fn name(&self) -> String {
        format!("visibility/{}", self.config.guarantee.label())
    }

    /// Runs the experiment. Returns once every unit has finished or been
    /// abandoned after its bound; never blocks indefinitely.
    ///
    /// Fails with [`HarnessError::InvalidConfig`] when no reader is
    /// configured.
    pub fn run(&self) -> Result<VisibilityReport> {
        let config = &self.config;
        let experiment = self.name();
        if config.readers == 0 {
            return Err(HarnessError::InvalidConfig {
                experiment,
                reason: "at least one reader is required",
            });
        }
        let initial = false;
        let shared = Arc::new(Shared {
            flag: VisibilityFlag::new(initial, config.guarantee),
            payload: AtomicU64::new(0),
        });

        info!(
            experiment = %experiment,
            readers = config.readers,
            writers = config.writers,
            writer_delay = ?config.writer_delay,
            reader_timeout = ?config.reader_timeout,
            "starting visibility experiment"
        );

        let mut readers = unit::spawn_group("reader", config.readers, |_| {
            let shared = Arc::clone(&shared);
            let experiment = experiment.clone();
            move |token: CancellationToken| poll_until_changed(&experiment, &shared, initial, &token)
        })?;

        let spawned = unit::spawn_group("writer", config.writers, |_| {
            let shared = Arc::clone(&shared);
            let experiment = experiment.clone();
            let delay = config.writer_delay;
            move |token: CancellationToken| {
                if token.sleep(delay).is_err() {
                    token.acknowledge();
                    warn!(experiment = %experiment, unit = %current_unit(), "writer cancelled before writing");
                    return false;
                }
                shared.payload.store(PUBLISHED_PAYLOAD, Ordering::Relaxed);
                shared.flag.write(!initial);
                info!(experiment = %experiment, unit = %current_unit(), value = !initial, "flag written");
                true
            }
        });
        let mut writers = match spawned {
            Ok(writers) => writers,
            Err(err) => {
                unit::cancel_all(&readers);
                return Err(err);
            }
        };

        let writer_bound = config.writer_delay + config.reader_timeout;
        for writer in &mut writers {
            if let Joined::TimedOut = writer.join_timeout(writer_bound)? {
                warn!(experiment = %experiment, unit = writer.name(), "writer did not finish in time");
                abandon(&experiment, writer)?;
            }
        }

        let deadline = Instant::now() + config.reader_timeout;
        let mut reports = Vec::with_capacity(readers.len());
        for reader in &mut readers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match reader.join_timeout(remaining)? {
                Joined::Finished(outcome) => outcome,
                Joined::TimedOut => {
                    match config.guarantee {
                        Guarantee::Visible => error!(
                            experiment = %experiment,
                            unit = reader.name(),
                            "reader still running on a guarded flag"
                        ),
                        Guarantee::None => info!(
                            experiment = %experiment,
                            unit = reader.name(),
                            "reader still running, write never became visible"
                        ),
                    }
                    abandon(&experiment, reader)?;
                    ReaderOutcome::StillRunning
                }
            };
            reports.push(ReaderReport {
                unit: reader.name().to_owned(),
                outcome,
            });
        }

        Ok(VisibilityReport {
            experiment,
            guarantee: config.guarantee,
            reader_timeout: config.reader_timeout,
            readers: reports,
        })
    }
}

fn poll_until_changed(
    experiment: &str,
    shared: &Shared,
    initial: bool,
    token: &CancellationToken,
) -> ReaderOutcome {
    info!(
        experiment,
        unit = %current_unit(),
        guarantee = shared.flag.guarantee().label(),
        "reader polling flag"
    );

    let mut loop_count: u64 = 0;
    while shared.flag.read() == initial {
        loop_count += 1;
        if loop_count % CANCEL_POLL_INTERVAL == 0 && token.is_cancelled() {
            token.acknowledge();
            info!(experiment, unit = %current_unit(), loop_count, "reader cancelled before seeing the write");
            return ReaderOutcome::StillRunning;
        }
    }

    let payload_seen = shared.payload.load(Ordering::Relaxed);
    info!(experiment, unit = %current_unit(), loop_count, payload_seen, "reader left polling loop");
    ReaderOutcome::Terminated {
        loop_count,
        payload_seen,
    }
}

/// Cancels a timed-out unit and gives it a short grace period. If it still
/// does not stop, the handle is dropped and the thread detached.
fn abandon<T>(experiment: &str, handle: &mut UnitHandle<T>) -> Result<()> {
    handle.request_cancellation();
    match handle.join_timeout(CLEANUP_GRACE)? {
        Joined::Finished(_) => {
            debug!(experiment, unit = handle.name(), cancelled = handle.cancellation_observed(), "timed-out unit stopped");
        }
        Joined::TimedOut => {
            warn!(experiment, unit = handle.name(), "timed-out unit ignored cancellation, detaching");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_write_then_read_on_one_thread() {
        for flag in [VisibilityFlag::guarded(false), VisibilityFlag::unguarded(false)] {
            assert!(!flag.read());
            flag.write(true);
            assert!(flag.read());
            flag.write(false);
            assert!(!flag.read());
        }
    }

    #[test]
    fn raise_reports_only_the_first_transition() {
        let flag = VisibilityFlag::guarded(false);
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(flag.read());
    }

    #[test]
    fn guarantee_levels_pick_orderings() {
        assert_eq!(Guarantee::Visible.store_ordering(), Ordering::Release);
        assert_eq!(Guarantee::Visible.load_ordering(), Ordering::Acquire);
        assert_eq!(Guarantee::None.store_ordering(), Ordering::Relaxed);
        assert_eq!(Guarantee::None.load_ordering(), Ordering::Relaxed);
    }

    #[test]
    fn guarded_readers_observe_write_and_payload() {
        crate::init_test_tracing();

        let report = VisibilityExperiment::new(VisibilityConfig::quick(Guarantee::Visible))
            .run()
            .unwrap();

        assert_eq!(report.readers.len(), 2);
        for reader in &report.readers {
            match reader.outcome {
                ReaderOutcome::Terminated {
                    loop_count,
                    payload_seen,
                } => {
                    assert!(loop_count > 0, "{} never spun", reader.unit);
                    assert_eq!(payload_seen, PUBLISHED_PAYLOAD);
                }
                ReaderOutcome::StillRunning => panic!("{} did not terminate", reader.unit),
            }
        }
        assert_eq!(report.verdict().unwrap(), Verdict::Held);
    }

    #[test]
    fn unguarded_run_is_bounded_whatever_the_outcome() {
        crate::init_test_tracing();

        let config = VisibilityConfig::quick(Guarantee::None)
            .with_reader_timeout(Duration::from_millis(300));
        let bound = config.writer_delay
            + config.reader_timeout
            + CLEANUP_GRACE * config.readers as u32
            + Duration::from_secs(2);

        let start = Instant::now();
        let report = VisibilityExperiment::new(config).run().unwrap();
        assert!(start.elapsed() < bound, "harness exceeded its own bound");

        assert!(matches!(
            report.verdict().unwrap(),
            Verdict::ExpectedNonConvergence | Verdict::ConvergedWithoutGuarantee
        ));
    }

    fn report_with(guarantee: Guarantee, outcome: ReaderOutcome) -> VisibilityReport {
        VisibilityReport {
            experiment: format!("visibility/{}", guarantee.label()),
            guarantee,
            reader_timeout: Duration::from_secs(3),
            readers: vec![ReaderReport {
                unit: "reader-0".into(),
                outcome,
            }],
        }
    }

    #[test]
    fn verdict_classifies_each_combination() {
        let done = ReaderOutcome::Terminated {
            loop_count: 10,
            payload_seen: PUBLISHED_PAYLOAD,
        };

        assert!(matches!(
            report_with(Guarantee::Visible, ReaderOutcome::StillRunning).verdict(),
            Err(HarnessError::LivenessViolation { unit, .. }) if unit == "reader-0"
        ));
        assert_eq!(report_with(Guarantee::Visible, done).verdict().unwrap(), Verdict::Held);
        assert_eq!(
            report_with(Guarantee::None, ReaderOutcome::StillRunning).verdict().unwrap(),
            Verdict::ExpectedNonConvergence
        );
        assert_eq!(
            report_with(Guarantee::None, done).verdict().unwrap(),
            Verdict::ConvergedWithoutGuarantee
        );
    }

    #[test]
    fn run_without_readers_is_rejected() {
        let config = VisibilityConfig::quick(Guarantee::Visible).with_readers(0);
        assert!(matches!(
            VisibilityExperiment::new(config).run(),
            Err(HarnessError::InvalidConfig { experiment, .. }) if experiment == "visibility/guarded"
        ));
    }

    #[test]
    fn empty_report_has_no_verdict() {
        for guarantee in [Guarantee::Visible, Guarantee::None] {
            let mut report = report_with(guarantee, ReaderOutcome::StillRunning);
            report.readers.clear();
            assert!(matches!(
                report.verdict(),
                Err(HarnessError::Inconclusive { .. })
            ));
        }
    }

    #[test]
    fn guarded_reader_that_never_spun_is_inconclusive() {
        let instant = ReaderOutcome::Terminated {
            loop_count: 0,
            payload_seen: PUBLISHED_PAYLOAD,
        };
        assert!(matches!(
            report_with(Guarantee::Visible, instant).verdict(),
            Err(HarnessError::Inconclusive { reason, .. }) if reason.contains("reader-0")
        ));
    }

    #[test]
    fn stale_payload_on_guarded_flag_is_a_violation() {
        let stale = ReaderOutcome::Terminated {
            loop_count: 3,
            payload_seen: 0,
        };
        assert!(matches!(
            report_with(Guarantee::Visible, stale).verdict(),
            Err(HarnessError::HappensBeforeViolation { seen: 0, .. })
        ));
        // Without the guarantee a stale payload is allowed.
        assert_eq!(
            report_with(Guarantee::None, stale).verdict().unwrap(),
            Verdict::ConvergedWithoutGuarantee
        );
    }
}
